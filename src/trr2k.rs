//! Triangular rank-2k update.
//!
//! Computes `E := alpha (A B + op(C) op(D)) + beta E` on one triangle of the
//! square matrix `E`, where `A B` multiplies untransposed panels and `op` is
//! an independent transpose or conjugate-transpose for `C` and for `D`. The
//! shared inner dimension is walked in panels; each panel is redistributed
//! into four copies aligned with `E` (rows replicated against `E`'s columns
//! or columns against its rows), after which the triangular accumulation is
//! entirely local and needs no fold.

use std::sync::Arc;

use tracing::debug;

use crate::blocked::{panels, require_square};
use crate::comm::Comm;
use crate::dense::DistMatrix;
use crate::dist::{Dist, DistDesc};
use crate::error::{Error, Result};
use crate::field::Field;
use crate::kernels::{Orient, UpLo};
use crate::redist;

fn require_standard<T: Field, C: Comm>(m: &DistMatrix<T, C>, what: &str) -> Result<()> {
    let d = m.desc();
    if d.row_dist != Dist::GridRows || d.col_dist != Dist::GridCols {
        return Err(Error::InvalidDistribution(format!(
            "{what} must use the standard grid distribution"
        )));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn trr2k<T: Field, C: Comm>(
    uplo: UpLo,
    orient_c: Orient,
    orient_d: Orient,
    alpha: T,
    a: &DistMatrix<T, C>,
    b: &DistMatrix<T, C>,
    c: &DistMatrix<T, C>,
    d: &DistMatrix<T, C>,
    beta: T,
    e: &mut DistMatrix<T, C>,
    blocksize: usize,
) -> Result<()> {
    require_square(e)?;
    let n = e.height();
    let r = a.width();
    if !orient_c.is_transposed() || !orient_d.is_transposed() {
        return Err(Error::Nonconformal(
            "the second product's operands must be transposed".to_string(),
        ));
    }
    if a.height() != n
        || b.height() != r
        || b.width() != n
        || c.height() != r
        || c.width() != n
        || d.height() != n
        || d.width() != r
    {
        return Err(Error::Nonconformal(format!(
            "rank-2k operands do not conform: E {n}x{n}, A {}x{}, B {}x{}, C {}x{}, D {}x{}",
            a.height(),
            a.width(),
            b.height(),
            b.width(),
            c.height(),
            c.width(),
            d.height(),
            d.width()
        )));
    }
    for (m, what) in [
        (&*a, "A"),
        (b, "B"),
        (c, "C"),
        (d, "D"),
        (&*e, "E"),
    ] {
        require_standard(m, what)?;
    }
    let grid = Arc::clone(e.grid());
    let ed = e.desc();

    let in_triangle = |gi: usize, gj: usize| match uplo {
        UpLo::Lower => gi >= gj,
        UpLo::Upper => gi <= gj,
    };

    // beta is applied once, up front, and only inside the updated triangle;
    // the opposite triangle is never touched. Panels then accumulate.
    for lj in 0..e.local().width() {
        let gj = e.global_col(lj);
        for li in 0..e.local().height() {
            let gi = e.global_row(li);
            if in_triangle(gi, gj) {
                e.local_mut().update(li, lj, |v| beta * v);
            }
        }
    }

    let a_desc = DistDesc::new(Dist::GridRows, Dist::Star, ed.row_align, 0, &grid)?;
    let bt_desc = DistDesc::new(Dist::GridCols, Dist::Star, ed.col_align, 0, &grid)?;
    let c_desc = DistDesc::new(Dist::Star, Dist::GridRows, 0, ed.row_align, &grid)?;
    let dt_desc = DistDesc::new(Dist::Star, Dist::GridCols, 0, ed.col_align, &grid)?;

    for panel in panels(r, blocksize)? {
        let (k, nb) = (panel.k, panel.nb);
        debug!(k, nb, "rank-2k panel");

        let mut a1 = DistMatrix::new(Arc::clone(&grid), a_desc, n, nb);
        a1.copy_from(&a.extract_region(0, k, n, nb))?;
        let mut b1t = DistMatrix::new(Arc::clone(&grid), bt_desc, n, nb);
        b1t.copy_from(&redist::transpose_flip(&b.extract_region(k, 0, nb, n)))?;
        let mut c1 = DistMatrix::new(Arc::clone(&grid), c_desc, nb, n);
        c1.copy_from(&c.extract_region(k, 0, nb, n))?;
        let d1 = d.extract_region(0, k, n, nb);
        let mut d1t = DistMatrix::new(Arc::clone(&grid), dt_desc, nb, n);
        d1t.copy_from(&match orient_d {
            Orient::Adjoint => redist::adjoint_flip(&d1),
            _ => redist::transpose_flip(&d1),
        })?;

        for lj in 0..e.local().width() {
            let gj = e.global_col(lj);
            for li in 0..e.local().height() {
                let gi = e.global_row(li);
                if !in_triangle(gi, gj) {
                    continue;
                }
                let mut acc = T::zero();
                for t in 0..nb {
                    acc += a1.local().get(li, t) * b1t.local().get(lj, t);
                    acc += orient_c.apply(c1.local().get(t, li)) * d1t.local().get(t, lj);
                }
                e.local_mut().update(li, lj, |v| v + alpha * acc);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_threaded;
    use crate::grid::Grid;
    use crate::kernels;
    use crate::matrix::Matrix;
    use num_complex::Complex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_real(h: usize, w: usize, rng: &mut StdRng) -> Matrix<f64> {
        let mut m = Matrix::zeros(h, w);
        for j in 0..w {
            for i in 0..h {
                m.set(i, j, rng.gen_range(-1.0..1.0));
            }
        }
        m
    }

    fn random_complex(h: usize, w: usize, rng: &mut StdRng) -> Matrix<Complex<f64>> {
        let mut m = Matrix::zeros(h, w);
        for j in 0..w {
            for i in 0..h {
                m.set(
                    i,
                    j,
                    Complex::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)),
                );
            }
        }
        m
    }

    fn dense_reference<T: Field>(
        orient_c: Orient,
        orient_d: Orient,
        alpha: T,
        a: &Matrix<T>,
        b: &Matrix<T>,
        c: &Matrix<T>,
        d: &Matrix<T>,
        beta: T,
        e: &Matrix<T>,
    ) -> Matrix<T> {
        let mut out = e.clone();
        kernels::scale(beta, &mut out);
        kernels::gemm(alpha, Orient::Normal, a, Orient::Normal, b, T::one(), &mut out);
        kernels::gemm(alpha, orient_c, c, orient_d, d, T::one(), &mut out);
        out
    }

    #[test]
    fn real_update_matches_dense_reference() {
        run_threaded(6, |comm| {
            let grid = Arc::new(Grid::new(comm, 2, 3).unwrap());
            let (n, r) = (6, 5);
            let mut rng = StdRng::seed_from_u64(41);
            let af = random_real(n, r, &mut rng);
            let bf = random_real(r, n, &mut rng);
            let cf = random_real(r, n, &mut rng);
            let df = random_real(n, r, &mut rng);
            let ef = random_real(n, n, &mut rng);

            let std = DistDesc::standard();
            let a = DistMatrix::from_replicated(Arc::clone(&grid), std, &af);
            let b = DistMatrix::from_replicated(Arc::clone(&grid), std, &bf);
            let c = DistMatrix::from_replicated(Arc::clone(&grid), std, &cf);
            let d = DistMatrix::from_replicated(Arc::clone(&grid), std, &df);
            let mut e = DistMatrix::from_replicated(Arc::clone(&grid), std, &ef);

            trr2k(
                UpLo::Lower,
                Orient::Transpose,
                Orient::Transpose,
                2.0,
                &a,
                &b,
                &c,
                &d,
                0.5,
                &mut e,
                2,
            )
            .unwrap();

            let want = dense_reference(
                Orient::Transpose,
                Orient::Transpose,
                2.0,
                &af,
                &bf,
                &cf,
                &df,
                0.5,
                &ef,
            );
            let got = e.to_replicated();
            for j in 0..n {
                for i in 0..n {
                    let expect = if i >= j { want.get(i, j) } else { ef.get(i, j) };
                    assert!(
                        (got.get(i, j) - expect).abs() < 1e-10,
                        "({i},{j}): {} vs {expect}",
                        got.get(i, j)
                    );
                }
            }
        });
    }

    #[test]
    fn complex_adjoint_orientations_upper() {
        run_threaded(4, |comm| {
            let grid = Arc::new(Grid::new(comm, 2, 2).unwrap());
            let (n, r) = (5, 4);
            let mut rng = StdRng::seed_from_u64(42);
            let af = random_complex(n, r, &mut rng);
            let bf = random_complex(r, n, &mut rng);
            let cf = random_complex(r, n, &mut rng);
            let df = random_complex(n, r, &mut rng);
            let ef = random_complex(n, n, &mut rng);

            let std = DistDesc::standard();
            let a = DistMatrix::from_replicated(Arc::clone(&grid), std, &af);
            let b = DistMatrix::from_replicated(Arc::clone(&grid), std, &bf);
            let c = DistMatrix::from_replicated(Arc::clone(&grid), std, &cf);
            let d = DistMatrix::from_replicated(Arc::clone(&grid), std, &df);
            let mut e = DistMatrix::from_replicated(Arc::clone(&grid), std, &ef);

            let one = Complex::new(1.0, 0.0);
            trr2k(
                UpLo::Upper,
                Orient::Adjoint,
                Orient::Adjoint,
                one,
                &a,
                &b,
                &c,
                &d,
                one,
                &mut e,
                3,
            )
            .unwrap();

            let want = dense_reference(
                Orient::Adjoint,
                Orient::Adjoint,
                one,
                &af,
                &bf,
                &cf,
                &df,
                one,
                &ef,
            );
            let got = e.to_replicated();
            for j in 0..n {
                for i in 0..n {
                    let expect = if i <= j { want.get(i, j) } else { ef.get(i, j) };
                    assert!((got.get(i, j) - expect).norm() < 1e-10);
                }
            }
        });
    }

    #[test]
    fn rejects_nonconformal_operands() {
        run_threaded(4, |comm| {
            let grid = Arc::new(Grid::new(comm, 2, 2).unwrap());
            let a = DistMatrix::<f64, _>::standard(Arc::clone(&grid), 4, 3);
            let b = DistMatrix::standard(Arc::clone(&grid), 3, 4);
            let c = DistMatrix::standard(Arc::clone(&grid), 3, 4);
            let d = DistMatrix::standard(Arc::clone(&grid), 4, 2);
            let mut e = DistMatrix::standard(Arc::clone(&grid), 4, 4);
            assert!(matches!(
                trr2k(
                    UpLo::Lower,
                    Orient::Transpose,
                    Orient::Transpose,
                    1.0,
                    &a,
                    &b,
                    &c,
                    &d,
                    1.0,
                    &mut e,
                    2
                ),
                Err(Error::Nonconformal(_))
            ));
        });
    }
}
