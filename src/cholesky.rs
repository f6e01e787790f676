//! Blocked distributed Cholesky factorization (upper variant).
//!
//! Overwrites the upper triangle of a Hermitian positive-definite matrix
//! with its Cholesky factor `U` (`A = U^H U`). The algorithm requires a
//! square process grid: the panel's row-replicated copy over grid columns is
//! turned into one over grid rows with a single pairwise exchange between
//! transpose-partner processes, instead of a broadcast chain.
//!
//! Per panel:
//! 1. gather the diagonal block everywhere and factor it sequentially;
//! 2. solve the panel to its right under a linear (row-major) column cycle,
//!    so the triangular solves spread over all processes;
//! 3. all-gather the solved panel within grid columns, transpose-exchange
//!    it, and apply the rank-`nb` trailing update locally on the upper
//!    triangle;
//! 4. write the solved panel back with a pure local pick.
//!
//! [`cholesky_qr`] reuses the sequential kernel for a thin QR of tall-skinny
//! matrices via their Gram matrix; it runs on any grid shape.

use std::sync::Arc;

use tracing::debug;

use crate::blocked::{panels, require_square};
use crate::comm::Comm;
use crate::dense::DistMatrix;
use crate::dist::{Dist, DistDesc};
use crate::error::{Error, Result};
use crate::field::Field;
use crate::kernels::{self, DiagKind, Orient, Side, UpLo};
use crate::matrix::Matrix;
use crate::redist;

pub fn cholesky<T: Field, C: Comm>(a: &mut DistMatrix<T, C>, blocksize: usize) -> Result<()> {
    require_square(a)?;
    let grid = Arc::clone(a.grid());
    if !grid.is_square() {
        return Err(Error::NonSquareGrid {
            rows: grid.height(),
            cols: grid.width(),
        });
    }
    let d = a.desc();
    if d.row_dist != Dist::GridRows || d.col_dist != Dist::GridCols {
        return Err(Error::InvalidDistribution(
            "cholesky expects the standard grid distribution".to_string(),
        ));
    }
    let r = grid.height();
    // The exchange partner holds this process's role-swapped panel slice; it
    // is fixed for the whole factorization.
    let partner = grid.transpose_rank(
        d.row_align,
        d.col_align,
        d.row_shift(&grid),
        d.col_shift(&grid),
    )?;

    let n = a.height();
    for panel in panels(n, blocksize)? {
        let (k, nb, end) = (panel.k, panel.nb, panel.end);
        debug!(k, nb, "cholesky panel");

        let a11 = a.extract_region(k, k, nb, nb);
        let mut a11_repl = a11.to_replicated();
        kernels::cholesky_upper(&mut a11_repl, k)?;
        a.write_region(
            k,
            k,
            &DistMatrix::from_replicated(Arc::clone(&grid), a11.desc(), &a11_repl),
        );

        if end == n {
            continue;
        }
        let trailing_row_align = (d.row_align + end) % r;
        let trailing_col_align = (d.col_align + end) % r;

        // Panel solve under the linear column cycle.
        let a12 = a.extract_region(k, end, nb, n - end);
        let vr = DistDesc::new(
            Dist::Star,
            Dist::LinearRowMajor,
            0,
            trailing_col_align,
            &grid,
        )?;
        let mut a12_vr = DistMatrix::new(Arc::clone(&grid), vr, nb, n - end);
        a12_vr.copy_from(&a12)?;
        kernels::trsm(
            Side::Left,
            UpLo::Upper,
            Orient::Adjoint,
            DiagKind::NonUnit,
            T::one(),
            &a11_repl,
            a12_vr.local_mut(),
        );

        // Row-replicated copies for the trailing update: one cycling over
        // grid columns, the partner-exchanged one over grid rows.
        let mr = DistDesc::new(Dist::Star, Dist::GridCols, 0, trailing_col_align, &grid)?;
        let mut a12_mr = DistMatrix::new(Arc::clone(&grid), mr, nb, n - end);
        a12_mr.copy_from(&a12_vr)?;
        let a12_mc = redist::transpose_exchange(&a12_mr, trailing_row_align, partner)?;

        // A22 := A22 - A12^H A12, upper triangle only, all terms local.
        let (r0, r1) = a.local_row_range(end, n);
        let (c0, c1) = a.local_col_range(end, n);
        for lj in c0..c1 {
            let gj = a.global_col(lj);
            for li in r0..r1 {
                let gi = a.global_row(li);
                if gi > gj {
                    continue;
                }
                let mut acc = T::zero();
                for l in 0..nb {
                    acc += a12_mc.local().get(l, li - r0).conj() * a12_mr.local().get(l, lj - c0);
                }
                a.local_mut().update(li, lj, |v| v - acc);
            }
        }

        // The solved panel's rows are replicated in a12_mr, so the write
        // back is a local pick.
        let mut a12_new = DistMatrix::new(Arc::clone(&grid), a12.desc(), nb, n - end);
        a12_new.copy_from(&a12_mr)?;
        a.write_region(k, end, &a12_new);
    }
    Ok(())
}

/// Thin QR by the Cholesky method: for `A` with at least as many rows as
/// columns, overwrites `A` with the orthonormal factor `Q` and returns the
/// upper-triangular `R` (`A = Q R`), replicated on every process.
///
/// The Gram matrix `A^H A` is accumulated from per-process partials under a
/// linear row cycle, factored sequentially everywhere, and `Q := A inv(R)`
/// is applied locally. Much less numerically stable than Householder QR;
/// intended for tall-skinny, well-conditioned matrices.
pub fn cholesky_qr<T: Field, C: Comm>(a: &mut DistMatrix<T, C>) -> Result<Matrix<T>> {
    let d = a.desc();
    if d.row_dist != Dist::GridRows || d.col_dist != Dist::GridCols {
        return Err(Error::InvalidDistribution(
            "cholesky_qr expects the standard grid distribution".to_string(),
        ));
    }
    let (m, n) = (a.height(), a.width());
    if m < n {
        return Err(Error::Nonconformal(format!(
            "thin QR needs height >= width, got {m}x{n}"
        )));
    }
    let grid = Arc::clone(a.grid());
    let vc = DistDesc::new(Dist::LinearColMajor, Dist::Star, d.row_align, 0, &grid)?;
    let mut a_vc = DistMatrix::new(Arc::clone(&grid), vc, m, n);
    a_vc.copy_from(a)?;

    // The linear cycle partitions the rows, so the local Gram partials sum
    // to A^H A over the whole communicator.
    let mut partial = Matrix::zeros(n, n);
    kernels::gemm(
        T::one(),
        Orient::Adjoint,
        a_vc.local(),
        Orient::Normal,
        a_vc.local(),
        T::zero(),
        &mut partial,
    );
    let mut gram = Matrix::zeros(n, n);
    for shard in grid.world().all_gather(partial.data()) {
        for (idx, v) in shard.into_iter().enumerate() {
            gram.update(idx % n, idx / n, |x| x + v);
        }
    }
    kernels::cholesky_upper(&mut gram, 0)?;
    let mut r = Matrix::zeros(n, n);
    for j in 0..n {
        for i in 0..=j {
            r.set(i, j, gram.get(i, j));
        }
    }
    kernels::trsm(
        Side::Right,
        UpLo::Upper,
        Orient::Normal,
        DiagKind::NonUnit,
        T::one(),
        &r,
        a_vc.local_mut(),
    );
    a.copy_from(&a_vc)?;
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_threaded;
    use crate::grid::Grid;
    use crate::matrix::Matrix;
    use num_complex::Complex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Hermitian positive-definite test matrix, identical on every process.
    fn spd(n: usize, seed: u64) -> Matrix<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut b = Matrix::zeros(n, n);
        for j in 0..n {
            for i in 0..n {
                b.set(i, j, rng.gen_range(-1.0..1.0));
            }
        }
        let mut a = Matrix::zeros(n, n);
        kernels::gemm(1.0, Orient::Adjoint, &b, Orient::Normal, &b, 0.0, &mut a);
        for i in 0..n {
            a.update(i, i, |v| v + n as f64);
        }
        a
    }

    fn assert_upper_close(got: &Matrix<f64>, want: &Matrix<f64>) {
        for j in 0..want.width() {
            for i in 0..=j {
                assert!(
                    (got.get(i, j) - want.get(i, j)).abs() < 1e-9,
                    "({i},{j}): {} vs {}",
                    got.get(i, j),
                    want.get(i, j)
                );
            }
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[test]
    fn matches_sequential_factorization() {
        init_tracing();
        run_threaded(4, |comm| {
            let grid = Arc::new(Grid::new(comm, 2, 2).unwrap());
            let full = spd(6, 7);
            let mut a =
                DistMatrix::from_replicated(Arc::clone(&grid), DistDesc::standard(), &full);
            cholesky(&mut a, 2).unwrap();

            let mut want = full.clone();
            kernels::cholesky_upper(&mut want, 0).unwrap();
            assert_upper_close(&a.to_replicated(), &want);
        });
    }

    #[test]
    fn blocksize_does_not_change_the_factor() {
        run_threaded(4, |comm| {
            let grid = Arc::new(Grid::new(comm, 2, 2).unwrap());
            let full = spd(7, 11);
            let mut reference = None;
            for bs in [1, 2, 3, 5, 7, 9] {
                let mut a =
                    DistMatrix::from_replicated(Arc::clone(&grid), DistDesc::standard(), &full);
                cholesky(&mut a, bs).unwrap();
                let gathered = a.to_replicated();
                match &reference {
                    None => reference = Some(gathered),
                    Some(want) => assert_upper_close(&gathered, want),
                }
            }
        });
    }

    #[test]
    fn complex_hermitian_case() {
        run_threaded(4, |comm| {
            let grid = Arc::new(Grid::new(comm, 2, 2).unwrap());
            let n = 5;
            let mut rng = StdRng::seed_from_u64(3);
            let mut b: Matrix<Complex<f64>> = Matrix::zeros(n, n);
            for j in 0..n {
                for i in 0..n {
                    b.set(
                        i,
                        j,
                        Complex::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)),
                    );
                }
            }
            let one = Complex::new(1.0, 0.0);
            let zero = Complex::new(0.0, 0.0);
            let mut full: Matrix<Complex<f64>> = Matrix::zeros(n, n);
            kernels::gemm(one, Orient::Adjoint, &b, Orient::Normal, &b, zero, &mut full);
            for i in 0..n {
                full.update(i, i, |v| v + Complex::new(n as f64, 0.0));
            }

            let mut a =
                DistMatrix::from_replicated(Arc::clone(&grid), DistDesc::standard(), &full);
            cholesky(&mut a, 2).unwrap();
            let mut want = full.clone();
            kernels::cholesky_upper(&mut want, 0).unwrap();
            let got = a.to_replicated();
            for j in 0..n {
                for i in 0..=j {
                    assert!((got.get(i, j) - want.get(i, j)).norm() < 1e-9);
                }
            }
        });
    }

    #[test]
    fn indefinite_matrix_reports_global_index() {
        run_threaded(4, |comm| {
            let grid = Arc::new(Grid::new(comm, 2, 2).unwrap());
            let mut full = spd(6, 5);
            full.set(4, 4, -100.0);
            let mut a =
                DistMatrix::from_replicated(Arc::clone(&grid), DistDesc::standard(), &full);
            let err = cholesky(&mut a, 2).unwrap_err();
            match err {
                Error::NotPositiveDefinite { index, .. } => assert_eq!(index, 4),
                other => panic!("unexpected error {other:?}"),
            }
        });
    }

    #[test]
    fn rejects_non_square_grid_and_zero_blocksize() {
        run_threaded(2, |comm| {
            let grid = Arc::new(Grid::new(comm, 2, 1).unwrap());
            let full = spd(4, 1);
            let mut a =
                DistMatrix::from_replicated(Arc::clone(&grid), DistDesc::standard(), &full);
            assert!(matches!(
                cholesky(&mut a, 2),
                Err(Error::NonSquareGrid { .. })
            ));
        });
        run_threaded(4, |comm| {
            let grid = Arc::new(Grid::new(comm, 2, 2).unwrap());
            let full = spd(4, 1);
            let mut a =
                DistMatrix::from_replicated(Arc::clone(&grid), DistDesc::standard(), &full);
            assert_eq!(cholesky(&mut a, 0), Err(Error::ZeroBlocksize));
        });
    }

    #[test]
    fn thin_qr_orthonormalizes_the_columns() {
        run_threaded(6, |comm| {
            let grid = Arc::new(Grid::new(comm, 2, 3).unwrap());
            let (m, n) = (9, 4);
            let mut rng = StdRng::seed_from_u64(23);
            let mut full = Matrix::zeros(m, n);
            for j in 0..n {
                for i in 0..m {
                    full.set(i, j, rng.gen_range(-1.0..1.0));
                }
            }
            // Diagonal boost keeps the Gram matrix well conditioned.
            for j in 0..n {
                full.update(j, j, |v| v + n as f64);
            }
            let mut a =
                DistMatrix::from_replicated(Arc::clone(&grid), DistDesc::standard(), &full);
            let r = cholesky_qr(&mut a).unwrap();

            // R is upper triangular with a positive diagonal.
            for j in 0..n {
                assert!(r.get(j, j) > 0.0);
                for i in (j + 1)..n {
                    assert_eq!(r.get(i, j), 0.0);
                }
            }
            // Q has orthonormal columns.
            let q = a.to_replicated();
            let mut qtq = Matrix::zeros(n, n);
            kernels::gemm(1.0, Orient::Adjoint, &q, Orient::Normal, &q, 0.0, &mut qtq);
            for j in 0..n {
                for i in 0..n {
                    let want = if i == j { 1.0 } else { 0.0 };
                    assert!((qtq.get(i, j) - want).abs() < 1e-9);
                }
            }
            // Q R reconstructs the input.
            let mut back = Matrix::zeros(m, n);
            kernels::gemm(1.0, Orient::Normal, &q, Orient::Normal, &r, 0.0, &mut back);
            for j in 0..n {
                for i in 0..m {
                    assert!((back.get(i, j) - full.get(i, j)).abs() < 1e-9);
                }
            }
        });
    }

    #[test]
    fn thin_qr_rejects_wide_matrices() {
        run_threaded(4, |comm| {
            let grid = Arc::new(Grid::new(comm, 2, 2).unwrap());
            let mut a = DistMatrix::<f64, _>::standard(Arc::clone(&grid), 3, 5);
            assert!(matches!(cholesky_qr(&mut a), Err(Error::Nonconformal(_))));
        });
    }
}
