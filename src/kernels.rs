//! Sequential level-3 kernels.
//!
//! These run on the local buffers of replicated or panel-shaped distributed
//! matrices; the distributed drivers arrange the data so that each call here
//! is redundancy-free. Shape conformality is the caller's responsibility and
//! only checked with debug assertions, matching how the drivers validate the
//! global shapes before any local work starts.

use crate::error::{Error, Result};
use crate::field::Field;
use crate::matrix::Matrix;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpLo {
    Lower,
    Upper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orient {
    Normal,
    Transpose,
    Adjoint,
}

impl Orient {
    pub fn is_transposed(self) -> bool {
        !matches!(self, Orient::Normal)
    }

    /// Scalar twist the orientation applies to each moved entry.
    pub fn apply<T: Field>(self, x: T) -> T {
        match self {
            Orient::Adjoint => x.conj(),
            _ => x,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagKind {
    NonUnit,
    Unit,
}

fn op_dims<T: Field>(orient: Orient, a: &Matrix<T>) -> (usize, usize) {
    if orient.is_transposed() {
        (a.width(), a.height())
    } else {
        (a.height(), a.width())
    }
}

fn op_get<T: Field>(orient: Orient, a: &Matrix<T>, i: usize, j: usize) -> T {
    if orient.is_transposed() {
        orient.apply(a.get(j, i))
    } else {
        a.get(i, j)
    }
}

/// C := alpha op(A) op(B) + beta C.
pub fn gemm<T: Field>(
    alpha: T,
    orient_a: Orient,
    a: &Matrix<T>,
    orient_b: Orient,
    b: &Matrix<T>,
    beta: T,
    c: &mut Matrix<T>,
) {
    let (m, ka) = op_dims(orient_a, a);
    let (kb, n) = op_dims(orient_b, b);
    debug_assert_eq!(ka, kb);
    debug_assert_eq!(c.height(), m);
    debug_assert_eq!(c.width(), n);
    for j in 0..n {
        for i in 0..m {
            let mut acc = T::zero();
            for k in 0..ka {
                acc += op_get(orient_a, a, i, k) * op_get(orient_b, b, k, j);
            }
            c.set(i, j, alpha * acc + beta * c.get(i, j));
        }
    }
}

fn tri_get<T: Field>(uplo: UpLo, diag: DiagKind, t: &Matrix<T>, i: usize, j: usize) -> T {
    let stored = match uplo {
        UpLo::Lower => i >= j,
        UpLo::Upper => i <= j,
    };
    if i == j && diag == DiagKind::Unit {
        T::one()
    } else if stored {
        t.get(i, j)
    } else {
        T::zero()
    }
}

/// B := alpha op(T) B (left) or alpha B op(T) (right), T triangular.
pub fn trmm<T: Field>(
    side: Side,
    uplo: UpLo,
    orient: Orient,
    diag: DiagKind,
    alpha: T,
    tri: &Matrix<T>,
    b: &mut Matrix<T>,
) {
    debug_assert!(tri.is_square());
    let t = |i: usize, j: usize| {
        if orient.is_transposed() {
            orient.apply(tri_get(uplo, diag, tri, j, i))
        } else {
            tri_get(uplo, diag, tri, i, j)
        }
    };
    let out = match side {
        Side::Left => {
            debug_assert_eq!(tri.height(), b.height());
            let mut out = Matrix::zeros(b.height(), b.width());
            for j in 0..b.width() {
                for i in 0..b.height() {
                    let mut acc = T::zero();
                    for k in 0..b.height() {
                        acc += t(i, k) * b.get(k, j);
                    }
                    out.set(i, j, alpha * acc);
                }
            }
            out
        }
        Side::Right => {
            debug_assert_eq!(tri.height(), b.width());
            let mut out = Matrix::zeros(b.height(), b.width());
            for j in 0..b.width() {
                for i in 0..b.height() {
                    let mut acc = T::zero();
                    for k in 0..b.width() {
                        acc += b.get(i, k) * t(k, j);
                    }
                    out.set(i, j, alpha * acc);
                }
            }
            out
        }
    };
    *b = out;
}

/// Solve op(T) X = alpha B (left) or X op(T) = alpha B (right) in place.
pub fn trsm<T: Field>(
    side: Side,
    uplo: UpLo,
    orient: Orient,
    diag: DiagKind,
    alpha: T,
    tri: &Matrix<T>,
    b: &mut Matrix<T>,
) {
    debug_assert!(tri.is_square());
    let n = tri.height();
    let t = |i: usize, j: usize| {
        if orient.is_transposed() {
            orient.apply(tri_get(uplo, diag, tri, j, i))
        } else {
            tri_get(uplo, diag, tri, i, j)
        }
    };
    // The effective coefficient matrix is lower triangular when a lower
    // factor is used untransposed or an upper factor is transposed.
    let effective_lower = (uplo == UpLo::Lower) != orient.is_transposed();
    if alpha != T::one() {
        scale(alpha, b);
    }
    match side {
        Side::Left => {
            debug_assert_eq!(n, b.height());
            for j in 0..b.width() {
                if effective_lower {
                    for i in 0..n {
                        let mut x = b.get(i, j);
                        for k in 0..i {
                            x -= t(i, k) * b.get(k, j);
                        }
                        b.set(i, j, x / t(i, i));
                    }
                } else {
                    for i in (0..n).rev() {
                        let mut x = b.get(i, j);
                        for k in i + 1..n {
                            x -= t(i, k) * b.get(k, j);
                        }
                        b.set(i, j, x / t(i, i));
                    }
                }
            }
        }
        Side::Right => {
            debug_assert_eq!(n, b.width());
            // X op(T) = B solves columns left-to-right against an upper
            // effective factor and right-to-left against a lower one.
            for i in 0..b.height() {
                if effective_lower {
                    for j in (0..n).rev() {
                        let mut x = b.get(i, j);
                        for k in j + 1..n {
                            x -= b.get(i, k) * t(k, j);
                        }
                        b.set(i, j, x / t(j, j));
                    }
                } else {
                    for j in 0..n {
                        let mut x = b.get(i, j);
                        for k in 0..j {
                            x -= b.get(i, k) * t(k, j);
                        }
                        b.set(i, j, x / t(j, j));
                    }
                }
            }
        }
    }
}

/// C := alpha (op(A) op(B)^H + op(B) op(A)^H) + beta C, touching only the
/// `uplo` triangle of C. `orient` is Normal (A is n x k) or Adjoint (k x n).
pub fn her2k<T: Field>(
    uplo: UpLo,
    orient: Orient,
    alpha: T,
    a: &Matrix<T>,
    b: &Matrix<T>,
    beta: T,
    c: &mut Matrix<T>,
) {
    debug_assert!(c.is_square());
    let n = c.height();
    let k = if orient.is_transposed() {
        a.height()
    } else {
        a.width()
    };
    let oa = |m: &Matrix<T>, i: usize, l: usize| {
        if orient.is_transposed() {
            m.get(l, i).conj()
        } else {
            m.get(i, l)
        }
    };
    for j in 0..n {
        for i in 0..n {
            let in_triangle = match uplo {
                UpLo::Lower => i >= j,
                UpLo::Upper => i <= j,
            };
            if !in_triangle {
                continue;
            }
            let mut acc = T::zero();
            for l in 0..k {
                acc += alpha * oa(a, i, l) * oa(b, j, l).conj()
                    + alpha.conj() * oa(b, i, l) * oa(a, j, l).conj();
            }
            c.set(i, j, acc + beta * c.get(i, j));
        }
    }
}

/// Y := alpha X + Y.
pub fn axpy<T: Field>(alpha: T, x: &Matrix<T>, y: &mut Matrix<T>) {
    debug_assert_eq!(x.height(), y.height());
    debug_assert_eq!(x.width(), y.width());
    for j in 0..y.width() {
        for i in 0..y.height() {
            y.update(i, j, |v| v + alpha * x.get(i, j));
        }
    }
}

pub fn scale<T: Field>(alpha: T, a: &mut Matrix<T>) {
    for j in 0..a.width() {
        for i in 0..a.height() {
            a.update(i, j, |v| alpha * v);
        }
    }
}

/// Densify a Hermitian matrix stored in one triangle by mirroring the
/// conjugates into the other.
pub fn hermitian_full<T: Field>(uplo: UpLo, a: &Matrix<T>) -> Matrix<T> {
    debug_assert!(a.is_square());
    let n = a.height();
    let mut full = Matrix::zeros(n, n);
    for j in 0..n {
        for i in 0..n {
            let stored = match uplo {
                UpLo::Lower => i >= j,
                UpLo::Upper => i <= j,
            };
            let v = if stored { a.get(i, j) } else { a.get(j, i).conj() };
            full.set(i, j, v);
        }
    }
    full
}

/// Unblocked in-place upper Cholesky: A = U^H U, overwriting the upper
/// triangle with U. `base` offsets the failure index so distributed callers
/// can report the global position of a bad pivot.
pub fn cholesky_upper<T: Field>(a: &mut Matrix<T>, base: usize) -> Result<()> {
    if !a.is_square() {
        return Err(Error::NonSquareMatrix {
            height: a.height(),
            width: a.width(),
        });
    }
    let n = a.height();
    for k in 0..n {
        let pivot = a.get(k, k).real();
        if pivot <= 0.0 || !pivot.is_finite() {
            return Err(Error::NotPositiveDefinite {
                index: base + k,
                pivot,
            });
        }
        let ukk = T::from_real(pivot.sqrt());
        a.set(k, k, ukk);
        for j in k + 1..n {
            a.set(k, j, a.get(k, j) / ukk);
        }
        for j in k + 1..n {
            for i in k + 1..=j {
                let v = a.get(i, j) - a.get(k, i).conj() * a.get(k, j);
                a.set(i, j, v);
            }
        }
    }
    Ok(())
}

/// A := L^H A L with A Hermitian (lower storage) and L lower triangular.
pub fn two_sided_trmm_local<T: Field>(diag: DiagKind, a: &mut Matrix<T>, l: &Matrix<T>) {
    debug_assert_eq!(a.height(), l.height());
    let mut full = hermitian_full(UpLo::Lower, a);
    trmm(
        Side::Left,
        UpLo::Lower,
        Orient::Adjoint,
        diag,
        T::one(),
        l,
        &mut full,
    );
    trmm(
        Side::Right,
        UpLo::Lower,
        Orient::Normal,
        diag,
        T::one(),
        l,
        &mut full,
    );
    for j in 0..a.width() {
        for i in j..a.height() {
            a.set(i, j, full.get(i, j));
        }
    }
}

/// A := inv(L) A inv(L)^H with A Hermitian (lower storage).
pub fn two_sided_trsm_local<T: Field>(diag: DiagKind, a: &mut Matrix<T>, l: &Matrix<T>) {
    debug_assert_eq!(a.height(), l.height());
    let mut full = hermitian_full(UpLo::Lower, a);
    trsm(
        Side::Left,
        UpLo::Lower,
        Orient::Normal,
        diag,
        T::one(),
        l,
        &mut full,
    );
    trsm(
        Side::Right,
        UpLo::Lower,
        Orient::Adjoint,
        diag,
        T::one(),
        l,
        &mut full,
    );
    for j in 0..a.width() {
        for i in j..a.height() {
            a.set(i, j, full.get(i, j));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex;

    fn approx(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-10, "{a} != {b}");
    }

    #[test]
    fn gemm_with_orientations() {
        let a = Matrix::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Matrix::from_vec(2, 2, vec![5.0, 6.0, 7.0, 8.0]).unwrap();
        let mut c = Matrix::zeros(2, 2);
        gemm(1.0, Orient::Normal, &a, Orient::Normal, &b, 0.0, &mut c);
        approx(c.get(0, 0), 1.0 * 5.0 + 3.0 * 6.0);
        gemm(1.0, Orient::Transpose, &a, Orient::Normal, &b, 0.0, &mut c);
        approx(c.get(0, 0), 1.0 * 5.0 + 2.0 * 6.0);
    }

    #[test]
    fn trsm_inverts_trmm() {
        let l = Matrix::from_vec(3, 3, vec![2.0, 1.0, 4.0, 0.0, 3.0, 5.0, 0.0, 0.0, 6.0])
            .unwrap();
        for side in [Side::Left, Side::Right] {
            for orient in [Orient::Normal, Orient::Transpose, Orient::Adjoint] {
                let b0 = Matrix::from_vec(
                    3,
                    3,
                    vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0],
                )
                .unwrap();
                let mut b = b0.clone();
                trmm(side, UpLo::Lower, orient, DiagKind::NonUnit, 1.0, &l, &mut b);
                trsm(side, UpLo::Lower, orient, DiagKind::NonUnit, 1.0, &l, &mut b);
                for j in 0..3 {
                    for i in 0..3 {
                        approx(b.get(i, j), b0.get(i, j));
                    }
                }
            }
        }
    }

    #[test]
    fn cholesky_reconstructs() {
        // A = U0^H U0 for a fixed upper U0.
        let u0 = Matrix::from_vec(3, 3, vec![2.0, 0.0, 0.0, 1.0, 3.0, 0.0, 0.5, 1.5, 1.0])
            .unwrap();
        let mut a = Matrix::zeros(3, 3);
        gemm(1.0, Orient::Adjoint, &u0, Orient::Normal, &u0, 0.0, &mut a);
        cholesky_upper(&mut a, 0).unwrap();
        for j in 0..3 {
            for i in 0..=j {
                approx(a.get(i, j), u0.get(i, j));
            }
        }
    }

    #[test]
    fn cholesky_reports_global_pivot_index() {
        let mut a =
            Matrix::from_vec(2, 2, vec![1.0, 0.0, 0.0, -4.0]).unwrap();
        let err = cholesky_upper(&mut a, 10).unwrap_err();
        assert_eq!(
            err,
            Error::NotPositiveDefinite {
                index: 11,
                pivot: -4.0
            }
        );
    }

    #[test]
    fn two_sided_trmm_matches_dense_congruence() {
        let l = Matrix::from_vec(3, 3, vec![2.0, 1.0, 4.0, 0.0, 3.0, 5.0, 0.0, 0.0, 6.0])
            .unwrap();
        let mut a = Matrix::zeros(3, 3);
        for j in 0..3 {
            for i in j..3 {
                a.set(i, j, (i + j) as f64 + if i == j { 5.0 } else { 0.0 });
            }
        }
        let full_a = hermitian_full(UpLo::Lower, &a);
        let mut b = a.clone();
        two_sided_trmm_local(DiagKind::NonUnit, &mut b, &l);

        // L^H A L, formed with two dense products.
        let mut tmp = Matrix::zeros(3, 3);
        gemm(1.0, Orient::Adjoint, &l, Orient::Normal, &full_a, 0.0, &mut tmp);
        let mut want = Matrix::zeros(3, 3);
        gemm(1.0, Orient::Normal, &tmp, Orient::Normal, &l, 0.0, &mut want);
        for j in 0..3 {
            for i in j..3 {
                approx(b.get(i, j), want.get(i, j));
            }
        }
    }

    #[test]
    fn two_sided_trsm_solves_the_congruence() {
        let l = Matrix::from_vec(3, 3, vec![2.0, 1.0, 4.0, 0.0, 3.0, 5.0, 0.0, 0.0, 6.0])
            .unwrap();
        let mut a = Matrix::zeros(3, 3);
        for j in 0..3 {
            for i in j..3 {
                a.set(i, j, (i + j) as f64 + if i == j { 5.0 } else { 0.0 });
            }
        }
        let full_a = hermitian_full(UpLo::Lower, &a);
        let mut c = a.clone();
        two_sided_trsm_local(DiagKind::NonUnit, &mut c, &l);

        // B = inv(L) A inv(L)^H means L B L^H must reproduce A.
        let full_c = hermitian_full(UpLo::Lower, &c);
        let mut tmp = Matrix::zeros(3, 3);
        gemm(1.0, Orient::Normal, &l, Orient::Normal, &full_c, 0.0, &mut tmp);
        let mut back = Matrix::zeros(3, 3);
        gemm(1.0, Orient::Normal, &tmp, Orient::Adjoint, &l, 0.0, &mut back);
        for j in 0..3 {
            for i in j..3 {
                approx(back.get(i, j), full_a.get(i, j));
            }
        }
    }

    #[test]
    fn her2k_matches_dense_reference() {
        let a = Matrix::from_vec(
            2,
            2,
            vec![
                Complex::new(1.0, 1.0),
                Complex::new(0.0, 2.0),
                Complex::new(3.0, -1.0),
                Complex::new(2.0, 0.5),
            ],
        )
        .unwrap();
        let b = Matrix::from_vec(
            2,
            2,
            vec![
                Complex::new(2.0, -1.0),
                Complex::new(1.0, 0.0),
                Complex::new(0.0, 1.0),
                Complex::new(-1.0, 2.0),
            ],
        )
        .unwrap();
        let mut c: Matrix<Complex<f64>> = Matrix::zeros(2, 2);
        her2k(UpLo::Lower, Orient::Normal, Complex::new(1.0, 0.0), &a, &b, Complex::new(0.0, 0.0), &mut c);

        let mut dense: Matrix<Complex<f64>> = Matrix::zeros(2, 2);
        gemm(Complex::new(1.0, 0.0), Orient::Normal, &a, Orient::Adjoint, &b, Complex::new(0.0, 0.0), &mut dense);
        let mut dense2: Matrix<Complex<f64>> = Matrix::zeros(2, 2);
        gemm(Complex::new(1.0, 0.0), Orient::Normal, &b, Orient::Adjoint, &a, Complex::new(0.0, 0.0), &mut dense2);
        for j in 0..2 {
            for i in j..2 {
                let want = dense.get(i, j) + dense2.get(i, j);
                assert!((c.get(i, j) - want).norm() < 1e-10);
            }
        }
    }
}
