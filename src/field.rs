//! Scalar fields the kernels are generic over.
//!
//! Real and complex arithmetic differ only in conjugation and in how a
//! magnitude is extracted, so the factorizations are written once against
//! this trait and instantiated for `f64` and `Complex<f64>`.

use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};

use num_complex::Complex;

use crate::comm::Wire;

pub trait Field:
    Copy
    + Default
    + PartialEq
    + Debug
    + Wire
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
{
    fn zero() -> Self;
    fn one() -> Self;
    fn from_real(x: f64) -> Self;

    /// Complex conjugate; the identity for real scalars.
    fn conj(self) -> Self;
    /// Real part.
    fn real(self) -> f64;
    /// Magnitude.
    fn abs(self) -> f64;
    /// Principal square root. Callers only take roots of positive reals.
    fn sqrt(self) -> Self;
}

impl Field for f64 {
    fn zero() -> Self {
        0.0
    }

    fn one() -> Self {
        1.0
    }

    fn from_real(x: f64) -> Self {
        x
    }

    fn conj(self) -> Self {
        self
    }

    fn real(self) -> f64 {
        self
    }

    fn abs(self) -> f64 {
        f64::abs(self)
    }

    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
}

impl Field for Complex<f64> {
    fn zero() -> Self {
        Complex::new(0.0, 0.0)
    }

    fn one() -> Self {
        Complex::new(1.0, 0.0)
    }

    fn from_real(x: f64) -> Self {
        Complex::new(x, 0.0)
    }

    fn conj(self) -> Self {
        Complex::conj(&self)
    }

    fn real(self) -> f64 {
        self.re
    }

    fn abs(self) -> f64 {
        self.norm()
    }

    fn sqrt(self) -> Self {
        Complex::sqrt(self)
    }
}
