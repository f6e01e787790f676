//! Sequential column-major matrix storage.
//!
//! This is the local buffer every distributed matrix wraps, and the operand
//! type of the sequential kernels. Entries of column `j` are contiguous.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T> {
    height: usize,
    width: usize,
    data: Vec<T>,
}

impl<T: Copy + Default> Matrix<T> {
    pub fn zeros(height: usize, width: usize) -> Self {
        Matrix {
            height,
            width,
            data: vec![T::default(); height * width],
        }
    }

    /// Wrap an existing column-major buffer of exactly `height * width`
    /// entries.
    pub fn from_vec(height: usize, width: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != height * width {
            return Err(Error::Nonconformal(format!(
                "buffer of {} entries cannot back a {}x{} matrix",
                data.len(),
                height,
                width
            )));
        }
        Ok(Matrix {
            height,
            width,
            data,
        })
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn is_square(&self) -> bool {
        self.height == self.width
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> T {
        debug_assert!(i < self.height && j < self.width);
        self.data[i + j * self.height]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: T) {
        debug_assert!(i < self.height && j < self.width);
        self.data[i + j * self.height] = value;
    }

    #[inline]
    pub fn update<F: FnOnce(T) -> T>(&mut self, i: usize, j: usize, f: F) {
        let idx = i + j * self.height;
        self.data[idx] = f(self.data[idx]);
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Copy of the rectangle with corner `(i, j)` and the given shape.
    pub fn submatrix(&self, i: usize, j: usize, height: usize, width: usize) -> Matrix<T> {
        debug_assert!(i + height <= self.height && j + width <= self.width);
        let mut out = Matrix::zeros(height, width);
        for jj in 0..width {
            for ii in 0..height {
                out.set(ii, jj, self.get(i + ii, j + jj));
            }
        }
        out
    }

    /// Overwrite the rectangle with corner `(i, j)` from `src`.
    pub fn set_submatrix(&mut self, i: usize, j: usize, src: &Matrix<T>) {
        debug_assert!(i + src.height <= self.height && j + src.width <= self.width);
        for jj in 0..src.width {
            for ii in 0..src.height {
                self.set(i + ii, j + jj, src.get(ii, jj));
            }
        }
    }

    /// Resize to the given shape, dropping any previous contents.
    pub fn resize(&mut self, height: usize, width: usize) {
        self.height = height;
        self.width = width;
        self.data.clear();
        self.data.resize(height * width, T::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_major_layout() {
        let m = Matrix::from_vec(2, 3, vec![1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(m.get(0, 0), 1);
        assert_eq!(m.get(1, 0), 2);
        assert_eq!(m.get(0, 1), 3);
        assert_eq!(m.get(1, 2), 6);
    }

    #[test]
    fn from_vec_checks_the_shape() {
        assert!(Matrix::from_vec(2, 2, vec![0.0; 3]).is_err());
    }

    #[test]
    fn submatrix_round_trip() {
        let mut m = Matrix::zeros(4, 4);
        for j in 0..4 {
            for i in 0..4 {
                m.set(i, j, (i * 10 + j) as i64);
            }
        }
        let sub = m.submatrix(1, 2, 2, 2);
        assert_eq!(sub.get(0, 0), 12);
        assert_eq!(sub.get(1, 1), 23);
        let mut n = Matrix::zeros(4, 4);
        n.set_submatrix(1, 2, &sub);
        assert_eq!(n.get(2, 3), 23);
        assert_eq!(n.get(0, 0), 0);
    }
}
