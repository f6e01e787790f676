//! Crate-wide error type.
//!
//! Precondition violations are detected locally, before any communication is
//! issued, and abort the enclosing call; there are no retries.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Grid shape does not tile the communicator.
    #[error("grid of {rows}x{cols} processes does not match communicator size {comm_size}")]
    GridShape {
        rows: usize,
        cols: usize,
        comm_size: usize,
    },

    /// A square matrix was required.
    #[error("matrix must be square, got {height}x{width}")]
    NonSquareMatrix { height: usize, width: usize },

    /// A square process grid was required.
    #[error("process grid must be square, got {rows}x{cols}")]
    NonSquareGrid { rows: usize, cols: usize },

    /// Operand shapes do not conform.
    #[error("nonconformal operands: {0}")]
    Nonconformal(String),

    /// The two distribution tags cannot be combined.
    #[error("invalid distribution pair: {0}")]
    InvalidDistribution(String),

    /// A redistributing assignment was attempted without declaring the
    /// target's alignment first.
    #[error("target alignment must be declared (align_with) before a redistributing assignment")]
    UnalignedAssignment,

    /// Derived sparse-matrix structure was read while updates were pending.
    #[error("distributed sparse matrix must be consistent; call process_queues first")]
    Inconsistent,

    /// The local Cholesky kernel met a non-positive pivot.
    #[error("matrix is not positive-definite (pivot {pivot} at index {index})")]
    NotPositiveDefinite { index: usize, pivot: f64 },

    /// Blocked algorithms need a nonzero blocksize.
    #[error("blocksize must be nonzero")]
    ZeroBlocksize,

    /// An index fell outside the matrix.
    #[error("index ({row}, {col}) out of bounds for {height}x{width}")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        height: usize,
        width: usize,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
