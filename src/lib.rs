//! Distributed-memory dense and sparse linear algebra over a 2-D process grid.
//!
//! The crate is built around three pieces of machinery:
//!
//! * a process-grid / distribution model describing how a matrix's entries map
//!   onto cooperating processes, and a redistribution engine that moves local
//!   data between such mappings with collective exchanges ([`grid`], [`dist`],
//!   [`redist`]);
//! * a blocked "factor the panel, update the trailing matrix" driver
//!   instantiated by Cholesky, two-sided triangular congruence transforms and
//!   triangular rank-2k updates ([`cholesky`], [`two_sided`], [`trr2k`]);
//! * a distributed sparse matrix kept globally consistent under streams of
//!   locally or remotely queued updates ([`sparse`]).
//!
//! Communication is abstracted behind the [`comm::Comm`] trait; the crate
//! ships an in-process multi-rank backend ([`comm::ThreadComm`]) which every
//! test uses to stand up real grids inside one process.

pub mod blocked;
pub mod cholesky;
pub mod comm;
pub mod dense;
pub mod dist;
pub mod error;
pub mod field;
pub mod grid;
pub mod kernels;
pub mod matrix;
pub mod redist;
pub mod sparse;
pub mod trr2k;
pub mod two_sided;

pub use comm::{Comm, SelfComm, ThreadComm};
pub use dense::DistMatrix;
pub use dist::{Dist, DistDesc};
pub use error::Error;
pub use field::Field;
pub use grid::Grid;
pub use matrix::Matrix;
pub use sparse::DistSparseMatrix;
