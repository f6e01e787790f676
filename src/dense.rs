//! The distributed dense matrix.
//!
//! A [`DistMatrix`] pairs a global shape and a [`DistDesc`] with the local
//! column-major buffer holding exactly the entries the calling process owns.
//! Every process stores the same metadata, so shape and ownership questions
//! are answered without communication; only [`crate::redist`] moves entries
//! between processes.
//!
//! Regions (contiguous global index rectangles) are first-class: extracting a
//! region never communicates, because a region inherits its parent's tags
//! with alignments advanced to the region origin, which keeps every entry on
//! the process that already held it. The blocked drivers are written entirely
//! in terms of extract / compute / write-back on such regions.

use std::sync::Arc;

use crate::comm::Comm;
use crate::dist::{Dist, DistDesc};
use crate::error::{Error, Result};
use crate::field::Field;
use crate::grid::Grid;
use crate::matrix::Matrix;

pub struct DistMatrix<T: Field, C: Comm> {
    grid: Arc<Grid<C>>,
    desc: DistDesc,
    height: usize,
    width: usize,
    aligned: bool,
    local: Matrix<T>,
}

impl<T: Field, C: Comm> DistMatrix<T, C> {
    /// Zeroed matrix with an explicitly chosen (and thereby declared)
    /// distribution.
    pub fn new(grid: Arc<Grid<C>>, desc: DistDesc, height: usize, width: usize) -> Self {
        let local = Matrix::zeros(desc.local_height(height, &grid), desc.local_width(width, &grid));
        DistMatrix {
            grid,
            desc,
            height,
            width,
            aligned: true,
            local,
        }
    }

    /// Zeroed matrix in the standard [grid-rows, grid-cols] distribution.
    pub fn standard(grid: Arc<Grid<C>>, height: usize, width: usize) -> Self {
        Self::new(grid, DistDesc::standard(), height, width)
    }

    /// Zeroed matrix with chosen tags but alignments not yet declared.
    /// Redistributing into it fails until [`align_with`](Self::align_with)
    /// runs; assignments never pick an alignment silently.
    pub fn unaligned(
        grid: Arc<Grid<C>>,
        row_dist: Dist,
        col_dist: Dist,
        height: usize,
        width: usize,
    ) -> Result<Self> {
        let desc = DistDesc::new(row_dist, col_dist, 0, 0, &grid)?;
        let local = Matrix::zeros(desc.local_height(height, &grid), desc.local_width(width, &grid));
        Ok(DistMatrix {
            grid,
            desc,
            height,
            width,
            aligned: false,
            local,
        })
    }

    /// Declare this matrix's alignments, reshaping the (zeroed) local buffer.
    pub fn align_with(&mut self, row_align: usize, col_align: usize) -> Result<()> {
        self.desc = DistDesc::new(
            self.desc.row_dist,
            self.desc.col_dist,
            row_align,
            col_align,
            &self.grid,
        )?;
        self.aligned = true;
        self.local.resize(
            self.desc.local_height(self.height, &self.grid),
            self.desc.local_width(self.width, &self.grid),
        );
        Ok(())
    }

    /// Build from a buffer every process holds in full; each process keeps
    /// its own entries. All processes must pass bit-identical data.
    pub fn from_replicated(
        grid: Arc<Grid<C>>,
        desc: DistDesc,
        full: &Matrix<T>,
    ) -> Self {
        let mut out = Self::new(grid, desc, full.height(), full.width());
        for lj in 0..out.local.width() {
            let gj = out.desc.global_col(lj, &out.grid);
            for li in 0..out.local.height() {
                let gi = out.desc.global_row(li, &out.grid);
                out.local.set(li, lj, full.get(gi, gj));
            }
        }
        out
    }

    pub fn grid(&self) -> &Arc<Grid<C>> {
        &self.grid
    }

    pub fn desc(&self) -> DistDesc {
        self.desc
    }

    pub fn is_aligned(&self) -> bool {
        self.aligned
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

    pub fn local(&self) -> &Matrix<T> {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut Matrix<T> {
        &mut self.local
    }

    pub fn global_row(&self, local: usize) -> usize {
        self.desc.global_row(local, &self.grid)
    }

    pub fn global_col(&self, local: usize) -> usize {
        self.desc.global_col(local, &self.grid)
    }

    /// Local row indices covering global rows `g0..g1`.
    pub fn local_row_range(&self, g0: usize, g1: usize) -> (usize, usize) {
        let shift = self.desc.row_shift(&self.grid);
        let stride = self.desc.row_dist.stride(&self.grid);
        (
            crate::dist::local_length(g0, shift, stride),
            crate::dist::local_length(g1, shift, stride),
        )
    }

    /// Local column indices covering global columns `g0..g1`.
    pub fn local_col_range(&self, g0: usize, g1: usize) -> (usize, usize) {
        let shift = self.desc.col_shift(&self.grid);
        let stride = self.desc.col_dist.stride(&self.grid);
        (
            crate::dist::local_length(g0, shift, stride),
            crate::dist::local_length(g1, shift, stride),
        )
    }

    /// Copy out the region with top-left global corner `(i0, j0)`. Purely
    /// local; the result carries the origin-advanced descriptor.
    pub fn extract_region(
        &self,
        i0: usize,
        j0: usize,
        height: usize,
        width: usize,
    ) -> DistMatrix<T, C> {
        debug_assert!(i0 + height <= self.height && j0 + width <= self.width);
        let desc = self.desc.region(i0, j0, &self.grid);
        let (r0, r1) = self.local_row_range(i0, i0 + height);
        let (c0, c1) = self.local_col_range(j0, j0 + width);
        let mut out = DistMatrix::new(Arc::clone(&self.grid), desc, height, width);
        debug_assert_eq!(out.local.height(), r1 - r0);
        debug_assert_eq!(out.local.width(), c1 - c0);
        for lj in c0..c1 {
            for li in r0..r1 {
                out.local.set(li - r0, lj - c0, self.local.get(li, lj));
            }
        }
        out
    }

    /// Overwrite the region at `(i0, j0)` from a matrix carrying the
    /// origin-advanced descriptor (purely local, the inverse of
    /// [`extract_region`](Self::extract_region)).
    pub fn write_region(&mut self, i0: usize, j0: usize, region: &DistMatrix<T, C>) {
        debug_assert_eq!(region.desc, self.desc.region(i0, j0, &self.grid));
        let (r0, _) = self.local_row_range(i0, i0 + region.height);
        let (c0, _) = self.local_col_range(j0, j0 + region.width);
        for lj in 0..region.local.width() {
            for li in 0..region.local.height() {
                self.local.set(r0 + li, c0 + lj, region.local.get(li, lj));
            }
        }
    }

    /// Add a region's entries into the region at `(i0, j0)`.
    pub fn add_region(&mut self, i0: usize, j0: usize, region: &DistMatrix<T, C>) {
        debug_assert_eq!(region.desc, self.desc.region(i0, j0, &self.grid));
        let (r0, _) = self.local_row_range(i0, i0 + region.height);
        let (c0, _) = self.local_col_range(j0, j0 + region.width);
        for lj in 0..region.local.width() {
            for li in 0..region.local.height() {
                self.local
                    .update(r0 + li, c0 + lj, |v| v + region.local.get(li, lj));
            }
        }
    }

    /// Gather the full matrix onto every process. A process's contribution
    /// is its local buffer; replicated copies overwrite with equal values.
    pub fn to_replicated(&self) -> Matrix<T> {
        let world = self.grid.world();
        let shards = world.all_gather(self.local.data());
        let mut full = Matrix::zeros(self.height, self.width);
        for (rank, shard) in shards.iter().enumerate() {
            let row_shift = self.desc.row_shift_of(&self.grid, rank);
            let col_shift = self.desc.col_shift_of(&self.grid, rank);
            let row_stride = self.desc.row_dist.stride(&self.grid);
            let col_stride = self.desc.col_dist.stride(&self.grid);
            let lh = crate::dist::local_length(self.height, row_shift, row_stride);
            let lw = crate::dist::local_length(self.width, col_shift, col_stride);
            debug_assert_eq!(shard.len(), lh * lw);
            for lj in 0..lw {
                let gj = col_shift + lj * col_stride;
                for li in 0..lh {
                    let gi = row_shift + li * row_stride;
                    full.set(gi, gj, shard[li + lj * lh]);
                }
            }
        }
        full
    }

    /// Replace contents by redistributing from `src`, which must have the
    /// same global shape. Identical descriptors copy locally; otherwise the
    /// target's alignment must have been declared, and the redistribution
    /// engine routes the entries.
    pub fn copy_from(&mut self, src: &DistMatrix<T, C>) -> Result<()> {
        if self.height != src.height || self.width != src.width {
            return Err(Error::Nonconformal(format!(
                "cannot assign {}x{} into {}x{}",
                src.height, src.width, self.height, self.width
            )));
        }
        if self.desc == src.desc {
            self.local = src.local.clone();
            return Ok(());
        }
        if !self.aligned {
            return Err(Error::UnalignedAssignment);
        }
        crate::redist::redistribute(src, self)
    }

    pub(crate) fn replace_local(&mut self, local: Matrix<T>) {
        debug_assert_eq!(local.height(), self.desc.local_height(self.height, &self.grid));
        debug_assert_eq!(local.width(), self.desc.local_width(self.width, &self.grid));
        self.local = local;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_threaded;

    fn counting(height: usize, width: usize) -> Matrix<f64> {
        let mut m = Matrix::zeros(height, width);
        for j in 0..width {
            for i in 0..height {
                m.set(i, j, (i * 100 + j) as f64);
            }
        }
        m
    }

    #[test]
    fn local_pick_and_gather_round_trip() {
        run_threaded(6, |comm| {
            let grid = Arc::new(Grid::new(comm, 2, 3).unwrap());
            let full = counting(7, 5);
            let a = DistMatrix::from_replicated(Arc::clone(&grid), DistDesc::standard(), &full);
            assert_eq!(a.to_replicated(), full);
        });
    }

    #[test]
    fn region_round_trip_is_local() {
        run_threaded(4, |comm| {
            let grid = Arc::new(Grid::new(comm, 2, 2).unwrap());
            let full = counting(8, 8);
            let mut a =
                DistMatrix::from_replicated(Arc::clone(&grid), DistDesc::standard(), &full);
            let region = a.extract_region(3, 2, 4, 5);
            assert_eq!(region.to_replicated(), full.submatrix(3, 2, 4, 5));
            // Writing the region back leaves the matrix unchanged.
            a.write_region(3, 2, &region);
            assert_eq!(a.to_replicated(), full);
            // Adding it doubles exactly the region.
            a.add_region(3, 2, &region);
            let gathered = a.to_replicated();
            for j in 0..8 {
                for i in 0..8 {
                    let expect = if (3..7).contains(&i) && (2..7).contains(&j) {
                        2.0 * full.get(i, j)
                    } else {
                        full.get(i, j)
                    };
                    assert_eq!(gathered.get(i, j), expect);
                }
            }
        });
    }

    #[test]
    fn assignment_requires_declared_alignment() {
        run_threaded(4, |comm| {
            let grid = Arc::new(Grid::new(comm, 2, 2).unwrap());
            let full = counting(4, 4);
            let src = DistMatrix::from_replicated(Arc::clone(&grid), DistDesc::standard(), &full);
            let mut dst =
                DistMatrix::unaligned(Arc::clone(&grid), Dist::Star, Dist::LinearRowMajor, 4, 4)
                    .unwrap();
            assert_eq!(dst.copy_from(&src), Err(Error::UnalignedAssignment));
            dst.align_with(0, 1).unwrap();
            dst.copy_from(&src).unwrap();
            assert_eq!(dst.to_replicated(), full);
        });
    }

    #[test]
    fn identical_descriptors_copy_locally() {
        run_threaded(4, |comm| {
            let grid = Arc::new(Grid::new(comm, 2, 2).unwrap());
            let full = counting(5, 5);
            let src = DistMatrix::from_replicated(Arc::clone(&grid), DistDesc::standard(), &full);
            let mut dst = DistMatrix::standard(Arc::clone(&grid), 5, 5);
            dst.copy_from(&src).unwrap();
            assert_eq!(dst.to_replicated(), full);
        });
    }
}
