//! Distribution tags and descriptors.
//!
//! A matrix dimension is spread over the grid according to one of five tags:
//! cyclic over the grid rows, cyclic over the grid columns, cyclic over every
//! process in column-major or row-major linear order, or replicated. A
//! [`DistDesc`] pairs one tag per matrix dimension with the alignment fixing
//! which coordinate owns global index 0. Local shapes, shifts and owners are
//! all pure functions of (tag, grid shape, global shape, alignment), so any
//! two processes agree on who holds what without communicating.

use crate::comm::Comm;
use crate::error::{Error, Result};
use crate::grid::Grid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dist {
    /// Cyclic over the `r` grid rows.
    GridRows,
    /// Cyclic over the `c` grid columns.
    GridCols,
    /// Cyclic over all `r * c` processes in column-major rank order.
    LinearColMajor,
    /// Cyclic over all `r * c` processes in row-major rank order.
    LinearRowMajor,
    /// Replicated: every process along this dimension holds every index.
    Star,
}

impl Dist {
    /// Number of distinct owners this tag cycles over.
    pub fn stride<C: Comm>(self, grid: &Grid<C>) -> usize {
        match self {
            Dist::GridRows => grid.height(),
            Dist::GridCols => grid.width(),
            Dist::LinearColMajor | Dist::LinearRowMajor => grid.size(),
            Dist::Star => 1,
        }
    }

    /// The calling process's position in this tag's owner ordering.
    pub fn my_position<C: Comm>(self, grid: &Grid<C>) -> usize {
        match self {
            Dist::GridRows => grid.my_row(),
            Dist::GridCols => grid.my_col(),
            Dist::LinearColMajor => grid.col_major_rank(),
            Dist::LinearRowMajor => grid.row_major_rank(),
            Dist::Star => 0,
        }
    }

    /// Position of an arbitrary world rank in this tag's owner ordering.
    pub fn position_of<C: Comm>(self, grid: &Grid<C>, world_rank: usize) -> usize {
        match self {
            Dist::GridRows => world_rank % grid.height(),
            Dist::GridCols => world_rank / grid.height(),
            Dist::LinearColMajor => world_rank,
            Dist::LinearRowMajor => {
                let row = world_rank % grid.height();
                let col = world_rank / grid.height();
                col + row * grid.width()
            }
            Dist::Star => 0,
        }
    }

    fn is_linear(self) -> bool {
        matches!(self, Dist::LinearColMajor | Dist::LinearRowMajor)
    }
}

/// Which processes a single dimension's constraint pins down.
enum DimConstraint {
    GridRow(usize),
    GridCol(usize),
    World(usize),
    Any,
}

fn dim_constraint<C: Comm>(
    dist: Dist,
    align: usize,
    g: usize,
    grid: &Grid<C>,
) -> DimConstraint {
    match dist {
        Dist::GridRows => DimConstraint::GridRow((align + g) % grid.height()),
        Dist::GridCols => DimConstraint::GridCol((align + g) % grid.width()),
        Dist::LinearColMajor => DimConstraint::World((align + g) % grid.size()),
        Dist::LinearRowMajor => {
            DimConstraint::World(grid.rank_of_row_major((align + g) % grid.size()))
        }
        Dist::Star => DimConstraint::Any,
    }
}

/// Number of indices in `0..n` congruent to `shift` modulo `stride`.
pub fn local_length(n: usize, shift: usize, stride: usize) -> usize {
    if n > shift {
        (n - shift - 1) / stride + 1
    } else {
        0
    }
}

/// Per-matrix distribution descriptor: one tag and one alignment per
/// dimension. Two matrices are aligned iff their descriptors are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistDesc {
    pub row_dist: Dist,
    pub col_dist: Dist,
    pub row_align: usize,
    pub col_align: usize,
}

impl DistDesc {
    pub fn new<C: Comm>(
        row_dist: Dist,
        col_dist: Dist,
        row_align: usize,
        col_align: usize,
        grid: &Grid<C>,
    ) -> Result<Self> {
        let bad = |msg: &str| Err(Error::InvalidDistribution(msg.to_string()));
        if row_dist.is_linear() && col_dist != Dist::Star
            || col_dist.is_linear() && row_dist != Dist::Star
        {
            return bad("a linear tag must pair with a replicated dimension");
        }
        if row_dist != Dist::Star && row_dist == col_dist {
            return bad("both dimensions cycle over the same grid dimension");
        }
        if row_align >= row_dist.stride(grid) || col_align >= col_dist.stride(grid) {
            return bad("alignment must be smaller than the distribution stride");
        }
        Ok(DistDesc {
            row_dist,
            col_dist,
            row_align,
            col_align,
        })
    }

    /// The standard dense distribution: rows cyclic over grid rows, columns
    /// cyclic over grid columns, zero alignment.
    pub fn standard() -> Self {
        DistDesc {
            row_dist: Dist::GridRows,
            col_dist: Dist::GridCols,
            row_align: 0,
            col_align: 0,
        }
    }

    /// Fully replicated.
    pub fn replicated() -> Self {
        DistDesc {
            row_dist: Dist::Star,
            col_dist: Dist::Star,
            row_align: 0,
            col_align: 0,
        }
    }

    /// Descriptor of the subregion whose top-left corner sits at global
    /// `(i0, j0)`: same tags, with alignments advanced so the region's own
    /// index 0 maps to the owner of `(i0, j0)`. Every region entry stays on
    /// the process that held it in the parent.
    pub fn region<C: Comm>(&self, i0: usize, j0: usize, grid: &Grid<C>) -> DistDesc {
        DistDesc {
            row_dist: self.row_dist,
            col_dist: self.col_dist,
            row_align: (self.row_align + i0) % self.row_dist.stride(grid),
            col_align: (self.col_align + j0) % self.col_dist.stride(grid),
        }
    }

    /// First global row index owned by the calling process.
    pub fn row_shift<C: Comm>(&self, grid: &Grid<C>) -> usize {
        let stride = self.row_dist.stride(grid);
        (self.row_dist.my_position(grid) + stride - self.row_align) % stride
    }

    /// First global column index owned by the calling process.
    pub fn col_shift<C: Comm>(&self, grid: &Grid<C>) -> usize {
        let stride = self.col_dist.stride(grid);
        (self.col_dist.my_position(grid) + stride - self.col_align) % stride
    }

    /// First global row index owned by an arbitrary world rank.
    pub fn row_shift_of<C: Comm>(&self, grid: &Grid<C>, world_rank: usize) -> usize {
        let stride = self.row_dist.stride(grid);
        (self.row_dist.position_of(grid, world_rank) + stride - self.row_align) % stride
    }

    /// First global column index owned by an arbitrary world rank.
    pub fn col_shift_of<C: Comm>(&self, grid: &Grid<C>, world_rank: usize) -> usize {
        let stride = self.col_dist.stride(grid);
        (self.col_dist.position_of(grid, world_rank) + stride - self.col_align) % stride
    }

    pub fn local_height<C: Comm>(&self, height: usize, grid: &Grid<C>) -> usize {
        local_length(height, self.row_shift(grid), self.row_dist.stride(grid))
    }

    pub fn local_width<C: Comm>(&self, width: usize, grid: &Grid<C>) -> usize {
        local_length(width, self.col_shift(grid), self.col_dist.stride(grid))
    }

    pub fn global_row<C: Comm>(&self, local: usize, grid: &Grid<C>) -> usize {
        self.row_shift(grid) + local * self.row_dist.stride(grid)
    }

    pub fn global_col<C: Comm>(&self, local: usize, grid: &Grid<C>) -> usize {
        self.col_shift(grid) + local * self.col_dist.stride(grid)
    }

    pub fn owns_row<C: Comm>(&self, g: usize, grid: &Grid<C>) -> bool {
        g % self.row_dist.stride(grid) == self.row_shift(grid) % self.row_dist.stride(grid)
    }

    pub fn owns_col<C: Comm>(&self, g: usize, grid: &Grid<C>) -> bool {
        g % self.col_dist.stride(grid) == self.col_shift(grid) % self.col_dist.stride(grid)
    }

    /// Local row index of an owned global row.
    pub fn local_row<C: Comm>(&self, g: usize, grid: &Grid<C>) -> usize {
        (g - self.row_shift(grid)) / self.row_dist.stride(grid)
    }

    /// Local column index of an owned global column.
    pub fn local_col<C: Comm>(&self, g: usize, grid: &Grid<C>) -> usize {
        (g - self.col_shift(grid)) / self.col_dist.stride(grid)
    }

    /// World ranks holding entry `(i, j)`; more than one only when a
    /// dimension is replicated.
    pub fn owners<C: Comm>(&self, i: usize, j: usize, grid: &Grid<C>) -> Vec<usize> {
        let row_c = dim_constraint(self.row_dist, self.row_align, i, grid);
        let col_c = dim_constraint(self.col_dist, self.col_align, j, grid);
        // Linear tags pin a world rank and always pair with Star.
        if let DimConstraint::World(w) = row_c {
            return vec![w];
        }
        if let DimConstraint::World(w) = col_c {
            return vec![w];
        }
        let grid_row = match (&row_c, &col_c) {
            (DimConstraint::GridRow(v), _) | (_, DimConstraint::GridRow(v)) => Some(*v),
            _ => None,
        };
        let grid_col = match (&row_c, &col_c) {
            (DimConstraint::GridCol(v), _) | (_, DimConstraint::GridCol(v)) => Some(*v),
            _ => None,
        };
        match (grid_row, grid_col) {
            (Some(a), Some(b)) => vec![grid.rank_of(a, b)],
            (Some(a), None) => (0..grid.width()).map(|b| grid.rank_of(a, b)).collect(),
            (None, Some(b)) => (0..grid.height()).map(|a| grid.rank_of(a, b)).collect(),
            (None, None) => (0..grid.size()).collect(),
        }
    }

    /// The lowest-ranked holder of `(i, j)`; used as the canonical sender
    /// when a replicated source feeds a redistribution.
    pub fn canonical_owner<C: Comm>(&self, i: usize, j: usize, grid: &Grid<C>) -> usize {
        self.owners(i, j, grid)
            .into_iter()
            .min()
            .expect("every entry has at least one owner")
    }
}
