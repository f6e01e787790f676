//! The 2-D process grid.
//!
//! A grid arranges the `r * c` processes of a communicator into `r` rows and
//! `c` columns. Linear ranks map to coordinates in column-major order, so the
//! world communicator doubles as the column-major linear ordering used by the
//! combined-rank distributions. The grid is immutable once constructed.

use tracing::debug;

use crate::comm::Comm;
use crate::error::{Error, Result};

pub struct Grid<C: Comm> {
    height: usize,
    width: usize,
    my_row: usize,
    my_col: usize,
    world: C,
    row_comm: C,
    col_comm: C,
}

impl<C: Comm> Grid<C> {
    /// Arrange `comm` into `height` rows by `width` columns. Fails unless
    /// `height * width` equals the communicator size.
    pub fn new(world: C, height: usize, width: usize) -> Result<Self> {
        if height * width != world.size() {
            return Err(Error::GridShape {
                rows: height,
                cols: width,
                comm_size: world.size(),
            });
        }
        let my_row = world.rank() % height;
        let my_col = world.rank() / height;
        // Peers sharing my grid row form the row communicator (size `width`),
        // ranked by grid column; likewise for the column communicator.
        let row_comm = world.split(my_row, my_col);
        let col_comm = world.split(my_col, my_row);
        debug!(height, width, rank = world.rank(), "grid constructed");
        Ok(Grid {
            height,
            width,
            my_row,
            my_col,
            world,
            row_comm,
            col_comm,
        })
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn size(&self) -> usize {
        self.height * self.width
    }

    pub fn is_square(&self) -> bool {
        self.height == self.width
    }

    pub fn my_row(&self) -> usize {
        self.my_row
    }

    pub fn my_col(&self) -> usize {
        self.my_col
    }

    /// Column-major linear rank of this process (identical to the world rank).
    pub fn col_major_rank(&self) -> usize {
        self.world.rank()
    }

    /// Row-major linear rank of this process.
    pub fn row_major_rank(&self) -> usize {
        self.my_col + self.my_row * self.width
    }

    /// World rank of the process at `(row, col)`.
    pub fn rank_of(&self, row: usize, col: usize) -> usize {
        row + col * self.height
    }

    /// World rank of the process with row-major linear rank `q`.
    pub fn rank_of_row_major(&self, q: usize) -> usize {
        let row = q / self.width;
        let col = q % self.width;
        self.rank_of(row, col)
    }

    /// Whole-grid communicator in column-major rank order.
    pub fn world(&self) -> &C {
        &self.world
    }

    /// Communicator spanning this process's grid row (one peer per column).
    pub fn row_comm(&self) -> &C {
        &self.row_comm
    }

    /// Communicator spanning this process's grid column (one peer per row).
    pub fn col_comm(&self) -> &C {
        &self.col_comm
    }

    /// The process holding this one's role-swapped coordinate for a matrix
    /// with the given alignments and shifts; used to realize a logical
    /// transpose with a single send/recv pair. Requires a square grid.
    pub fn transpose_rank(
        &self,
        col_align: usize,
        row_align: usize,
        col_shift: usize,
        row_shift: usize,
    ) -> Result<usize> {
        if !self.is_square() {
            return Err(Error::NonSquareGrid {
                rows: self.height,
                cols: self.width,
            });
        }
        let r = self.height;
        let transpose_row = (col_align + row_shift) % r;
        let transpose_col = (row_align + col_shift) % r;
        Ok(transpose_row + r * transpose_col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{run_threaded, SelfComm};

    #[test]
    fn shape_must_tile_the_communicator() {
        let err = match Grid::new(SelfComm::new(), 2, 2) {
            Err(e) => e,
            Ok(_) => panic!("a 2x2 grid cannot tile a single-process communicator"),
        };
        assert_eq!(
            err,
            Error::GridShape {
                rows: 2,
                cols: 2,
                comm_size: 1
            }
        );
    }

    #[test]
    fn column_major_coordinates() {
        run_threaded(6, |comm| {
            let rank = comm.rank();
            let grid = Grid::new(comm, 2, 3).unwrap();
            assert_eq!(grid.my_row(), rank % 2);
            assert_eq!(grid.my_col(), rank / 2);
            assert_eq!(grid.rank_of(grid.my_row(), grid.my_col()), rank);
            assert_eq!(grid.row_comm().size(), 3);
            assert_eq!(grid.col_comm().size(), 2);
            assert_eq!(grid.row_comm().rank(), grid.my_col());
            assert_eq!(grid.col_comm().rank(), grid.my_row());
            assert_eq!(
                grid.rank_of_row_major(grid.row_major_rank()),
                grid.col_major_rank()
            );
        });
    }

    #[test]
    fn transpose_rank_swaps_roles() {
        run_threaded(4, |comm| {
            let grid = Grid::new(comm, 2, 2).unwrap();
            // Zero alignments: the transpose partner of (i, j) is (j, i).
            let partner = grid
                .transpose_rank(0, 0, grid.my_row(), grid.my_col())
                .unwrap();
            assert_eq!(partner, grid.rank_of(grid.my_col(), grid.my_row()));
        });
    }

    #[test]
    fn transpose_rank_needs_square_grid() {
        run_threaded(2, |comm| {
            let grid = Grid::new(comm, 2, 1).unwrap();
            assert!(grid.transpose_rank(0, 0, 0, 0).is_err());
        });
    }
}
