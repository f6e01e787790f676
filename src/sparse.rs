//! Distributed sparse matrix assembly.
//!
//! Rows are partitioned in contiguous blocks over the communicator's ranks
//! (the last rank absorbs the remainder). Any rank may queue an update or a
//! removal for any coordinate; queues are buffered locally and exchanged in
//! a single all-to-all when [`DistSparseMatrix::process_queues`] runs, after
//! which every rank's triplets are sorted by coordinate, duplicates merged
//! by summation, and the per-row offsets recomputed. Structure queries fail
//! with [`Error::Inconsistent`] while updates are pending; a freshly built
//! or resized matrix starts out pending until its first queue flush.

use std::collections::BTreeSet;

use tracing::debug;

use crate::comm::Comm;
use crate::error::{Error, Result};
use crate::field::Field;

pub struct DistSparseMatrix<T: Field, C: Comm> {
    comm: C,
    height: usize,
    width: usize,
    // Kept triplets, global row indices, sorted by (row, col) when
    // consistent.
    rows: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<T>,
    // Offsets into the triplets per local row, of length local_height + 1;
    // valid only while consistent.
    row_offsets: Vec<usize>,
    // Pending remote insertions and removals.
    remote_entries: Vec<(usize, usize, T)>,
    remote_removals: Vec<(usize, usize)>,
    marked_for_removal: BTreeSet<(usize, usize)>,
    consistent: bool,
}

impl<T: Field, C: Comm> DistSparseMatrix<T, C> {
    pub fn new(comm: C, height: usize, width: usize) -> Self {
        DistSparseMatrix {
            comm,
            height,
            width,
            rows: Vec::new(),
            cols: Vec::new(),
            vals: Vec::new(),
            row_offsets: Vec::new(),
            remote_entries: Vec::new(),
            remote_removals: Vec::new(),
            marked_for_removal: BTreeSet::new(),
            consistent: false,
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn consistent(&self) -> bool {
        self.consistent
    }

    /// Rows per rank (except the last, which absorbs the remainder).
    pub fn blocksize(&self) -> usize {
        (self.height / self.comm.size()).max(1)
    }

    pub fn row_owner(&self, row: usize) -> usize {
        (row / self.blocksize()).min(self.comm.size() - 1)
    }

    pub fn first_local_row(&self) -> usize {
        self.first_row_of(self.comm.rank())
    }

    fn first_row_of(&self, rank: usize) -> usize {
        (rank * self.blocksize()).min(self.height)
    }

    pub fn local_height(&self) -> usize {
        self.height_of(self.comm.rank())
    }

    fn height_of(&self, rank: usize) -> usize {
        let first = self.first_row_of(rank);
        if rank == self.comm.size() - 1 {
            self.height - first
        } else {
            self.blocksize().min(self.height - first)
        }
    }

    pub fn global_row(&self, local_row: usize) -> usize {
        self.first_local_row() + local_row
    }

    fn owns(&self, row: usize) -> bool {
        let first = self.first_local_row();
        row >= first && row < first + self.local_height()
    }

    fn check_bounds(&self, row: usize, col: usize) -> Result<()> {
        if row >= self.height || col >= self.width {
            return Err(Error::IndexOutOfBounds {
                row,
                col,
                height: self.height,
                width: self.width,
            });
        }
        Ok(())
    }

    pub fn reserve(&mut self, local_entries: usize, remote_entries: usize) {
        self.rows.reserve(local_entries);
        self.cols.reserve(local_entries);
        self.vals.reserve(local_entries);
        self.remote_entries.reserve(remote_entries);
    }

    /// Queue an additive update for any coordinate. Updates to rows owned
    /// elsewhere are buffered for the next queue flush; with `passive` they
    /// are silently dropped instead (the owner is expected to queue them).
    pub fn queue_update(&mut self, row: usize, col: usize, value: T, passive: bool) -> Result<()> {
        self.check_bounds(row, col)?;
        if self.owns(row) {
            let local = row - self.first_local_row();
            self.queue_local_update(local, col, value)
        } else {
            if !passive {
                self.remote_entries.push((row, col, value));
                self.consistent = false;
            }
            Ok(())
        }
    }

    pub fn queue_local_update(&mut self, local_row: usize, col: usize, value: T) -> Result<()> {
        let row = self.global_row(local_row);
        self.check_bounds(row, col)?;
        self.rows.push(row);
        self.cols.push(col);
        self.vals.push(value);
        self.consistent = false;
        Ok(())
    }

    /// Queue the removal of every entry at a coordinate. Removal beats any
    /// update at the same coordinate in the same batch, whichever was
    /// queued first.
    pub fn queue_zero(&mut self, row: usize, col: usize, passive: bool) -> Result<()> {
        self.check_bounds(row, col)?;
        if self.owns(row) {
            let local = row - self.first_local_row();
            self.queue_local_zero(local, col)
        } else {
            if !passive {
                self.remote_removals.push((row, col));
                self.consistent = false;
            }
            Ok(())
        }
    }

    pub fn queue_local_zero(&mut self, local_row: usize, col: usize) -> Result<()> {
        let row = self.global_row(local_row);
        self.check_bounds(row, col)?;
        self.marked_for_removal.insert((row, col));
        self.consistent = false;
        Ok(())
    }

    /// Queue one update and immediately flush all queues (collective).
    pub fn update(&mut self, row: usize, col: usize, value: T, passive: bool) -> Result<()> {
        self.queue_update(row, col, value, passive)?;
        self.process_queues();
        Ok(())
    }

    /// Queue one removal and immediately flush all queues (collective).
    pub fn zero(&mut self, row: usize, col: usize, passive: bool) -> Result<()> {
        self.queue_zero(row, col, passive)?;
        self.process_queues();
        Ok(())
    }

    pub fn update_local(&mut self, local_row: usize, col: usize, value: T) -> Result<()> {
        self.queue_local_update(local_row, col, value)?;
        self.process_queues();
        Ok(())
    }

    pub fn zero_local(&mut self, local_row: usize, col: usize) -> Result<()> {
        self.queue_local_zero(local_row, col)?;
        self.process_queues();
        Ok(())
    }

    /// Drop all entries and queues and change the global shape. The matrix
    /// is pending until the next queue flush.
    pub fn resize(&mut self, height: usize, width: usize) {
        self.height = height;
        self.width = width;
        self.rows.clear();
        self.cols.clear();
        self.vals.clear();
        self.row_offsets.clear();
        self.remote_entries.clear();
        self.remote_removals.clear();
        self.marked_for_removal.clear();
        self.consistent = false;
    }

    /// Exchange queued remote insertions and removals, filter out removed
    /// coordinates, sort and merge the kept triplets, and rebuild the row
    /// offsets. Collective over the communicator, and idempotent once the
    /// matrix is consistent.
    pub fn process_queues(&mut self) {
        let p = self.comm.size();

        // Route remote insertions to their row owners.
        let mut entry_bufs: Vec<Vec<(usize, usize, T)>> = vec![Vec::new(); p];
        for (row, col, value) in std::mem::take(&mut self.remote_entries) {
            entry_bufs[self.row_owner(row)].push((row, col, value));
        }
        let arrived = self.comm.all_to_all(entry_bufs);
        for buf in arrived {
            for (row, col, value) in buf {
                debug_assert!(self.owns(row));
                self.rows.push(row);
                self.cols.push(col);
                self.vals.push(value);
            }
        }

        // Route remote removals likewise.
        let mut removal_bufs: Vec<Vec<(usize, usize)>> = vec![Vec::new(); p];
        for (row, col) in std::mem::take(&mut self.remote_removals) {
            removal_bufs[self.row_owner(row)].push((row, col));
        }
        let arrived = self.comm.all_to_all(removal_bufs);
        for buf in arrived {
            for coord in buf {
                self.marked_for_removal.insert(coord);
            }
        }

        // Filter, sort, merge.
        let mut entries: Vec<(usize, usize, T)> = Vec::with_capacity(self.rows.len());
        for s in 0..self.rows.len() {
            if !self.marked_for_removal.contains(&(self.rows[s], self.cols[s])) {
                entries.push((self.rows[s], self.cols[s], self.vals[s]));
            }
        }
        self.marked_for_removal.clear();
        entries.sort_by_key(|&(i, j, _)| (i, j));
        let mut merged: Vec<(usize, usize, T)> = Vec::with_capacity(entries.len());
        for (i, j, v) in entries {
            match merged.last_mut() {
                Some((li, lj, lv)) if *li == i && *lj == j => *lv += v,
                _ => merged.push((i, j, v)),
            }
        }
        self.rows.clear();
        self.cols.clear();
        self.vals.clear();
        for (i, j, v) in merged {
            self.rows.push(i);
            self.cols.push(j);
            self.vals.push(v);
        }
        self.compute_row_offsets();
        self.consistent = true;
        debug!(
            rank = self.comm.rank(),
            entries = self.vals.len(),
            "sparse queues processed"
        );
    }

    fn compute_row_offsets(&mut self) {
        let first = self.first_local_row();
        let lh = self.local_height();
        self.row_offsets.clear();
        self.row_offsets.resize(lh + 1, 0);
        let mut s = 0;
        for lr in 0..lh {
            self.row_offsets[lr] = s;
            while s < self.rows.len() && self.rows[s] == first + lr {
                s += 1;
            }
        }
        self.row_offsets[lh] = s;
    }

    fn require_consistent(&self) -> Result<()> {
        if self.consistent {
            Ok(())
        } else {
            Err(Error::Inconsistent)
        }
    }

    /// Number of locally stored triplets. While pending this counts the
    /// queued local triplets before filtering and merging.
    pub fn num_local_entries(&self) -> usize {
        self.vals.len()
    }

    /// Global row of the `s`-th locally stored entry.
    pub fn row(&self, s: usize) -> Result<usize> {
        self.require_consistent()?;
        Ok(self.rows[s])
    }

    pub fn col(&self, s: usize) -> Result<usize> {
        self.require_consistent()?;
        Ok(self.cols[s])
    }

    pub fn value(&self, s: usize) -> Result<T> {
        self.require_consistent()?;
        Ok(self.vals[s])
    }

    /// Index of the first stored entry of a local row; entries of the row
    /// are `entry_offset(r)..entry_offset(r + 1)`.
    pub fn entry_offset(&self, local_row: usize) -> Result<usize> {
        self.require_consistent()?;
        Ok(self.row_offsets[local_row])
    }

    pub fn num_entries_in_row(&self, local_row: usize) -> Result<usize> {
        Ok(self.entry_offset(local_row + 1)? - self.entry_offset(local_row)?)
    }

    /// Symmetric diagonal equilibration: `A := inv(D) A inv(D)` with
    /// `d_i = sqrt(max(|a_ii|, 1))`, returning the global scaling vector.
    /// Rows without a stored diagonal entry keep `d_i = 1`. Collective over
    /// the communicator; only stored values change, so the matrix stays
    /// consistent.
    pub fn symmetric_diagonal_equil(&mut self) -> Result<Vec<f64>> {
        self.require_consistent()?;
        if self.height != self.width {
            return Err(Error::NonSquareMatrix {
                height: self.height,
                width: self.width,
            });
        }
        let first = self.first_local_row();
        let mut local_d = vec![1.0_f64; self.local_height()];
        for s in 0..self.vals.len() {
            if self.rows[s] == self.cols[s] {
                local_d[self.rows[s] - first] = self.vals[s].abs().max(1.0).sqrt();
            }
        }
        // Block rows are contiguous in rank order, so the gathered shards
        // concatenate to the global scaling vector.
        let mut d = Vec::with_capacity(self.height);
        for shard in self.comm.all_gather(&local_d) {
            d.extend(shard);
        }
        for s in 0..self.vals.len() {
            let scale = d[self.rows[s]] * d[self.cols[s]];
            self.vals[s] = self.vals[s] / T::from_real(scale);
        }
        Ok(d)
    }
}
