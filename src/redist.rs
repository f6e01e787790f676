//! The redistribution engine.
//!
//! Moves the entries of a [`DistMatrix`] from one descriptor to another with
//! as narrow a collective as the pair of descriptors allows:
//!
//! * identical-ownership pairs copy locally, with no communication at all;
//! * replications along one dimension all-gather within the row, column or
//!   world communicator whose members' ownership classes union to the
//!   target's (this covers the partial gathers from linear orderings, whose
//!   union within a grid column or row is exactly one grid-dimension class);
//! * everything else falls back to an ownership-keyed all-to-all in which
//!   the minimum-rank holder of each entry is its unique sender.
//!
//! Packing order is globally reproducible (each receiver re-derives every
//! sender's traversal from the descriptors alone), so no counts or indices
//! travel with the data. The module also carries the two fold primitives the
//! blocked drivers need, [`sum_scatter`] and [`transpose_exchange`], and the
//! local distributed adjoint [`adjoint_flip`].

use std::sync::Arc;

use tracing::trace;

use crate::comm::Comm;
use crate::dense::DistMatrix;
use crate::dist::{local_length, Dist, DistDesc};
use crate::error::{Error, Result};
use crate::field::Field;
use crate::grid::Grid;
use crate::matrix::Matrix;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Row,
    Col,
    World,
}

fn scope_comm<'a, C: Comm>(grid: &'a Grid<C>, scope: Scope) -> &'a C {
    match scope {
        Scope::Row => grid.row_comm(),
        Scope::Col => grid.col_comm(),
        Scope::World => grid.world(),
    }
}

fn member_world_rank<C: Comm>(grid: &Grid<C>, scope: Scope, member: usize) -> usize {
    match scope {
        Scope::Row => grid.rank_of(grid.my_row(), member),
        Scope::Col => grid.rank_of(member, grid.my_col()),
        Scope::World => member,
    }
}

/// True when every entry the caller owns under `dst` is already in its local
/// buffer under `src`, for one dimension.
fn dim_local_pick(src: Dist, src_align: usize, dst: Dist, dst_align: usize) -> bool {
    src == Dist::Star || (src == dst && src_align == dst_align)
}

/// The communicator whose members' ownership classes union to `dst`'s class,
/// for one dimension, or None when the pair is not a pure replication. The
/// caller still verifies that the alignment survives the coarsening.
fn replication_scope(src: Dist, dst: Dist) -> Option<Scope> {
    match (src, dst) {
        (Dist::GridRows, Dist::Star) => Some(Scope::Col),
        (Dist::GridCols, Dist::Star) => Some(Scope::Row),
        (Dist::LinearColMajor, Dist::Star) | (Dist::LinearRowMajor, Dist::Star) => {
            Some(Scope::World)
        }
        // Column-major linear positions within one grid row differ only in
        // their grid column, so their classes union to a grid-rows class.
        (Dist::LinearColMajor, Dist::GridRows) => Some(Scope::Row),
        (Dist::LinearRowMajor, Dist::GridCols) => Some(Scope::Col),
        _ => None,
    }
}

/// Redistribute `src` into `dst`. Both must share the grid and global shape;
/// `dst`'s descriptor picks the route.
pub fn redistribute<T: Field, C: Comm>(
    src: &DistMatrix<T, C>,
    dst: &mut DistMatrix<T, C>,
) -> Result<()> {
    if src.height() != dst.height() || src.width() != dst.width() {
        return Err(Error::Nonconformal(format!(
            "cannot redistribute {}x{} into {}x{}",
            src.height(),
            src.width(),
            dst.height(),
            dst.width()
        )));
    }
    let grid = Arc::clone(src.grid());
    let s = src.desc();
    let d = dst.desc();

    if dim_local_pick(s.row_dist, s.row_align, d.row_dist, d.row_align)
        && dim_local_pick(s.col_dist, s.col_align, d.col_dist, d.col_align)
    {
        trace!("redistribute: local pick");
        local_pick(src, dst);
        return Ok(());
    }

    if d.row_dist == Dist::Star && d.col_dist == Dist::Star {
        trace!("redistribute: full replication");
        let full = src.to_replicated();
        *dst = DistMatrix::from_replicated(grid, d, &full);
        return Ok(());
    }

    // One-dimensional replication with the other dimension untouched.
    let cols_equal = s.col_dist == d.col_dist && s.col_align == d.col_align;
    let rows_equal = s.row_dist == d.row_dist && s.row_align == d.row_align;
    if cols_equal {
        if let Some(scope) = replication_scope(s.row_dist, d.row_dist) {
            if coarsen_align_ok(&grid, s.row_dist, s.row_align, d.row_dist, d.row_align) {
                trace!(?scope, "redistribute: row replication");
                replicate_rows(src, dst, scope);
                return Ok(());
            }
        }
    }
    if rows_equal {
        if let Some(scope) = replication_scope(s.col_dist, d.col_dist) {
            if coarsen_align_ok(&grid, s.col_dist, s.col_align, d.col_dist, d.col_align) {
                trace!(?scope, "redistribute: column replication");
                replicate_cols(src, dst, scope);
                return Ok(());
            }
        }
    }

    trace!("redistribute: general all-to-all");
    general(src, dst);
    Ok(())
}

fn coarsen_align_ok<C: Comm>(
    grid: &Grid<C>,
    src: Dist,
    src_align: usize,
    dst: Dist,
    dst_align: usize,
) -> bool {
    match dst {
        Dist::Star => dst_align == 0,
        _ => src_align % dst.stride(grid) == dst_align && src.stride(grid) % dst.stride(grid) == 0,
    }
}

fn local_pick<T: Field, C: Comm>(src: &DistMatrix<T, C>, dst: &mut DistMatrix<T, C>) {
    let grid = Arc::clone(src.grid());
    let sd = src.desc();
    let mut local = Matrix::zeros(dst.local().height(), dst.local().width());
    for lj in 0..local.width() {
        let gj = dst.global_col(lj);
        for li in 0..local.height() {
            let gi = dst.global_row(li);
            local.set(
                li,
                lj,
                src.local()
                    .get(sd.local_row(gi, &grid), sd.local_col(gj, &grid)),
            );
        }
    }
    dst.replace_local(local);
}

fn replicate_rows<T: Field, C: Comm>(
    src: &DistMatrix<T, C>,
    dst: &mut DistMatrix<T, C>,
    scope: Scope,
) {
    let grid = Arc::clone(src.grid());
    let comm = scope_comm(&grid, scope);
    let shards = comm.all_gather(src.local().data());
    let sd = src.desc();
    let dd = dst.desc();
    let row_stride = sd.row_dist.stride(&grid);
    let mut local = Matrix::zeros(dst.local().height(), dst.local().width());
    for (member, shard) in shards.iter().enumerate() {
        let w = member_world_rank(&grid, scope, member);
        let shift = sd.row_shift_of(&grid, w);
        let lh = local_length(src.height(), shift, row_stride);
        for lj in 0..local.width() {
            for li in 0..lh {
                let gi = shift + li * row_stride;
                if dd.owns_row(gi, &grid) {
                    local.set(dd.local_row(gi, &grid), lj, shard[li + lj * lh]);
                }
            }
        }
    }
    dst.replace_local(local);
}

fn replicate_cols<T: Field, C: Comm>(
    src: &DistMatrix<T, C>,
    dst: &mut DistMatrix<T, C>,
    scope: Scope,
) {
    let grid = Arc::clone(src.grid());
    let comm = scope_comm(&grid, scope);
    let shards = comm.all_gather(src.local().data());
    let sd = src.desc();
    let dd = dst.desc();
    let col_stride = sd.col_dist.stride(&grid);
    let lh = dst.local().height();
    let mut local = Matrix::zeros(lh, dst.local().width());
    for (member, shard) in shards.iter().enumerate() {
        let w = member_world_rank(&grid, scope, member);
        let shift = sd.col_shift_of(&grid, w);
        let lw = local_length(src.width(), shift, col_stride);
        for lj in 0..lw {
            let gj = shift + lj * col_stride;
            if dd.owns_col(gj, &grid) {
                let dj = dd.local_col(gj, &grid);
                for li in 0..lh {
                    local.set(li, dj, shard[li + lj * lh]);
                }
            }
        }
    }
    dst.replace_local(local);
}

/// The always-correct route: each entry travels once, from its minimum-rank
/// holder under the source to every holder under the target. Both sides walk
/// the same descriptor-derived traversal, so buffers carry raw entries only.
fn general<T: Field, C: Comm>(src: &DistMatrix<T, C>, dst: &mut DistMatrix<T, C>) {
    let grid = Arc::clone(src.grid());
    let me = grid.col_major_rank();
    let p = grid.size();
    let sd = src.desc();
    let dd = dst.desc();

    let mut sends: Vec<Vec<T>> = vec![Vec::new(); p];
    for lj in 0..src.local().width() {
        let gj = src.global_col(lj);
        for li in 0..src.local().height() {
            let gi = src.global_row(li);
            if sd.canonical_owner(gi, gj, &grid) != me {
                continue;
            }
            let v = src.local().get(li, lj);
            for owner in dd.owners(gi, gj, &grid) {
                sends[owner].push(v);
            }
        }
    }
    let recvs = grid.world().all_to_all(sends);

    let mut local = Matrix::zeros(dst.local().height(), dst.local().width());
    for (q, buf) in recvs.iter().enumerate() {
        let mut next = 0;
        // Re-derive q's traversal: its local column-major order over the
        // entries it canonically held under the source.
        let row_stride = sd.row_dist.stride(&grid);
        let col_stride = sd.col_dist.stride(&grid);
        let row_shift = sd.row_shift_of(&grid, q);
        let col_shift = sd.col_shift_of(&grid, q);
        let lh = local_length(src.height(), row_shift, row_stride);
        let lw = local_length(src.width(), col_shift, col_stride);
        for lj in 0..lw {
            let gj = col_shift + lj * col_stride;
            for li in 0..lh {
                let gi = row_shift + li * row_stride;
                if sd.canonical_owner(gi, gj, &grid) != q {
                    continue;
                }
                if dd.owns_row(gi, &grid) && dd.owns_col(gj, &grid) {
                    local.set(dd.local_row(gi, &grid), dd.local_col(gj, &grid), buf[next]);
                    next += 1;
                }
            }
        }
        debug_assert_eq!(next, buf.len());
    }
    dst.replace_local(local);
}

/// Fold partial sums into a distributed target: `partial` carries, on every
/// process of the fold scope, a same-shaped contribution for all indices of
/// each dimension it replicates; the elementwise sum lands scattered in
/// `target`'s distribution. With `update` the sum is added to `target`
/// instead of overwriting it.
pub fn sum_scatter<T: Field, C: Comm>(
    partial: &DistMatrix<T, C>,
    target: &mut DistMatrix<T, C>,
    update: bool,
) -> Result<()> {
    if partial.height() != target.height() || partial.width() != target.width() {
        return Err(Error::Nonconformal(format!(
            "cannot fold {}x{} into {}x{}",
            partial.height(),
            partial.width(),
            target.height(),
            target.width()
        )));
    }
    let grid = Arc::clone(target.grid());
    let pd = partial.desc();
    let td = target.desc();
    let rows_match = pd.row_dist == td.row_dist && pd.row_align == td.row_align;
    let cols_match = pd.col_dist == td.col_dist && pd.col_align == td.col_align;
    let fold_rows = pd.row_dist == Dist::Star && td.row_dist != Dist::Star;
    let fold_cols = pd.col_dist == Dist::Star && td.col_dist != Dist::Star;

    let scope_for = |dist: Dist| -> Result<Scope> {
        match dist {
            Dist::GridRows => Ok(Scope::Col),
            Dist::GridCols => Ok(Scope::Row),
            _ => Err(Error::InvalidDistribution(
                "fold targets must scatter over a grid dimension".to_string(),
            )),
        }
    };

    let (scope, both) = match (fold_rows, fold_cols) {
        (true, true) => (Scope::World, true),
        (true, false) if cols_match => (scope_for(td.row_dist)?, false),
        (false, true) if rows_match => (scope_for(td.col_dist)?, false),
        _ => {
            return Err(Error::InvalidDistribution(
                "fold requires the partial to replicate exactly the scattered dimensions"
                    .to_string(),
            ))
        }
    };
    if both {
        scope_for(td.row_dist)?;
        scope_for(td.col_dist)?;
    }

    let comm = scope_comm(&grid, scope);
    let row_stride = td.row_dist.stride(&grid);
    let col_stride = td.col_dist.stride(&grid);
    let mut blocks: Vec<Vec<T>> = Vec::with_capacity(comm.size());
    for member in 0..comm.size() {
        let w = member_world_rank(&grid, scope, member);
        let mut block = Vec::new();
        if both {
            let row_shift = td.row_shift_of(&grid, w);
            let col_shift = td.col_shift_of(&grid, w);
            let lh = local_length(target.height(), row_shift, row_stride);
            let lw = local_length(target.width(), col_shift, col_stride);
            for lj in 0..lw {
                let gj = col_shift + lj * col_stride;
                for li in 0..lh {
                    let gi = row_shift + li * row_stride;
                    block.push(partial.local().get(gi, gj));
                }
            }
        } else if fold_rows {
            // Scattered rows, shared columns: the member's rows in its local
            // order, my (equal) local columns.
            let row_shift = td.row_shift_of(&grid, w);
            let lh = local_length(target.height(), row_shift, row_stride);
            for lj in 0..partial.local().width() {
                for li in 0..lh {
                    let gi = row_shift + li * row_stride;
                    block.push(partial.local().get(gi, lj));
                }
            }
        } else {
            let col_shift = td.col_shift_of(&grid, w);
            let lw = local_length(target.width(), col_shift, col_stride);
            for lj in 0..lw {
                let gj = col_shift + lj * col_stride;
                for li in 0..partial.local().height() {
                    block.push(partial.local().get(li, gj));
                }
            }
        }
        blocks.push(block);
    }

    let summed = comm.reduce_scatter(blocks);
    debug_assert_eq!(summed.len(), target.local().height() * target.local().width());
    let lh = target.local().height();
    let local = target.local_mut();
    for (idx, v) in summed.into_iter().enumerate() {
        let li = idx % lh.max(1);
        let lj = idx / lh.max(1);
        if update {
            local.update(li, lj, |old| old + v);
        } else {
            local.set(li, lj, v);
        }
    }
    Ok(())
}

/// On a square grid, turn a row-replicated matrix whose columns cycle over
/// grid columns into one whose columns cycle over grid rows with a single
/// pairwise exchange: the partner's local columns under the source are
/// exactly the caller's under the target. `partner` is the world rank from
/// [`Grid::transpose_rank`]; send and receive sizes are independent.
pub fn transpose_exchange<T: Field, C: Comm>(
    src: &DistMatrix<T, C>,
    dst_col_align: usize,
    partner: usize,
) -> Result<DistMatrix<T, C>> {
    let grid = Arc::clone(src.grid());
    if !grid.is_square() {
        return Err(Error::NonSquareGrid {
            rows: grid.height(),
            cols: grid.width(),
        });
    }
    let sd = src.desc();
    if sd.row_dist != Dist::Star || sd.col_dist != Dist::GridCols {
        return Err(Error::InvalidDistribution(
            "transpose exchange expects a row-replicated, column-cyclic source".to_string(),
        ));
    }
    let desc = DistDesc::new(Dist::Star, Dist::GridRows, 0, dst_col_align, &grid)?;
    let mut dst = DistMatrix::new(Arc::clone(&grid), desc, src.height(), src.width());
    let data = if partner == grid.col_major_rank() {
        src.local().data().to_vec()
    } else {
        grid.world().send_recv(partner, src.local().data())
    };
    let lh = src.height();
    let lw = dst.local().width();
    dst.replace_local(Matrix::from_vec(lh, lw, data)?);
    Ok(dst)
}

/// The distributed conjugate transpose of a grid-distributed matrix, with
/// the two dimensions' roles swapped. Ownership is preserved entrywise, so
/// this never communicates.
pub fn adjoint_flip<T: Field, C: Comm>(src: &DistMatrix<T, C>) -> DistMatrix<T, C> {
    flip(src, true)
}

/// The distributed plain transpose; see [`adjoint_flip`].
pub fn transpose_flip<T: Field, C: Comm>(src: &DistMatrix<T, C>) -> DistMatrix<T, C> {
    flip(src, false)
}

fn flip<T: Field, C: Comm>(src: &DistMatrix<T, C>, conjugate: bool) -> DistMatrix<T, C> {
    let grid = Arc::clone(src.grid());
    let sd = src.desc();
    let desc = DistDesc {
        row_dist: sd.col_dist,
        col_dist: sd.row_dist,
        row_align: sd.col_align,
        col_align: sd.row_align,
    };
    let mut out = DistMatrix::new(grid, desc, src.width(), src.height());
    let mut local = Matrix::zeros(src.local().width(), src.local().height());
    for lj in 0..src.local().width() {
        for li in 0..src.local().height() {
            let v = src.local().get(li, lj);
            local.set(lj, li, if conjugate { v.conj() } else { v });
        }
    }
    out.replace_local(local);
    out
}
