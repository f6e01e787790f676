//! Two-sided triangular congruence transforms.
//!
//! Both operate on a Hermitian matrix `A` stored in its lower triangle and a
//! lower-triangular `L` on the same grid:
//!
//! * [`two_sided_trmm`]: `A := L^H A L`, reducing `A B x = lambda x` with
//!   `B = L L^H` to a standard Hermitian eigenproblem;
//! * [`two_sided_trsm`]: `A := inv(L) A inv(L)^H`, reducing
//!   `A x = lambda B x` the same way. The two transforms are distinct
//!   congruences and neither undoes the other.
//!
//! Each panel computes a Hermitian product `Y` once and applies half of it
//! before and half after the diagonal-block transform; the two half-updates
//! bracket the transform and must not be merged, since the diagonal step
//! reads the panel in the half-updated state.
//!
//! The Hermitian products are accumulated locally from one row-replicated
//! and one column-replicated panel copy, producing two partial matrices (one
//! per grid dimension) that are folded back with reduce-scatters.

use std::sync::Arc;

use tracing::debug;

use crate::blocked::{panels, require_same_shape, require_square};
use crate::comm::Comm;
use crate::dense::DistMatrix;
use crate::dist::{Dist, DistDesc};
use crate::error::{Error, Result};
use crate::field::Field;
use crate::grid::Grid;
use crate::kernels::{self, DiagKind, Orient, Side, UpLo};
use crate::matrix::Matrix;
use crate::redist::{self, sum_scatter};

fn require_standard<T: Field, C: Comm>(m: &DistMatrix<T, C>, what: &str) -> Result<()> {
    let d = m.desc();
    if d.row_dist != Dist::GridRows || d.col_dist != Dist::GridCols {
        return Err(Error::InvalidDistribution(format!(
            "{what} must use the standard grid distribution"
        )));
    }
    Ok(())
}

fn check_operands<T: Field, C: Comm>(
    a: &DistMatrix<T, C>,
    l: &DistMatrix<T, C>,
) -> Result<()> {
    require_square(a)?;
    require_square(l)?;
    require_same_shape(a, l)?;
    require_standard(a, "the transformed matrix")?;
    require_standard(l, "the triangular factor")?;
    Ok(())
}

/// A := L^H A L.
pub fn two_sided_trmm<T: Field, C: Comm>(
    diag: DiagKind,
    a: &mut DistMatrix<T, C>,
    l: &DistMatrix<T, C>,
    blocksize: usize,
) -> Result<()> {
    check_operands(a, l)?;
    let grid = Arc::clone(a.grid());
    let d = a.desc();
    let r = grid.height();
    let c = grid.width();
    let n = a.height();

    for panel in panels(n, blocksize)? {
        let (k, nb, end) = (panel.k, panel.nb, panel.end);
        debug!(k, nb, "two-sided trmm panel");
        let row2 = (d.row_align + end) % r;
        let col2 = (d.col_align + end) % c;

        let l11_repl = l.extract_region(k, k, nb, nb).to_replicated();

        // L21 replicated along rows for both the trailing product and the
        // panel correction.
        let (l21_mc, l21_adj_mr) = if end < n {
            let l21 = l.extract_region(end, k, n - end, nb);
            let mut mc = DistMatrix::new(
                Arc::clone(&grid),
                DistDesc::new(Dist::GridRows, Dist::Star, row2, 0, &grid)?,
                n - end,
                nb,
            );
            mc.copy_from(&l21)?;
            let mut adj = DistMatrix::new(
                Arc::clone(&grid),
                DistDesc::new(Dist::Star, Dist::GridCols, 0, col2, &grid)?,
                nb,
                n - end,
            );
            adj.copy_from(&redist::adjoint_flip(&l21))?;
            (Some(mc), Some(adj))
        } else {
            (None, None)
        };

        if k > 0 {
            // A10 := L11^H A10, solved under the linear column cycle, then
            // A10 += L21^H A20 via a partial product folded over grid rows.
            let a10 = a.extract_region(k, 0, nb, k);
            let vr = DistDesc::new(Dist::Star, Dist::LinearRowMajor, 0, d.col_align, &grid)?;
            let mut a10_vr = DistMatrix::new(Arc::clone(&grid), vr, nb, k);
            a10_vr.copy_from(&a10)?;
            kernels::trmm(
                Side::Left,
                UpLo::Lower,
                Orient::Adjoint,
                diag,
                T::one(),
                &l11_repl,
                a10_vr.local_mut(),
            );
            let mut a10w = DistMatrix::new(Arc::clone(&grid), a10.desc(), nb, k);
            a10w.copy_from(&a10_vr)?;

            if let Some(l21_mc) = &l21_mc {
                let a20 = a.extract_region(end, 0, n - end, k);
                let mut x10 = DistMatrix::new(
                    Arc::clone(&grid),
                    DistDesc::new(Dist::Star, Dist::GridCols, 0, d.col_align, &grid)?,
                    nb,
                    k,
                );
                let mut partial = Matrix::zeros(nb, a20.local().width());
                kernels::gemm(
                    T::one(),
                    Orient::Adjoint,
                    l21_mc.local(),
                    Orient::Normal,
                    a20.local(),
                    T::zero(),
                    &mut partial,
                );
                x10.replace_local(partial);
                sum_scatter(&x10, &mut a10w, true)?;
            }
            a.write_region(k, 0, &a10w);
        }

        if end < n {
            let l21_mc = l21_mc.as_ref().unwrap();
            let l21_adj_mr = l21_adj_mr.as_ref().unwrap();
            let a21 = a.extract_region(end, k, n - end, nb);

            // Y21 := A22 L21, accumulated from the stored lower triangle and
            // its conjugate mirror into per-dimension partials.
            let (z_mc, z_mr) = hemm_accumulate(
                &grid, a, end, n, l21_mc, l21_adj_mr, row2, col2, nb,
            )?;
            let mut z_mr_mc = DistMatrix::new(
                Arc::clone(&grid),
                DistDesc::new(Dist::GridCols, Dist::GridRows, col2, 0, &grid)?,
                n - end,
                nb,
            );
            sum_scatter(&z_mr, &mut z_mr_mc, false)?;
            let mut y21 = DistMatrix::new(Arc::clone(&grid), a21.desc(), n - end, nb);
            y21.copy_from(&z_mr_mc)?;
            // The grid-rows partial shares Y21's row class, so it folds over
            // grid columns directly into Y21.
            sum_scatter(&z_mc, &mut y21, true)?;

            // A21 := A21 L11 under the linear row cycle.
            let vc = DistDesc::new(Dist::LinearColMajor, Dist::Star, row2, 0, &grid)?;
            let mut a21_vc = DistMatrix::new(Arc::clone(&grid), vc, n - end, nb);
            a21_vc.copy_from(&a21)?;
            kernels::trmm(
                Side::Right,
                UpLo::Lower,
                Orient::Normal,
                diag,
                T::one(),
                &l11_repl,
                a21_vc.local_mut(),
            );
            let mut a21w = DistMatrix::new(Arc::clone(&grid), a21.desc(), n - end, nb);
            a21w.copy_from(&a21_vc)?;

            // A21 += 1/2 Y21 (first half).
            kernels::axpy(T::from_real(0.5), y21.local(), a21w.local_mut());

            // A11 := L11^H A11 L11.
            let a11 = a.extract_region(k, k, nb, nb);
            let mut a11_repl = a11.to_replicated();
            kernels::two_sided_trmm_local(diag, &mut a11_repl, &l11_repl);
            a.write_region(
                k,
                k,
                &DistMatrix::from_replicated(Arc::clone(&grid), a11.desc(), &a11_repl),
            );

            // A11 += A21^H L21 + L21^H A21, partials over the linear cycle.
            a21_vc.copy_from(&a21w)?;
            let mut l21_vc = DistMatrix::new(Arc::clone(&grid), vc, n - end, nb);
            l21_vc.copy_from(l21_mc)?;
            let mut x11 = Matrix::zeros(nb, nb);
            kernels::her2k(
                UpLo::Lower,
                Orient::Adjoint,
                T::one(),
                a21_vc.local(),
                l21_vc.local(),
                T::zero(),
                &mut x11,
            );
            let mut x11_part =
                DistMatrix::new(Arc::clone(&grid), DistDesc::replicated(), nb, nb);
            x11_part.replace_local(x11);
            let mut a11w = a.extract_region(k, k, nb, nb);
            sum_scatter(&x11_part, &mut a11w, true)?;
            a.write_region(k, k, &a11w);

            // A21 += 1/2 Y21 (second half).
            kernels::axpy(T::from_real(0.5), y21.local(), a21w.local_mut());
            a.write_region(end, k, &a21w);
        } else {
            let a11 = a.extract_region(k, k, nb, nb);
            let mut a11_repl = a11.to_replicated();
            kernels::two_sided_trmm_local(diag, &mut a11_repl, &l11_repl);
            a.write_region(
                k,
                k,
                &DistMatrix::from_replicated(Arc::clone(&grid), a11.desc(), &a11_repl),
            );
        }
    }
    Ok(())
}

/// Local accumulation of `Y = A_herm * P` over the trailing block
/// `rows x rows` of `a` (global indices `lo..hi`), with `P` given both
/// row-replicated (`p_mc`, rows over grid rows) and adjoint-column form
/// (`p_adj_mr`, `P^H` with columns over grid columns). Returns the
/// grid-rows-distributed and grid-cols-distributed partials.
#[allow(clippy::too_many_arguments)]
fn hemm_accumulate<T: Field, C: Comm>(
    grid: &Arc<Grid<C>>,
    a: &DistMatrix<T, C>,
    lo: usize,
    hi: usize,
    p_mc: &DistMatrix<T, C>,
    p_adj_mr: &DistMatrix<T, C>,
    row_align: usize,
    col_align: usize,
    nb: usize,
) -> Result<(DistMatrix<T, C>, DistMatrix<T, C>)> {
    let m = hi - lo;
    let mut z_mc = DistMatrix::new(
        Arc::clone(grid),
        DistDesc::new(Dist::GridRows, Dist::Star, row_align, 0, grid)?,
        m,
        nb,
    );
    let mut z_mr = DistMatrix::new(
        Arc::clone(grid),
        DistDesc::new(Dist::GridCols, Dist::Star, col_align, 0, grid)?,
        m,
        nb,
    );
    let (r0, r1) = a.local_row_range(lo, hi);
    let (c0, c1) = a.local_col_range(lo, hi);
    for lj in c0..c1 {
        let gj = a.global_col(lj);
        for li in r0..r1 {
            let gi = a.global_row(li);
            if gi < gj {
                continue;
            }
            let v = a.local().get(li, lj);
            // Stored entry: row gi of Y picks up A(gi, gj) * P(gj, :).
            for t in 0..nb {
                let p = p_adj_mr.local().get(t, lj - c0).conj();
                z_mc.local_mut().update(li - r0, t, |z| z + v * p);
            }
            // Mirrored entry: row gj picks up conj(A(gi, gj)) * P(gi, :).
            if gi > gj {
                for t in 0..nb {
                    let p = p_mc.local().get(li - r0, t);
                    z_mr.local_mut().update(lj - c0, t, |z| z + v.conj() * p);
                }
            }
        }
    }
    Ok((z_mc, z_mr))
}

/// A := inv(L) A inv(L)^H.
pub fn two_sided_trsm<T: Field, C: Comm>(
    diag: DiagKind,
    a: &mut DistMatrix<T, C>,
    l: &DistMatrix<T, C>,
    blocksize: usize,
) -> Result<()> {
    check_operands(a, l)?;
    let grid = Arc::clone(a.grid());
    let d = a.desc();
    let r = grid.height();
    let n = a.height();
    let half = T::from_real(0.5);

    for panel in panels(n, blocksize)? {
        let (k, nb, _end) = (panel.k, panel.nb, panel.end);
        debug!(k, nb, "two-sided trsm panel");
        let row1 = (d.row_align + k) % r;

        let l11_repl = l.extract_region(k, k, nb, nb).to_replicated();

        if k > 0 {
            let a10 = a.extract_region(k, 0, nb, k);
            let mut a10w = DistMatrix::new(Arc::clone(&grid), a10.desc(), nb, k);
            a10w.copy_from(&a10)?;

            // Y10 := L10 A00, accumulated in adjoint form Z = A00 L10^H
            // from one copy of L10 per grid dimension.
            let l10 = l.extract_region(k, 0, nb, k);
            let l10_adj = redist::adjoint_flip(&l10);
            let mut l10_adj_mr = DistMatrix::new(
                Arc::clone(&grid),
                DistDesc::new(Dist::GridCols, Dist::Star, d.col_align, 0, &grid)?,
                k,
                nb,
            );
            l10_adj_mr.copy_from(&l10_adj)?;
            let mut l10_star_mc = DistMatrix::new(
                Arc::clone(&grid),
                DistDesc::new(Dist::Star, Dist::GridRows, 0, d.row_align, &grid)?,
                nb,
                k,
            );
            l10_star_mc.copy_from(&l10)?;

            let mut z_mc = DistMatrix::new(
                Arc::clone(&grid),
                DistDesc::new(Dist::GridRows, Dist::Star, d.row_align, 0, &grid)?,
                k,
                nb,
            );
            let mut z_mr = DistMatrix::new(
                Arc::clone(&grid),
                DistDesc::new(Dist::GridCols, Dist::Star, d.col_align, 0, &grid)?,
                k,
                nb,
            );
            let (r0, r1) = a.local_row_range(0, k);
            let (c0, c1) = a.local_col_range(0, k);
            for lj in c0..c1 {
                let gj = a.global_col(lj);
                for li in r0..r1 {
                    let gi = a.global_row(li);
                    if gi < gj {
                        continue;
                    }
                    let v = a.local().get(li, lj);
                    for t in 0..nb {
                        let p = l10_adj_mr.local().get(lj - c0, t);
                        z_mc.local_mut().update(li - r0, t, |z| z + v * p);
                    }
                    if gi > gj {
                        for t in 0..nb {
                            let p = l10_star_mc.local().get(t, li - r0).conj();
                            z_mr.local_mut().update(lj - c0, t, |z| z + v.conj() * p);
                        }
                    }
                }
            }
            // Fold the two partials into Z = A00 L10^H, then take the
            // distributed adjoint to land Y10 on A10's distribution.
            let mut z_full = DistMatrix::new(
                Arc::clone(&grid),
                DistDesc::new(Dist::GridRows, Dist::GridCols, d.row_align, d.col_align, &grid)?,
                k,
                nb,
            );
            sum_scatter(&z_mc, &mut z_full, false)?;
            let mut z_mr_mc = DistMatrix::new(
                Arc::clone(&grid),
                DistDesc::new(Dist::GridCols, Dist::GridRows, d.col_align, row1, &grid)?,
                k,
                nb,
            );
            z_mr_mc.copy_from(&z_full)?;
            sum_scatter(&z_mr, &mut z_mr_mc, true)?;
            let y10 = redist::adjoint_flip(&z_mr_mc);
            debug_assert_eq!(y10.desc(), a10w.desc());

            // A10 := A10 inv(L00)^H.
            let l00 = l.extract_region(0, 0, k, k);
            trsm_right_lower_adjoint(diag, &mut a10w, &l00, blocksize)?;

            // A10 -= 1/2 Y10 (first half).
            kernels::axpy(-half, y10.local(), a10w.local_mut());

            // A11 -= A10 L10^H + L10 A10^H, partials over the linear cycle.
            let vr = DistDesc::new(Dist::Star, Dist::LinearRowMajor, 0, d.col_align, &grid)?;
            let mut a10_vr = DistMatrix::new(Arc::clone(&grid), vr, nb, k);
            a10_vr.copy_from(&a10w)?;
            let mut l10_vr = DistMatrix::new(Arc::clone(&grid), vr, nb, k);
            l10_vr.copy_from(&l10)?;
            let mut x11 = Matrix::zeros(nb, nb);
            kernels::her2k(
                UpLo::Lower,
                Orient::Normal,
                -T::one(),
                a10_vr.local(),
                l10_vr.local(),
                T::zero(),
                &mut x11,
            );
            let mut x11_part =
                DistMatrix::new(Arc::clone(&grid), DistDesc::replicated(), nb, nb);
            x11_part.replace_local(x11);
            let mut a11w = a.extract_region(k, k, nb, nb);
            sum_scatter(&x11_part, &mut a11w, true)?;
            a.write_region(k, k, &a11w);

            // A11 := inv(L11) A11 inv(L11)^H.
            let a11 = a.extract_region(k, k, nb, nb);
            let mut a11_repl = a11.to_replicated();
            kernels::two_sided_trsm_local(diag, &mut a11_repl, &l11_repl);
            a.write_region(
                k,
                k,
                &DistMatrix::from_replicated(Arc::clone(&grid), a11.desc(), &a11_repl),
            );

            // A10 -= 1/2 Y10 (second half).
            kernels::axpy(-half, y10.local(), a10w.local_mut());

            // A10 := inv(L11) A10 under the linear column cycle.
            a10_vr.copy_from(&a10w)?;
            kernels::trsm(
                Side::Left,
                UpLo::Lower,
                Orient::Normal,
                diag,
                T::one(),
                &l11_repl,
                a10_vr.local_mut(),
            );
            a10w.copy_from(&a10_vr)?;
            a.write_region(k, 0, &a10w);
        } else {
            let a11 = a.extract_region(k, k, nb, nb);
            let mut a11_repl = a11.to_replicated();
            kernels::two_sided_trsm_local(diag, &mut a11_repl, &l11_repl);
            a.write_region(
                k,
                k,
                &DistMatrix::from_replicated(Arc::clone(&grid), a11.desc(), &a11_repl),
            );
        }
    }
    Ok(())
}

/// Solve X L^H = X in place for a short, wide X against a distributed lower
/// factor: diagonal blocks are replicated and solved redundantly, trailing
/// updates are formed as fully-replicated partials and folded onto X's
/// distribution.
fn trsm_right_lower_adjoint<T: Field, C: Comm>(
    diag: DiagKind,
    x: &mut DistMatrix<T, C>,
    l: &DistMatrix<T, C>,
    blocksize: usize,
) -> Result<()> {
    let grid = Arc::clone(x.grid());
    let nb = x.height();
    let k = x.width();
    for panel in panels(k, blocksize)? {
        let (j, jnb, jend) = (panel.k, panel.nb, panel.end);
        let l_jj = l.extract_region(j, j, jnb, jnb).to_replicated();
        let xj = x.extract_region(0, j, nb, jnb);
        let mut xj_repl = xj.to_replicated();
        kernels::trsm(
            Side::Right,
            UpLo::Lower,
            Orient::Adjoint,
            diag,
            T::one(),
            &l_jj,
            &mut xj_repl,
        );
        x.write_region(
            0,
            j,
            &DistMatrix::from_replicated(Arc::clone(&grid), xj.desc(), &xj_repl),
        );

        if jend < k {
            // X[:, jend..] -= X_j * L[jend.., j..jend]^H from the locally
            // held factor entries, folded over the world.
            let l_block = l.extract_region(jend, j, k - jend, jnb);
            let mut partial = Matrix::zeros(nb, k - jend);
            for lj in 0..l_block.local().width() {
                let s = l_block.global_col(lj);
                for li in 0..l_block.local().height() {
                    let g = l_block.global_row(li);
                    let lv = l_block.local().get(li, lj).conj();
                    for t in 0..nb {
                        partial.update(t, g, |u| u - xj_repl.get(t, s) * lv);
                    }
                }
            }
            let mut part =
                DistMatrix::new(Arc::clone(&grid), DistDesc::replicated(), nb, k - jend);
            part.replace_local(partial);
            let mut tail = x.extract_region(0, jend, nb, k - jend);
            sum_scatter(&part, &mut tail, true)?;
            x.write_region(0, jend, &tail);
        }
    }
    Ok(())
}
