//! Tile-by-tile elimination for column-distributed matrices.
//!
//! With columns distributed, a diagonal tile and every tile below it live on the same worker.
//! That worker factorizes the diagonal tile, then folds the tiles below into it one at a
//! time. Each orthogonal factor is broadcast; the other workers apply it to their trailing
//! columns and every worker applies it to its rows of `Q` straight away.
//!
//! Workers without columns still join every broadcast. They learn the factor's shape from a
//! point-to-point notice sent by the diagonal worker just before the broadcast.

use super::{QrError, Result, TagKind, tag};
use crate::dndarray::DistributedMatrix;
use crate::distributed::Communicator;
use crate::tensor::{FloatElem, Tensor};
use crate::tiling::TileGrid;
use tracing::{debug, trace};

/// Reduces `a` to `R` in place and, if given, accumulates the factors into `q`.
pub(crate) fn eliminate<T, C>(
    a: &mut DistributedMatrix<T>,
    grid: &TileGrid,
    mut q: Option<&mut DistributedMatrix<T>>,
    comm: &C,
) -> Result<()>
where
    T: FloatElem,
    C: Communicator,
{
    let rank = comm.rank();
    let counts = a.counts().to_vec();
    let bounds = grid.row_bounds().to_vec();
    let height = |t: usize| bounds[t + 1] - bounds[t];

    for column in 0..grid.diagonal_columns() {
        let diag = grid.owning_process(column, column);
        debug!(rank, column, diag, "eliminating column");
        let diagonal = column..column + 1;

        let factor = if rank == diag {
            let tile = grid.local_get(a, diagonal.clone(), diagonal.clone())?;
            let (q1, r) = tile.qr()?;
            grid.local_set(a, diagonal.clone(), diagonal.clone(), &r)?;
            Some(q1)
        } else {
            None
        };
        let q1 = share_factor(factor, height(column), column, diag, &counts, comm)?;
        update_trailing(a, grid, column, &[column], &q1)?;
        if let Some(q) = q.as_deref_mut() {
            apply_to_q(q, grid, &[column], &q1)?;
        }

        for below in column + 1..grid.tile_rows() {
            let factor = if rank == diag {
                let top = grid.local_get(a, diagonal.clone(), diagonal.clone())?;
                let bottom = grid.local_get(a, below..below + 1, diagonal.clone())?;
                let (ql, r) = top.vstack(&bottom)?.qr()?;
                let (h, w) = (top.rows(), top.cols());
                grid.local_set(a, diagonal.clone(), diagonal.clone(), &r.slice(0..h, 0..w)?)?;
                let rest = r.slice(h..h + bottom.rows(), 0..w)?;
                grid.local_set(a, below..below + 1, diagonal.clone(), &rest)?;
                Some(ql)
            } else {
                None
            };
            let size = height(column) + height(below);
            let ql = share_factor(factor, size, column, diag, &counts, comm)?;
            update_trailing(a, grid, column, &[column, below], &ql)?;
            if let Some(q) = q.as_deref_mut() {
                apply_to_q(q, grid, &[column, below], &ql)?;
            }
        }
    }
    Ok(())
}

/// Broadcasts the diagonal worker's `size x size` factor to everybody.
fn share_factor<T, C>(
    factor: Option<Tensor<T, 2>>,
    size: usize,
    column: usize,
    diag: usize,
    counts: &[usize],
    comm: &C,
) -> Result<Tensor<T, 2>>
where
    T: FloatElem,
    C: Communicator,
{
    let rank = comm.rank();
    let notice_tag = |dest: usize| tag(TagKind::Shape, column, 0, diag, dest);

    let expected = if rank == diag {
        for dest in (0..counts.len()).filter(|&p| counts[p] == 0) {
            comm.send([size, size], dest, notice_tag(dest))?;
        }
        [size, size]
    } else if counts[rank] == 0 {
        comm.recv::<[usize; 2]>(diag, notice_tag(rank))?
    } else {
        [size, size]
    };

    let factor = comm.bcast(factor, diag)?;
    trace!(rank, column, diag, size, "factor broadcast");
    if factor.shape() != &expected {
        return Err(QrError::Protocol(format!(
            "factor from rank {} is {:?}, expected {:?}",
            diag,
            factor.shape(),
            expected
        )));
    }
    Ok(factor)
}

/// Applies `factor^T` to the stacked `tile_rows` of every local tile column right of `column`.
fn update_trailing<T: FloatElem>(
    a: &mut DistributedMatrix<T>,
    grid: &TileGrid,
    column: usize,
    tile_rows: &[usize],
    factor: &Tensor<T, 2>,
) -> Result<()> {
    let rank = a.rank();
    let cols = (column + 1).max(grid.process_tile_start(rank))..grid.process_tile_start(rank + 1);
    if cols.is_empty() {
        return Ok(());
    }

    let mut stacked: Option<Tensor<T, 2>> = None;
    for &t in tile_rows {
        let block = grid.local_get(a, t..t + 1, cols.clone())?;
        stacked = Some(match stacked {
            None => block,
            Some(top) => top.vstack(&block)?,
        });
    }
    let Some(stacked) = stacked else {
        return Ok(());
    };
    let updated = factor.transpose()?.matmul(&stacked)?;

    let mut offset = 0;
    for &t in tile_rows {
        let h = grid.row_bounds()[t + 1] - grid.row_bounds()[t];
        let part = updated.slice(offset..offset + h, 0..updated.cols())?;
        grid.local_set(a, t..t + 1, cols.clone(), &part)?;
        offset += h;
    }
    Ok(())
}

/// `[Q_a Q_b ...] <- [Q_a Q_b ...] * factor` on the caller's rows of `q`.
///
/// For two tile rows this is the familiar split into `TL`, `TR`, `BL` and `BR`.
fn apply_to_q<T: FloatElem>(
    q: &mut DistributedMatrix<T>,
    grid: &TileGrid,
    tile_rows: &[usize],
    factor: &Tensor<T, 2>,
) -> Result<()> {
    let rows = q.local().rows();
    if rows == 0 {
        return Ok(());
    }
    let bounds = grid.row_bounds();
    let mut offsets = Vec::with_capacity(tile_rows.len());
    let mut acc = 0;
    for &t in tile_rows {
        offsets.push(acc..acc + bounds[t + 1] - bounds[t]);
        acc += bounds[t + 1] - bounds[t];
    }
    let strips = tile_rows
        .iter()
        .map(|&t| q.local().slice(0..rows, bounds[t]..bounds[t + 1]))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (&target, out_range) in tile_rows.iter().zip(&offsets) {
        let mut sum = Tensor::zeros([rows, out_range.len()]);
        for (strip, in_range) in strips.iter().zip(&offsets) {
            let block = factor.slice(in_range.clone(), out_range.clone())?;
            sum = (&sum + &strip.matmul(&block)?)?;
        }
        q.local_mut().assign(0, bounds[target], &sum)?;
    }
    Ok(())
}
