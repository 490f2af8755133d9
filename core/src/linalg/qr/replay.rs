//! Q-phase of the row-distributed algorithm.
//!
//! Once `R` is final, the recorded factors are multiplied into an identity-initialized `Q`
//! one tile column at a time: `Q <- Q * L_c * G_c`, where `L_c` is block diagonal with every
//! worker's local panel factor and `G_c` is the composed product of the column's merges.
//!
//! `Q` is distributed by rows, so every worker needs every block of `L_c` and `G_c` to update
//! its rows. All blocks are therefore broadcast, and every worker joins every broadcast, even
//! workers without rows of `Q`.

use super::merge_index::MergeIndex;
use super::records::{ColumnRecords, FactorArena, LocalFactor};
use super::tree::{panel_tile, participants};
use super::{QrError, Result};
use crate::dndarray::{DistributedMatrix, offsets_of};
use crate::distributed::{Communicator, Payload, Request};
use crate::tensor::{FloatElem, Tensor};
use crate::tiling::TileGrid;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Multiplies the factors of every recorded column into `q`, in column order.
pub(crate) fn q_phase<T, C>(
    q: &mut DistributedMatrix<T>,
    grid: &TileGrid,
    arena: FactorArena<T>,
    comm: &C,
) -> Result<()>
where
    T: FloatElem,
    C: Communicator,
{
    let counts = grid.shares();
    debug!(rank = comm.rank(), columns = arena.len(), "replaying q");
    for mut records in arena.into_columns() {
        replay_column(q, grid, &counts, &mut records, comm)?;
    }
    Ok(())
}

fn replay_column<T, C>(
    q: &mut DistributedMatrix<T>,
    grid: &TileGrid,
    counts: &[usize],
    records: &mut ColumnRecords<T>,
    comm: &C,
) -> Result<()>
where
    T: FloatElem,
    C: Communicator,
{
    let rank = comm.rank();
    let (column, diag) = (records.column, records.diag);
    let plan = BroadcastPlan::new(counts, diag);
    debug!(rank, column, diag, "replaying column");

    if rank == diag {
        trace!(rank, column, pending = records.pending_len(), "collecting merge factors");
        records.collect_pending(comm)?;
    }

    apply_local_factors(q, counts, &plan, records.take_local(), comm)?;

    let index = if rank == diag {
        let mut index = MergeIndex::new();
        for merge in records.take_merges() {
            let upper = panel_tile(grid, column, diag, merge.key.upper);
            let lower = panel_tile(grid, column, diag, merge.key.lower);
            index.compose(upper, lower, &merge.q, merge.upper_rows, merge.lower_rows)?;
        }
        Some(index)
    } else {
        None
    };
    apply_merges(q, grid, &plan, index, comm)
}

/// The broadcasts of one column, in the order every worker issues them.
///
/// First one base block per active worker, rooted at that worker. Then the merge keys and
/// one block per key, all rooted at the diagonal worker. Depends only on the shares and the
/// diagonal worker, so all workers derive the same plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BroadcastPlan {
    bases: Vec<usize>,
    merge_root: usize,
}

impl BroadcastPlan {
    pub(crate) fn new(counts: &[usize], diag: usize) -> Self {
        Self {
            bases: participants(counts, diag),
            merge_root: diag,
        }
    }

    /// Roots of the base block broadcasts.
    pub(crate) fn base_roots(&self) -> &[usize] {
        &self.bases
    }

    /// Root of the key list and of every merge block.
    pub(crate) fn merge_root(&self) -> usize {
        self.merge_root
    }

    /// Posts one broadcast per `(root, payload)` pair, in order.
    ///
    /// `payload` must be `Some` exactly on the root.
    fn post<M, C, I>(comm: &C, broadcasts: I) -> Result<Vec<(usize, Request<M>)>>
    where
        M: Payload,
        C: Communicator,
        I: IntoIterator<Item = (usize, Option<M>)>,
    {
        broadcasts
            .into_iter()
            .map(|(root, payload)| -> Result<(usize, Request<M>)> {
                Ok((root, comm.ibcast(payload, root)?))
            })
            .collect()
    }
}

/// Broadcasts every active worker's base block and right-multiplies it into its columns.
fn apply_local_factors<T, C>(
    q: &mut DistributedMatrix<T>,
    counts: &[usize],
    plan: &BroadcastPlan,
    local: Option<LocalFactor<T>>,
    comm: &C,
) -> Result<()>
where
    T: FloatElem,
    C: Communicator,
{
    let rank = comm.rank();
    let mut own = if plan.base_roots().contains(&rank) {
        let factor = local.ok_or_else(|| {
            QrError::Protocol(format!("rank {} has no local factor to broadcast", rank))
        })?;
        Some(base_block(factor, counts[rank])?)
    } else {
        None
    };
    let broadcasts = plan
        .base_roots()
        .iter()
        .map(|&root| (root, if root == rank { own.take() } else { None }));
    let requests = BroadcastPlan::post(comm, broadcasts)?;

    let offsets = offsets_of(counts);
    let rows = q.local().rows();
    for (root, request) in requests {
        let base = request.wait(comm)?;
        trace!(rank, root, size = base.rows(), "base block");
        if rows == 0 {
            continue;
        }
        let cols = offsets[root]..offsets[root] + counts[root];
        if base.shape() != &[cols.len(), cols.len()] {
            return Err(QrError::Protocol(format!(
                "base block of rank {} is {:?}, expected {} rows",
                root,
                base.shape(),
                cols.len()
            )));
        }
        let strip = q.local().slice(0..rows, cols.clone())?;
        q.local_mut().assign(0, cols.start, &strip.matmul(&base)?)?;
    }
    Ok(())
}

/// The local factor as an operator on all of the worker's rows.
fn base_block<T: FloatElem>(factor: LocalFactor<T>, count: usize) -> Result<Tensor<T, 2>> {
    if factor.local_start == 0 && factor.q.rows() == count {
        return Ok(factor.q);
    }
    let mut base = Tensor::eye(count);
    base.assign(factor.local_start, factor.local_start, &factor.q)?;
    Ok(base)
}

/// Broadcasts the merge index from the diagonal worker and applies it to every worker's rows of `q`.
fn apply_merges<T, C>(
    q: &mut DistributedMatrix<T>,
    grid: &TileGrid,
    plan: &BroadcastPlan,
    index: Option<MergeIndex<T>>,
    comm: &C,
) -> Result<()>
where
    T: FloatElem,
    C: Communicator,
{
    let root = plan.merge_root();
    let keys = comm.bcast(index.as_ref().map(MergeIndex::keys), root)?;
    if keys.is_empty() {
        return Ok(());
    }

    let mut blocks = index.map(|index| index.into_blocks());
    let broadcasts = keys.iter().map(|_| {
        let block = blocks.as_mut().and_then(|b| b.next()).map(|(_, block)| block);
        (root, block)
    });
    let posted = BroadcastPlan::post(comm, broadcasts)?;
    let requests: Vec<((usize, usize), Request<Tensor<T, 2>>)> = keys
        .iter()
        .copied()
        .zip(posted.into_iter().map(|(_, request)| request))
        .collect();

    let rows = q.local().rows();
    if rows == 0 {
        for (_, request) in requests {
            request.wait(comm)?;
        }
        return Ok(());
    }

    let bounds = grid.row_bounds();
    let snapshot = q.local().clone();
    let mut acc: BTreeMap<usize, Tensor<T, 2>> = BTreeMap::new();
    for ((x, y), request) in requests {
        let block = request.wait(comm)?;
        trace!(rank = comm.rank(), x, y, "merge block");
        let start = bounds[x];
        let strip = snapshot.slice(0..rows, start..start + block.rows())?;
        let contribution = strip.matmul(&block)?;
        let sum = match acc.remove(&y) {
            None => contribution,
            Some(prev) => {
                let width = prev.cols().max(contribution.cols());
                (&prev.pad_cols(width)? + &contribution.pad_cols(width)?)?
            }
        };
        acc.insert(y, sum);
    }
    for (y, block) in acc {
        q.local_mut().assign(0, bounds[y], &block)?;
    }
    Ok(())
}
