//! Reduction tree of the row-distributed R-phase.
//!
//! After the local panel factorizations every participating worker holds a `w x w`
//! triangle at the top of its panel. Pairs of workers stack their triangles, factorize the
//! stack and keep one half each; the upper worker keeps the new triangle and moves on to the
//! next level while the lower worker is done. The last survivor is the diagonal worker.
//!
//! ```text
//! level 0:   0 <- 2     1 <- 3        (4 is held back)
//! level 1:   0 <- 1
//! level 2:   0 <- 4
//! ```
//!
//! The schedule is a pure function of the participant list, so every worker derives the same
//! sequence of merges and the diagonal worker knows in advance which factors it will receive.

use super::records::{ColumnRecords, FactorArena, PartialFactor, PendingFactor};
use super::{Result, TagKind, panel, tag};
use crate::dndarray::DistributedMatrix;
use crate::distributed::{Communicator, Tag};
use crate::tensor::{FloatElem, Tensor};
use crate::tiling::TileGrid;
use tracing::{debug, trace};

/// Identifies one merge within a tile column. Ascending order is a valid replay order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct MergeKey {
    pub level: usize,
    pub upper: usize,
    pub lower: usize,
}

impl MergeKey {
    pub fn involves(&self, rank: usize) -> bool {
        self.upper == rank || self.lower == rank
    }

    pub fn partner(&self, rank: usize) -> usize {
        if self.upper == rank {
            self.lower
        } else {
            self.upper
        }
    }
}

/// Pairwise merges that collapse `participants` onto `participants[0]`.
///
/// Each round pairs the first half with the second half by position. An odd worker out is
/// held back; two held workers are merged with each other, and the last one held is merged
/// into the survivor once the main tree is down to a single worker.
pub(crate) fn reduction_schedule(participants: &[usize]) -> Vec<MergeKey> {
    let mut remaining = participants.to_vec();
    let mut held: Vec<usize> = Vec::with_capacity(2);
    let mut merges = Vec::new();
    let mut level = 0;

    loop {
        if remaining.len() > 1 {
            if remaining.len() % 2 == 1 {
                held.extend(remaining.pop());
            }
            let half = remaining.len() / 2;
            for i in 0..half {
                merges.push(MergeKey {
                    level,
                    upper: remaining[i],
                    lower: remaining[half + i],
                });
            }
            remaining.truncate(half);
            level += 1;

            if let [older, newer] = held[..] {
                merges.push(MergeKey {
                    level,
                    upper: newer,
                    lower: older,
                });
                level += 1;
                held = vec![newer];
            }
        } else if let (Some(&survivor), Some(lower)) = (remaining.first(), held.pop()) {
            merges.push(MergeKey {
                level,
                upper: survivor,
                lower,
            });
            level += 1;
        } else {
            break;
        }
    }
    merges
}

/// Workers taking part in the reduction of a column whose diagonal tile is on `diag`.
pub(crate) fn participants(counts: &[usize], diag: usize) -> Vec<usize> {
    (diag..counts.len()).filter(|&p| counts[p] > 0).collect()
}

/// First tile row of `rank`'s panel in `column`; its triangle is merged from there.
pub(crate) fn panel_tile(grid: &TileGrid, column: usize, diag: usize, rank: usize) -> usize {
    if rank == diag {
        column
    } else {
        grid.process_tile_start(rank)
    }
}

/// Runs the R-phase over every diagonal tile column.
///
/// With `record` set, the local and merge factors needed to build `Q` are kept; merge factors
/// computed away from the diagonal worker are sent there without waiting for delivery.
pub(crate) fn r_phase<T, C>(
    a: &mut DistributedMatrix<T>,
    grid: &TileGrid,
    comm: &C,
    record: bool,
) -> Result<FactorArena<T>>
where
    T: FloatElem,
    C: Communicator,
{
    let rank = comm.rank();
    let mut arena = FactorArena::new();

    for column in 0..grid.diagonal_columns() {
        let diag = grid.owning_process(column, column);
        let mut records = ColumnRecords::new(column, diag);
        let active = participants(a.counts(), diag);
        if !active.contains(&rank) {
            arena.push(records);
            continue;
        }
        debug!(rank, column, diag, active = active.len(), "reducing column");

        let first_tile = panel_tile(grid, column, diag, rank);
        let local = panel::factor_panel(a, grid, column, first_tile)?;
        let block_start = local.local_start;
        if record {
            records.set_local(local);
        }

        let (_, _, c0, c1) = grid.tile_extent(column, column);
        let width = c1 - c0;
        let schedule = reduction_schedule(&active);

        if record && rank == diag {
            for key in schedule.iter().filter(|k| !k.involves(diag)) {
                let factor_tag = tag(TagKind::Factor, column, key.level, key.upper, key.lower);
                let request = comm.irecv(key.lower, factor_tag);
                records.push_pending(PendingFactor {
                    key: *key,
                    request,
                    upper_rows: width,
                    lower_rows: width,
                });
            }
        }

        for key in schedule.iter().filter(|k| k.involves(rank)) {
            let q = merge_pair(a, grid, column, *key, block_start, comm)?;
            if !record {
                continue;
            }
            if rank == diag {
                records.insert_merge(PartialFactor {
                    key: *key,
                    q,
                    upper_rows: width,
                    lower_rows: width,
                });
            } else if rank == key.lower && key.upper != diag {
                let factor_tag = tag(TagKind::Factor, column, key.level, key.upper, key.lower);
                comm.isend(q, diag, factor_tag)?;
            }
        }
        arena.push(records);
    }
    Ok(arena)
}

/// One pairwise merge, executed by both workers of `key`.
///
/// The workers swap their `w x w` triangles (starting at local row `block_start`), factorize
/// `[upper; lower]` identically, and keep their half of the new `R`. If there are columns to
/// the right, the corresponding rows are swapped and updated with the transposed factor as
/// well. Returns the complete `2w x 2w` factor.
pub(crate) fn merge_pair<T, C>(
    a: &mut DistributedMatrix<T>,
    grid: &TileGrid,
    column: usize,
    key: MergeKey,
    block_start: usize,
    comm: &C,
) -> Result<Tensor<T, 2>>
where
    T: FloatElem,
    C: Communicator,
{
    let rank = comm.rank();
    let partner = key.partner(rank);
    let is_upper = rank == key.upper;
    let (_, _, c0, c1) = grid.tile_extent(column, column);
    let width = c1 - c0;
    let n = grid.gshape()[1];
    let rows = block_start..block_start + width;

    trace!(rank, column, level = key.level, partner, "merge");
    let block_tag = tag(TagKind::Block, column, key.level, key.upper, key.lower);
    let mine = a.local().slice(rows.clone(), c0..c1)?;
    let stacked = exchange(mine, partner, is_upper, block_tag, comm)?;
    let (q, r) = stacked.qr()?;
    let half = if is_upper { 0..width } else { width..2 * width };
    a.local_mut().assign(block_start, c0, &r.slice(half.clone(), 0..width)?)?;

    if c1 < n {
        let trailing_tag = tag(TagKind::Trailing, column, key.level, key.upper, key.lower);
        let mine = a.local().slice(rows, c1..n)?;
        let stacked = exchange(mine, partner, is_upper, trailing_tag, comm)?;
        let updated = q.transpose()?.matmul(&stacked)?;
        a.local_mut().assign(block_start, c1, &updated.slice(half, 0..n - c1)?)?;
    }
    Ok(q)
}

/// Swaps `mine` with the partner's block and returns `[upper; lower]`.
fn exchange<T, C>(
    mine: Tensor<T, 2>,
    partner: usize,
    is_upper: bool,
    tag: Tag,
    comm: &C,
) -> Result<Tensor<T, 2>>
where
    T: FloatElem,
    C: Communicator,
{
    comm.send(mine.clone(), partner, tag)?;
    let theirs: Tensor<T, 2> = comm.recv(partner, tag)?;
    let stacked = if is_upper {
        mine.vstack(&theirs)?
    } else {
        theirs.vstack(&mine)?
    };
    Ok(stacked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn pairs(merges: &[MergeKey]) -> Vec<(usize, usize, usize)> {
        merges.iter().map(|k| (k.level, k.upper, k.lower)).collect()
    }

    /// Every worker but the survivor is merged away exactly once, and only after its own
    /// incoming merges.
    fn check_schedule(participants: &[usize]) {
        let merges = reduction_schedule(participants);
        assert_eq!(merges.len(), participants.len() - 1);

        let mut sorted = merges.clone();
        sorted.sort();
        assert_eq!(sorted, merges, "schedule must already be in replay order");

        let mut gone = BTreeSet::new();
        for key in &merges {
            assert!(key.upper < key.lower);
            assert!(!gone.contains(&key.upper) && !gone.contains(&key.lower));
            gone.insert(key.lower);
        }
        assert!(!gone.contains(&participants[0]));
        let levels: BTreeSet<_> = merges.iter().map(|k| k.level).collect();
        for level in levels {
            let ranks: Vec<_> = merges
                .iter()
                .filter(|k| k.level == level)
                .flat_map(|k| [k.upper, k.lower])
                .collect();
            let unique: BTreeSet<_> = ranks.iter().collect();
            assert_eq!(unique.len(), ranks.len(), "level {} reuses a worker", level);
        }
    }

    #[test]
    fn test_schedule_small() {
        assert!(reduction_schedule(&[4]).is_empty());
        assert_eq!(pairs(&reduction_schedule(&[0, 1])), vec![(0, 0, 1)]);
        assert_eq!(pairs(&reduction_schedule(&[0, 1, 2])), vec![(0, 0, 1), (1, 0, 2)]);
    }

    #[test]
    fn test_schedule_seven_holds_two() {
        let merges = reduction_schedule(&[0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(
            pairs(&merges),
            vec![
                (0, 0, 3),
                (0, 1, 4),
                (0, 2, 5),
                (1, 0, 1),
                (2, 2, 6),
                (3, 0, 2),
            ]
        );
    }

    #[test]
    fn test_schedule_covers_every_worker() {
        for n in 1..=33 {
            let participants: Vec<usize> = (0..n).map(|i| i + 2).collect();
            check_schedule(&participants);
        }
        check_schedule(&[1, 4, 5, 9, 11]);
    }

    #[test]
    fn test_participants_skip_empty() {
        assert_eq!(participants(&[2, 0, 3, 1], 0), vec![0, 2, 3]);
        assert_eq!(participants(&[2, 2, 1, 0], 1), vec![1, 2]);
    }

    #[test]
    fn test_merge_key_partner() {
        let key = MergeKey {
            level: 0,
            upper: 1,
            lower: 4,
        };
        assert!(key.involves(4) && !key.involves(2));
        assert_eq!(key.partner(1), 4);
        assert_eq!(key.partner(4), 1);
    }
}
