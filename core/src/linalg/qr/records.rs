//! Bookkeeping of the orthogonal factors produced while reducing a tile column.
//!
//! The R-phase leaves behind, per tile column and per worker, at most one local panel
//! factor and, on the diagonal worker, the factors of the pairwise merges. Merges computed
//! elsewhere are still in flight when the R-phase ends; they are parked as
//! [`PendingFactor`]s and collected right before the column is replayed.

use super::Result;
use super::tree::MergeKey;
use crate::distributed::{Communicator, Request};
use crate::tensor::{FloatElem, Tensor};
use std::collections::BTreeMap;

/// Orthogonal factor of a worker's local panel.
#[derive(Clone, Debug)]
pub(crate) struct LocalFactor<T: FloatElem> {
    pub q: Tensor<T, 2>,
    /// First local row of the panel.
    pub local_start: usize,
}

/// Orthogonal factor of one pairwise merge, split as `[[TL, TR], [BL, BR]]` by the heights
/// of the upper and lower blocks.
#[derive(Clone, Debug)]
pub(crate) struct PartialFactor<T: FloatElem> {
    pub key: MergeKey,
    pub q: Tensor<T, 2>,
    pub upper_rows: usize,
    pub lower_rows: usize,
}

/// A merge factor on its way to the diagonal worker.
#[derive(Debug)]
pub(crate) struct PendingFactor<T: FloatElem> {
    pub key: MergeKey,
    pub request: Request<Tensor<T, 2>>,
    pub upper_rows: usize,
    pub lower_rows: usize,
}

/// Everything one worker recorded for one tile column.
#[derive(Debug)]
pub(crate) struct ColumnRecords<T: FloatElem> {
    pub column: usize,
    pub diag: usize,
    local: Option<LocalFactor<T>>,
    merges: BTreeMap<MergeKey, PartialFactor<T>>,
    pending: Vec<PendingFactor<T>>,
}

impl<T: FloatElem> ColumnRecords<T> {
    pub fn new(column: usize, diag: usize) -> Self {
        Self {
            column,
            diag,
            local: None,
            merges: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn set_local(&mut self, factor: LocalFactor<T>) {
        self.local = Some(factor);
    }

    pub fn insert_merge(&mut self, factor: PartialFactor<T>) {
        self.merges.insert(factor.key, factor);
    }

    pub fn push_pending(&mut self, pending: PendingFactor<T>) {
        self.pending.push(pending);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Blocks until every in-flight merge factor has arrived.
    pub fn collect_pending<C: Communicator>(&mut self, comm: &C) -> Result<()> {
        for pending in std::mem::take(&mut self.pending) {
            let q = pending.request.wait(comm)?;
            self.insert_merge(PartialFactor {
                key: pending.key,
                q,
                upper_rows: pending.upper_rows,
                lower_rows: pending.lower_rows,
            });
        }
        Ok(())
    }

    pub fn take_local(&mut self) -> Option<LocalFactor<T>> {
        self.local.take()
    }

    /// Hands out the merge factors in ascending key order, leaving none behind.
    pub fn take_merges(&mut self) -> impl Iterator<Item = PartialFactor<T>> + use<T> {
        std::mem::take(&mut self.merges).into_values()
    }
}

/// Per-column records of one factorization call.
#[derive(Debug)]
pub(crate) struct FactorArena<T: FloatElem> {
    columns: Vec<ColumnRecords<T>>,
}

impl<T: FloatElem> FactorArena<T> {
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
        }
    }

    pub fn push(&mut self, records: ColumnRecords<T>) {
        self.columns.push(records);
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn into_columns(self) -> impl Iterator<Item = ColumnRecords<T>> {
        self.columns.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{ChannelCommunicator, Tag};

    fn key(level: usize, upper: usize, lower: usize) -> MergeKey {
        MergeKey {
            level,
            upper,
            lower,
        }
    }

    #[test]
    fn test_merges_come_out_sorted_once() {
        let mut records = ColumnRecords::<f64>::new(0, 0);
        for k in [key(2, 0, 1), key(0, 1, 3), key(0, 0, 2)] {
            records.insert_merge(PartialFactor {
                key: k,
                q: Tensor::eye(2),
                upper_rows: 1,
                lower_rows: 1,
            });
        }
        let order: Vec<_> = records.take_merges().map(|f| f.key).collect();
        assert_eq!(order, vec![key(0, 0, 2), key(0, 1, 3), key(2, 0, 1)]);
        assert_eq!(records.take_merges().count(), 0);
    }

    #[test]
    fn test_collect_pending() {
        let comms = ChannelCommunicator::group(2);
        let tag = Tag::new(42);
        comms[1].send(Tensor::<f64, 2>::eye(2), 0, tag).unwrap();

        let mut records = ColumnRecords::<f64>::new(0, 0);
        records.push_pending(PendingFactor {
            key: key(1, 1, 2),
            request: comms[0].irecv(1, tag),
            upper_rows: 1,
            lower_rows: 1,
        });
        assert_eq!(records.pending_len(), 1);
        records.collect_pending(&comms[0]).unwrap();
        assert_eq!(records.pending_len(), 0);

        let merges: Vec<_> = records.take_merges().collect();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].q, Tensor::eye(2));
    }

    #[test]
    fn test_local_is_taken_once() {
        let mut records = ColumnRecords::<f64>::new(1, 0);
        records.set_local(LocalFactor {
            q: Tensor::eye(3),
            local_start: 2,
        });
        assert_eq!(records.take_local().map(|f| f.local_start), Some(2));
        assert!(records.take_local().is_none());
    }
}
