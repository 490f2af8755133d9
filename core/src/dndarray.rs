//! Distributed matrices.
//!
//! A [`DistributedMatrix`] is a global `m x n` matrix of which every worker holds one
//! contiguous share. The share is cut along the *split axis*:
//!
//! - [`Split::Rows`]: worker `p` owns rows `offsets[p]..offsets[p] + counts[p]`.
//! - [`Split::Cols`]: worker `p` owns the same range of columns.
//! - [`Split::Replicated`]: every worker owns a full copy.
//!
//! Shares may be uneven or empty. [`DistributedMatrix::balance`] moves data between workers
//! until the shares match the balanced chunking, where the first `len % p` workers receive
//! one extra row (or column).
//!
//! ```rust
//! use tiled_qr::dndarray::{DistributedMatrix, Split};
//! use tiled_qr::distributed::ChannelCommunicator;
//! use tiled_qr::tensor::Tensor;
//!
//! let global = Tensor::<f64, 2>::new((0..10).map(f64::from).collect(), [5, 2]).unwrap();
//! let shapes = ChannelCommunicator::spawn_group(2, |comm| {
//!     let a = DistributedMatrix::from_global(&global, Split::Rows, &comm).unwrap();
//!     *a.local().shape()
//! });
//! assert_eq!(shapes, vec![[3, 2], [2, 2]]);
//! ```

use crate::distributed::{CommError, Communicator};
use crate::tensor::{Tensor, TensorElem, TensorError};
use std::ops::Range;
use thiserror::Error;

/// Error type for distributed matrix construction and redistribution.
#[derive(Error, Debug)]
pub enum ArrayError {
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Comm(#[from] CommError),
    /// Shares that do not add up to the global shape, or a local block of the wrong size.
    #[error("Invalid layout: {0}")]
    Layout(String),
}

pub type Result<T> = std::result::Result<T, ArrayError>;

/// Axis along which a matrix is distributed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Split {
    Replicated,
    Rows,
    Cols,
}

impl Split {
    /// Index of the split axis, `None` for replicated matrices.
    pub const fn axis(self) -> Option<usize> {
        match self {
            Split::Replicated => None,
            Split::Rows => Some(0),
            Split::Cols => Some(1),
        }
    }
}

/// Balanced chunking of `len` items over `parts` workers.
pub fn balanced_counts(len: usize, parts: usize) -> Vec<usize> {
    let base = len / parts.max(1);
    let extra = len % parts.max(1);
    (0..parts).map(|p| base + usize::from(p < extra)).collect()
}

/// Exclusive prefix sums of `counts`.
pub fn offsets_of(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0, |acc, &c| {
            let start = *acc;
            *acc += c;
            Some(start)
        })
        .collect()
}

/// A matrix distributed across the workers of a communicator.
#[derive(Clone, Debug)]
pub struct DistributedMatrix<T>
where
    T: TensorElem,
{
    gshape: [usize; 2],
    split: Split,
    rank: usize,
    counts: Vec<usize>,
    local: Tensor<T, 2>,
}

impl<T> DistributedMatrix<T>
where
    T: TensorElem,
{
    /// Cuts this worker's balanced share out of a matrix every worker holds.
    pub fn from_global<C: Communicator>(
        global: &Tensor<T, 2>,
        split: Split,
        comm: &C,
    ) -> Result<Self> {
        let counts = match split.axis() {
            Some(axis) => balanced_counts(global.shape()[axis], comm.world_size()),
            None => Vec::new(),
        };
        Self::from_counts(global, split, &counts, comm)
    }

    /// Cuts this worker's share out of a global matrix using explicit per-worker extents.
    pub fn from_counts<C: Communicator>(
        global: &Tensor<T, 2>,
        split: Split,
        counts: &[usize],
        comm: &C,
    ) -> Result<Self> {
        let gshape = *global.shape();
        let rank = comm.rank();
        let Some(axis) = split.axis() else {
            return Ok(Self {
                gshape,
                split,
                rank,
                counts: Vec::new(),
                local: global.clone(),
            });
        };
        check_counts(counts, gshape[axis], comm.world_size())?;
        let start = offsets_of(counts)[rank];
        let local = cut(global, axis, start..start + counts[rank])?;
        Ok(Self {
            gshape,
            split,
            rank,
            counts: counts.to_vec(),
            local,
        })
    }

    /// Assembles a distributed matrix from the shares the workers already hold.
    ///
    /// Collective: every worker contributes the extent of its share along the split axis.
    pub fn from_local<C: Communicator>(local: Tensor<T, 2>, split: Split, comm: &C) -> Result<Self> {
        let rank = comm.rank();
        let Some(axis) = split.axis() else {
            return Ok(Self {
                gshape: *local.shape(),
                split,
                rank,
                counts: Vec::new(),
                local,
            });
        };
        let shapes = comm.all_gather(*local.shape())?;
        let other = 1 - axis;
        if shapes.iter().any(|s| s[other] != local.shape()[other]) {
            return Err(ArrayError::Layout(format!(
                "local shares disagree on axis {}: {:?}",
                other, shapes
            )));
        }
        let counts: Vec<usize> = shapes.iter().map(|s| s[axis]).collect();
        let mut gshape = *local.shape();
        gshape[axis] = counts.iter().sum();
        Ok(Self {
            gshape,
            split,
            rank,
            counts,
            local,
        })
    }

    /// The `n x n` identity, balanced along `split`.
    pub fn eye<C: Communicator>(n: usize, split: Split, comm: &C) -> Result<Self> {
        let counts = match split.axis() {
            Some(_) => balanced_counts(n, comm.world_size()),
            None => Vec::new(),
        };
        Self::eye_with_counts(n, split, &counts, comm)
    }

    /// The `n x n` identity with explicit per-worker extents along `split`.
    pub fn eye_with_counts<C: Communicator>(
        n: usize,
        split: Split,
        counts: &[usize],
        comm: &C,
    ) -> Result<Self> {
        let rank = comm.rank();
        let Some(axis) = split.axis() else {
            return Ok(Self {
                gshape: [n, n],
                split,
                rank,
                counts: Vec::new(),
                local: Tensor::eye(n),
            });
        };
        check_counts(counts, n, comm.world_size())?;
        let start = offsets_of(counts)[rank];
        let mut shape = [n, n];
        shape[axis] = counts[rank];
        let mut local = Tensor::zeros(shape);
        let cols = shape[1];
        for i in 0..counts[rank] {
            let (r, c) = if axis == 0 { (i, start + i) } else { (start + i, i) };
            local.data_mut()[r * cols + c] = T::one();
        }
        Ok(Self {
            gshape: [n, n],
            split,
            rank,
            counts: counts.to_vec(),
            local,
        })
    }

    pub const fn gshape(&self) -> [usize; 2] {
        self.gshape
    }

    pub const fn split(&self) -> Split {
        self.split
    }

    pub const fn rank(&self) -> usize {
        self.rank
    }

    /// Extent of every worker's share along the split axis. Empty when replicated.
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn offsets(&self) -> Vec<usize> {
        offsets_of(&self.counts)
    }

    pub fn local(&self) -> &Tensor<T, 2> {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut Tensor<T, 2> {
        &mut self.local
    }

    pub fn into_local(self) -> Tensor<T, 2> {
        self.local
    }

    /// Global index range along the split axis owned by `rank`.
    pub fn local_range(&self, rank: usize) -> Range<usize> {
        match self.split.axis() {
            None => 0..self.gshape[0],
            Some(_) => {
                let start: usize = self.counts[..rank].iter().sum();
                start..start + self.counts[rank]
            }
        }
    }

    pub fn is_balanced(&self) -> bool {
        match self.split.axis() {
            None => true,
            Some(axis) => self.counts == balanced_counts(self.gshape[axis], self.counts.len()),
        }
    }

    /// Redistributes the shares to the balanced chunking. No-op if already balanced.
    pub fn balance<C: Communicator>(&mut self, comm: &C) -> Result<()> {
        let Some(axis) = self.split.axis() else {
            return Ok(());
        };
        let target = balanced_counts(self.gshape[axis], comm.world_size());
        self.redistribute(&target, comm)
    }

    /// Moves rows (or columns) between workers until the shares equal `target`.
    ///
    /// Collective unless the shares already equal `target`, in which case nobody
    /// communicates.
    pub fn redistribute<C: Communicator>(&mut self, target: &[usize], comm: &C) -> Result<()> {
        let Some(axis) = self.split.axis() else {
            return Ok(());
        };
        check_counts(target, self.gshape[axis], comm.world_size())?;
        if self.counts == target {
            return Ok(());
        }

        let tag = comm.next_collective_tag();
        let rank = self.rank;
        let src = offsets_of(&self.counts);
        let dst = offsets_of(target);
        let mine = src[rank]..src[rank] + self.counts[rank];
        let want = dst[rank]..dst[rank] + target[rank];

        for dest in (0..target.len()).filter(|&d| d != rank) {
            let overlap = intersect(&mine, &(dst[dest]..dst[dest] + target[dest]));
            if !overlap.is_empty() {
                let block = cut(&self.local, axis, shift(&overlap, mine.start))?;
                comm.send(block, dest, tag)?;
            }
        }

        let mut shape = self.gshape;
        shape[axis] = target[rank];
        let mut local = Tensor::zeros(shape);
        for source in 0..self.counts.len() {
            let overlap = intersect(&(src[source]..src[source] + self.counts[source]), &want);
            if overlap.is_empty() {
                continue;
            }
            let block = if source == rank {
                cut(&self.local, axis, shift(&overlap, mine.start))?
            } else {
                comm.recv::<Tensor<T, 2>>(source, tag)?
            };
            place(&mut local, axis, overlap.start - want.start, &block)?;
        }

        self.local = local;
        self.counts = target.to_vec();
        Ok(())
    }

    /// Collects the full matrix on every worker.
    pub fn gather<C: Communicator>(&self, comm: &C) -> Result<Tensor<T, 2>> {
        let Some(axis) = self.split.axis() else {
            return Ok(self.local.clone());
        };
        let blocks = comm.all_gather(self.local.clone())?;
        let mut out = Tensor::zeros(self.gshape);
        for (block, start) in blocks.iter().zip(offsets_of(&self.counts)) {
            place(&mut out, axis, start, block)?;
        }
        Ok(out)
    }

    /// Drops every global row at index `rows` and beyond.
    pub fn truncate_rows(&mut self, rows: usize) -> Result<()> {
        self.truncate_axis(0, rows)
    }

    /// Drops every global column at index `cols` and beyond.
    pub fn truncate_cols(&mut self, cols: usize) -> Result<()> {
        self.truncate_axis(1, cols)
    }

    fn truncate_axis(&mut self, axis: usize, len: usize) -> Result<()> {
        if len >= self.gshape[axis] {
            return Ok(());
        }
        self.gshape[axis] = len;
        let keep = if self.split.axis() == Some(axis) {
            let offsets = offsets_of(&self.counts);
            for (count, start) in self.counts.iter_mut().zip(offsets) {
                *count = len.saturating_sub(start).min(*count);
            }
            self.counts[self.rank]
        } else {
            len
        };
        self.local = cut(&self.local, axis, 0..keep)?;
        Ok(())
    }
}

fn check_counts(counts: &[usize], len: usize, world_size: usize) -> Result<()> {
    if counts.len() != world_size || counts.iter().sum::<usize>() != len {
        return Err(ArrayError::Layout(format!(
            "shares {:?} do not cover {} entries on {} workers",
            counts, len, world_size
        )));
    }
    Ok(())
}

fn intersect(a: &Range<usize>, b: &Range<usize>) -> Range<usize> {
    let start = a.start.max(b.start);
    start..a.end.min(b.end).max(start)
}

fn shift(r: &Range<usize>, by: usize) -> Range<usize> {
    r.start - by..r.end - by
}

fn cut<T: TensorElem>(t: &Tensor<T, 2>, axis: usize, range: Range<usize>) -> Result<Tensor<T, 2>> {
    let [m, n] = *t.shape();
    let block = if axis == 0 {
        t.slice(range, 0..n)?
    } else {
        t.slice(0..m, range)?
    };
    Ok(block)
}

fn place<T: TensorElem>(
    t: &mut Tensor<T, 2>,
    axis: usize,
    at: usize,
    block: &Tensor<T, 2>,
) -> Result<()> {
    if axis == 0 {
        t.assign(at, 0, block)?;
    } else {
        t.assign(0, at, block)?;
    }
    Ok(())
}
