use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;
use thiserror::Error;

/// Error type for communication between workers.
#[derive(Error, Debug)]
pub enum CommError {
    /// A message was addressed to a rank outside the group.
    #[error("Invalid rank {rank} for world size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },
    /// The channel to or from `rank` was closed.
    #[error("Channel of rank {rank} disconnected")]
    Disconnected { rank: usize },
    /// No matching message arrived within the configured receive timeout.
    #[error("Timed out after {timeout:?} waiting for {tag} from rank {peer}")]
    Timeout {
        peer: usize,
        tag: Tag,
        timeout: Duration,
    },
    /// A message matched on `(source, tag)` but carried a different type than expected.
    #[error("Payload type mismatch for {tag} from rank {peer}")]
    PayloadMismatch { peer: usize, tag: Tag },
    /// The root of a broadcast did not supply the value to broadcast.
    #[error("Broadcast root {root} has no payload")]
    MissingRootPayload { root: usize },
}

pub type Result<T> = std::result::Result<T, CommError>;

/// Message tag used to match sends with receives.
///
/// The top bit is reserved for collectives, so user tags are 63 bits wide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl Tag {
    const COLLECTIVE: u64 = 1 << 63;

    /// Creates a point-to-point tag. The reserved top bit is cleared.
    pub const fn new(value: u64) -> Self {
        Self(value & !Self::COLLECTIVE)
    }

    pub(crate) const fn collective(seq: u64) -> Self {
        Self(seq | Self::COLLECTIVE)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn is_collective(self) -> bool {
        self.0 & Self::COLLECTIVE != 0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_collective() {
            write!(f, "collective #{}", self.0 & !Self::COLLECTIVE)
        } else {
            write!(f, "tag {:#x}", self.0)
        }
    }
}

/// Anything that can travel between workers.
pub trait Payload: Clone + Send + 'static {}

impl<T> Payload for T where T: Clone + Send + 'static {}

/// Handle to a message exchange that may not have completed yet.
///
/// Receives are lazy: the handle records what to match and [`Request::wait`] blocks until a
/// matching message is available. Sends complete immediately.
#[derive(Debug)]
pub enum Request<M> {
    Complete(M),
    Pending {
        source: usize,
        tag: Tag,
        _marker: PhantomData<fn() -> M>,
    },
}

impl<M: Payload> Request<M> {
    pub fn pending(source: usize, tag: Tag) -> Self {
        Request::Pending {
            source,
            tag,
            _marker: PhantomData,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Request::Complete(_))
    }

    /// Blocks until the exchange has completed and returns its value.
    pub fn wait<C>(self, comm: &C) -> Result<M>
    where
        C: Communicator + ?Sized,
    {
        match self {
            Request::Complete(msg) => Ok(msg),
            Request::Pending { source, tag, .. } => comm.recv(source, tag),
        }
    }
}

/// Abstraction for the communication between the workers of one factorization.
///
/// Implementors provide the point-to-point primitives; the collectives are built on top of
/// them. Every worker must issue collectives in the same order.
pub trait Communicator: Send + Sync {
    /// Returns the rank of the current worker.
    fn rank(&self) -> usize;

    /// Returns the total number of workers.
    fn world_size(&self) -> usize;

    /// Sends `msg` to `dest`. Never blocks on the receiver.
    fn send<M: Payload>(&self, msg: M, dest: usize, tag: Tag) -> Result<()>;

    /// Blocks until a message from `source` with `tag` is available.
    fn recv<M: Payload>(&self, source: usize, tag: Tag) -> Result<M>;

    /// Reserves the tag of the next collective call.
    fn next_collective_tag(&self) -> Tag;

    fn isend<M: Payload>(&self, msg: M, dest: usize, tag: Tag) -> Result<Request<()>> {
        self.send(msg, dest, tag)?;
        Ok(Request::Complete(()))
    }

    fn irecv<M: Payload>(&self, source: usize, tag: Tag) -> Request<M> {
        Request::pending(source, tag)
    }

    /// Broadcasts the root's value to every worker.
    ///
    /// Only the root's `msg` is used; other workers may pass `None`.
    fn bcast<M: Payload>(&self, msg: Option<M>, root: usize) -> Result<M> {
        self.ibcast(msg, root)?.wait(self)
    }

    /// Non-blocking broadcast. The root's request is already complete.
    ///
    /// The collective slot is reserved at call time, so several broadcasts may be in flight
    /// and waited on in any order.
    fn ibcast<M: Payload>(&self, msg: Option<M>, root: usize) -> Result<Request<M>> {
        let world_size = self.world_size();
        if root >= world_size {
            return Err(CommError::InvalidRank {
                rank: root,
                world_size,
            });
        }
        let tag = self.next_collective_tag();
        if self.rank() != root {
            return Ok(self.irecv(root, tag));
        }
        let msg = msg.ok_or(CommError::MissingRootPayload { root })?;
        for dest in (0..world_size).filter(|&d| d != root) {
            self.send(msg.clone(), dest, tag)?;
        }
        Ok(Request::Complete(msg))
    }

    /// Gathers one value from every worker, ordered by rank.
    fn all_gather<M: Payload>(&self, msg: M) -> Result<Vec<M>> {
        let tag = self.next_collective_tag();
        let rank = self.rank();
        for dest in (0..self.world_size()).filter(|&d| d != rank) {
            self.send(msg.clone(), dest, tag)?;
        }
        let mut out = Vec::with_capacity(self.world_size());
        for source in 0..self.world_size() {
            if source == rank {
                out.push(msg.clone());
            } else {
                out.push(self.recv(source, tag)?);
            }
        }
        Ok(out)
    }

    fn barrier(&self) -> Result<()> {
        self.all_gather(()).map(|_| ())
    }
}
