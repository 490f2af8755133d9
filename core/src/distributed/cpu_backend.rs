use super::backend::{CommError, Communicator, Payload, Result, Tag};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::trace;

/// Settings shared by every worker of a channel group.
#[derive(Clone, Debug, Default)]
pub struct CommConfig {
    /// Upper bound on how long a receive may block. `None` waits forever.
    pub recv_timeout: Option<Duration>,
}

impl CommConfig {
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }
}

struct Envelope {
    source: usize,
    tag: Tag,
    payload: Box<dyn Any + Send>,
}

/// An in-process communicator where every worker is a thread.
///
/// Each worker owns one inbox and a sender to every inbox of the group (its own included).
/// Messages that arrive before anybody asks for them are parked in a stash and matched on
/// `(source, tag)` later, so receives may be posted in any order.
pub struct ChannelCommunicator {
    rank: usize,
    world_size: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    stash: Mutex<VecDeque<Envelope>>,
    collective_seq: AtomicU64,
    config: CommConfig,
}

impl ChannelCommunicator {
    /// Creates a fully connected group of `world_size` communicators.
    pub fn group(world_size: usize) -> Vec<Self> {
        Self::group_with_config(world_size, CommConfig::default())
    }

    pub fn group_with_config(world_size: usize, config: CommConfig) -> Vec<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..world_size).map(|_| channel::unbounded()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| Self {
                rank,
                world_size,
                peers: senders.clone(),
                inbox,
                stash: Mutex::new(VecDeque::new()),
                collective_seq: AtomicU64::new(0),
                config: config.clone(),
            })
            .collect()
    }

    /// Runs `f` on one scoped thread per rank and returns the results ordered by rank.
    ///
    /// A panic on any worker is propagated to the caller.
    pub fn spawn_group<F, R>(world_size: usize, f: F) -> Vec<R>
    where
        F: Fn(Self) -> R + Sync,
        R: Send,
    {
        Self::spawn_group_with_config(world_size, CommConfig::default(), f)
    }

    pub fn spawn_group_with_config<F, R>(world_size: usize, config: CommConfig, f: F) -> Vec<R>
    where
        F: Fn(Self) -> R + Sync,
        R: Send,
    {
        let comms = Self::group_with_config(world_size, config);
        let f = &f;
        thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| s.spawn(move || f(comm)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.world_size {
            return Err(CommError::InvalidRank {
                rank,
                world_size: self.world_size,
            });
        }
        Ok(())
    }

    fn take_stashed(&self, source: usize, tag: Tag) -> Option<Envelope> {
        let mut stash = self
            .stash
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let pos = stash
            .iter()
            .position(|e| e.source == source && e.tag == tag)?;
        stash.remove(pos)
    }

    fn stash(&self, envelope: Envelope) {
        self.stash
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(envelope);
    }

    fn next_envelope(&self, source: usize, tag: Tag) -> Result<Envelope> {
        let disconnected = CommError::Disconnected { rank: self.rank };
        match self.config.recv_timeout {
            None => self.inbox.recv().map_err(|_| disconnected),
            Some(timeout) => self.inbox.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => CommError::Timeout {
                    peer: source,
                    tag,
                    timeout,
                },
                RecvTimeoutError::Disconnected => disconnected,
            }),
        }
    }

    fn open<M: Payload>(envelope: Envelope) -> Result<M> {
        let Envelope {
            source,
            tag,
            payload,
        } = envelope;
        payload
            .downcast::<M>()
            .map(|msg| *msg)
            .map_err(|_| CommError::PayloadMismatch { peer: source, tag })
    }
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send<M: Payload>(&self, msg: M, dest: usize, tag: Tag) -> Result<()> {
        self.check_rank(dest)?;
        trace!(rank = self.rank, dest, %tag, "send");
        self.peers[dest]
            .send(Envelope {
                source: self.rank,
                tag,
                payload: Box::new(msg),
            })
            .map_err(|_| CommError::Disconnected { rank: dest })
    }

    fn recv<M: Payload>(&self, source: usize, tag: Tag) -> Result<M> {
        self.check_rank(source)?;
        if let Some(envelope) = self.take_stashed(source, tag) {
            return Self::open(envelope);
        }
        loop {
            let envelope = self.next_envelope(source, tag)?;
            if envelope.source == source && envelope.tag == tag {
                return Self::open(envelope);
            }
            self.stash(envelope);
        }
    }

    fn next_collective_tag(&self) -> Tag {
        Tag::collective(self.collective_seq.fetch_add(1, Ordering::Relaxed))
    }
}
