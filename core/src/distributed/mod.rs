//! # Distributed Communication
//!
//! Every factorization in this crate runs as a *group* of workers. Each worker owns a share
//! of the matrix and talks to the others through a [`Communicator`](backend::Communicator).
//!
//! ## 🎓 The "Why" of a Communication Layer
//!
//! A tall matrix split by rows cannot be factorized by any single worker: the top tile of a
//! column lives on one worker, the rows below it on others. The algorithm therefore needs two
//! kinds of messages:
//!
//! 1.  **Point-to-point** exchanges between a fixed pair of workers (merging two triangular
//!     blocks in the reduction tree, handing a partial orthogonal factor to the diagonal owner).
//! 2.  **Collectives** that every worker joins in the same order (broadcasting a tile's
//!     orthogonal factor so that everybody can update their trailing columns).
//!
//! ## 🧩 Matching Messages
//!
//! Point-to-point messages are matched on `(source, tag)`. Messages from the same source with
//! the same tag arrive in send order; everything else may be consumed out of order, which is
//! what lets a worker post a receive early and wait on it much later.
//!
//! Collectives draw their tags from a per-worker sequence counter. Because every worker issues
//! the same collectives in the same order, the counters agree without any extra handshake.
//!
//! ## 📦 Module Contents
//!
//! *   [`Communicator`](backend::Communicator): the interface the algorithms are written against.
//! *   [`ChannelCommunicator`](cpu_backend::ChannelCommunicator): an in-process implementation
//!     where every worker is a thread and every link is a `crossbeam` channel.
//!
//! ## 🚀 Quick Start
//!
//! ```rust
//! use tiled_qr::distributed::{ChannelCommunicator, Communicator};
//!
//! let sums = ChannelCommunicator::spawn_group(3, |comm| {
//!     let all = comm.all_gather(comm.rank()).unwrap();
//!     all.iter().sum::<usize>()
//! });
//! assert_eq!(sums, vec![3, 3, 3]);
//! ```

pub mod backend;
pub mod cpu_backend;

pub use backend::{CommError, Communicator, Payload, Request, Tag};
pub use cpu_backend::{ChannelCommunicator, CommConfig};
