//! # Tiled QR Factorization
//!
//! Computes `A = Q * R` for a matrix that no single worker holds in full.
//!
//! ## 🧩 Two Layouts, Two Algorithms
//!
//! ### Row-distributed input
//! Every worker owns a band of rows. For each diagonal tile column the workers at or below
//! the diagonal owner factorize their slice of the column locally ([`panel`]) and then
//! collapse the resulting triangles pairwise in a binary tree ([`tree`]), so that the final
//! triangle lands on the diagonal owner after `O(log P)` exchanges.
//!
//! The orthogonal factors produced along the way are recorded ([`records`]) and replayed in
//! a second pass, column by column, to build `Q` ([`merge_index`], [`replay`]).
//!
//! ### Column-distributed input
//! The diagonal tile of a column always lives on one worker. That worker eliminates the
//! tiles below the diagonal one at a time and broadcasts each orthogonal factor, which the
//! others apply to their trailing columns and to their rows of `Q` ([`elimination`]).
//!
//! ## 🚀 Usage
//!
//! ```rust
//! use tiled_qr::dndarray::{DistributedMatrix, Split};
//! use tiled_qr::distributed::ChannelCommunicator;
//! use tiled_qr::linalg::{QrOptions, qr};
//! use tiled_qr::tensor::Tensor;
//!
//! let data: Vec<f64> = (0..12).map(|i| ((i * 7) % 5) as f64 + 1.0).collect();
//! let global = Tensor::new(data, [4, 3]).unwrap();
//!
//! let shapes = ChannelCommunicator::spawn_group(2, |comm| {
//!     let mut a = DistributedMatrix::from_global(&global, Split::Rows, &comm).unwrap();
//!     let result = qr(&mut a, &comm, &QrOptions::default()).unwrap();
//!     (result.q.map(|q| q.gshape()), result.r.gshape())
//! });
//! assert_eq!(shapes[0], (Some([4, 3]), [3, 3]));
//! ```
//!
//! > [!NOTE]
//! > Every worker must call [`qr`] with the same options. The algorithms rely on all workers
//! > issuing the same sequence of collective operations.

mod elimination;
mod merge_index;
mod panel;
mod records;
mod replay;
mod tree;

use crate::dndarray::{ArrayError, DistributedMatrix, Split, balanced_counts};
use crate::distributed::{CommError, Communicator, Tag};
use crate::tensor::{FloatElem, TensorError};
use crate::tiling::TileGrid;
use thiserror::Error;
use tracing::debug;

/// Error type for the factorization.
#[derive(Error, Debug)]
pub enum QrError {
    /// Rejected before any communication took place.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// Workers disagreed about the shape of a broadcast factor.
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error(transparent)]
    Array(#[from] ArrayError),
}

pub type Result<T> = std::result::Result<T, QrError>;

/// Shape of the returned factors for an `m x n` input with `k = min(m, n)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QrMode {
    /// `Q` is `m x k`, `R` is `k x n`.
    #[default]
    Reduced,
    /// `Q` is `m x m`, `R` is `m x n`.
    Complete,
}

/// Options of a factorization call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QrOptions {
    /// Tiles each worker cuts its share into. Row-distributed shares may be cut finer.
    pub tiles_per_proc: usize,
    /// Whether `Q` is computed at all.
    pub calc_q: bool,
    /// Whether `R` may be written into the input's storage.
    pub overwrite_a: bool,
    pub mode: QrMode,
}

impl Default for QrOptions {
    fn default() -> Self {
        Self {
            tiles_per_proc: 1,
            calc_q: true,
            overwrite_a: false,
            mode: QrMode::Reduced,
        }
    }
}

impl QrOptions {
    pub fn with_tiles_per_proc(mut self, tiles_per_proc: usize) -> Self {
        self.tiles_per_proc = tiles_per_proc;
        self
    }

    pub fn with_calc_q(mut self, calc_q: bool) -> Self {
        self.calc_q = calc_q;
        self
    }

    pub fn with_overwrite_a(mut self, overwrite_a: bool) -> Self {
        self.overwrite_a = overwrite_a;
        self
    }

    pub fn with_mode(mut self, mode: QrMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Result of a factorization. `q` is `None` when it was not requested.
#[derive(Clone, Debug)]
pub struct Qr<T>
where
    T: FloatElem,
{
    pub q: Option<DistributedMatrix<T>>,
    pub r: DistributedMatrix<T>,
}

/// Purpose of a point-to-point message, packed into its tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TagKind {
    Block = 1,
    Trailing = 2,
    Factor = 3,
    Shape = 4,
}

const COLUMN_BITS: u32 = 20;
const LEVEL_BITS: u32 = 7;
const RANK_BITS: u32 = 16;

/// Packs `kind | column | level | upper | lower` into a tag.
///
/// Distinct columns and rank pairs never share a tag, so exchanges of neighbouring columns
/// can be in flight at the same time.
pub(crate) fn tag(kind: TagKind, column: usize, level: usize, upper: usize, lower: usize) -> Tag {
    let mut value = kind as u64;
    value = (value << COLUMN_BITS) | column as u64;
    value = (value << LEVEL_BITS) | level as u64;
    value = (value << RANK_BITS) | upper as u64;
    value = (value << RANK_BITS) | lower as u64;
    Tag::new(value)
}

/// Factorizes the distributed matrix `a` into `Q * R`.
///
/// Collective: every worker of `comm` must call this with the same options.
///
/// The returned factors are distributed like `a` (`R` keeps `a`'s split, `Q` is distributed
/// by rows) and balanced. With `overwrite_a` the full `m x n` `R` is also left in `a`;
/// otherwise `a` is not modified.
///
/// # Errors
///
/// * `QrError::InvalidInput` for empty matrices, `tiles_per_proc == 0`, shares that do not
///   match the communicator, or grids too large to be tagged. Raised before any message is
///   sent.
/// * `TensorError::NonFinite` (wrapped) if the matrix holds NaN or infinite values.
/// * `QrError::Comm` if a message could not be delivered or timed out.
pub fn qr<T, C>(a: &mut DistributedMatrix<T>, comm: &C, options: &QrOptions) -> Result<Qr<T>>
where
    T: FloatElem,
    C: Communicator,
{
    validate(a, comm, options)?;
    let [m, n] = a.gshape();
    debug!(
        rank = comm.rank(),
        m,
        n,
        split = ?a.split(),
        calc_q = options.calc_q,
        "qr start"
    );

    let mut scratch;
    let work = if options.overwrite_a {
        a
    } else {
        scratch = a.clone();
        &mut scratch
    };

    let mut q = match work.split() {
        Split::Replicated => replicated(work, comm, options.calc_q)?,
        Split::Rows => {
            work.balance(comm)?;
            let grid = TileGrid::square_diag(work, options.tiles_per_proc)?;
            let records = tree::r_phase(work, &grid, comm, options.calc_q)?;
            if options.calc_q {
                let q_grid = grid.match_tiles(comm.world_size());
                let mut q = DistributedMatrix::eye_with_counts(m, Split::Rows, &q_grid.shares(), comm)?;
                replay::q_phase(&mut q, &grid, records, comm)?;
                Some(q)
            } else {
                None
            }
        }
        Split::Cols => {
            work.balance(comm)?;
            let grid = TileGrid::square_diag(work, options.tiles_per_proc)?;
            let mut q = if options.calc_q {
                let q_grid = grid.match_tiles(comm.world_size());
                Some(DistributedMatrix::eye_with_counts(m, Split::Rows, &q_grid.shares(), comm)?)
            } else {
                None
            };
            elimination::eliminate(work, &grid, q.as_mut(), comm)?;
            q
        }
    };

    let mut r = work.clone();
    if options.mode == QrMode::Reduced {
        let k = m.min(n);
        r.truncate_rows(k)?;
        if let Some(q) = q.as_mut() {
            q.truncate_cols(k)?;
        }
    }
    r.balance(comm)?;
    if let Some(q) = q.as_mut() {
        q.balance(comm)?;
    }
    debug!(rank = comm.rank(), "qr done");
    Ok(Qr { q, r })
}

/// Every worker holds the whole matrix: factorize locally without communicating.
fn replicated<T, C>(
    work: &mut DistributedMatrix<T>,
    comm: &C,
    calc_q: bool,
) -> Result<Option<DistributedMatrix<T>>>
where
    T: FloatElem,
    C: Communicator,
{
    let (q, r) = work.local().qr()?;
    *work.local_mut() = r;
    if !calc_q {
        return Ok(None);
    }
    Ok(Some(DistributedMatrix::from_local(q, Split::Replicated, comm)?))
}

fn validate<T, C>(a: &DistributedMatrix<T>, comm: &C, options: &QrOptions) -> Result<()>
where
    T: FloatElem,
    C: Communicator,
{
    let [m, n] = a.gshape();
    if m == 0 || n == 0 {
        return Err(QrError::InvalidInput(format!(
            "cannot factorize an empty {}x{} matrix",
            m, n
        )));
    }
    if options.tiles_per_proc == 0 {
        return Err(QrError::InvalidInput(
            "tiles_per_proc must be at least 1".to_string(),
        ));
    }
    if comm.world_size() >= 1 << RANK_BITS {
        return Err(QrError::InvalidInput(format!(
            "world size {} exceeds {} workers",
            comm.world_size(),
            1usize << RANK_BITS
        )));
    }
    let Some(axis) = a.split().axis() else {
        return Ok(());
    };
    if a.counts().len() != comm.world_size() {
        return Err(QrError::InvalidInput(format!(
            "matrix is distributed over {} workers, communicator has {}",
            a.counts().len(),
            comm.world_size()
        )));
    }
    // The grid the factorization will use once the shares are balanced.
    let balanced = balanced_counts(a.gshape()[axis], comm.world_size());
    let grid = TileGrid::from_shares(a.gshape(), a.split(), &balanced, options.tiles_per_proc)?;
    validate_grid(&grid, comm)
}

fn validate_grid<C: Communicator>(grid: &TileGrid, comm: &C) -> Result<()> {
    if grid.tile_rows().max(grid.tile_columns()) >= 1 << COLUMN_BITS {
        return Err(QrError::InvalidInput(format!(
            "{}x{} tiles exceed the tag space",
            grid.tile_rows(),
            grid.tile_columns()
        )));
    }
    debug!(
        rank = comm.rank(),
        tile_rows = grid.tile_rows(),
        tile_columns = grid.tile_columns(),
        "tile grid"
    );
    Ok(())
}
