//! # tiled-qr
//!
//! `tiled-qr` computes the QR factorization of dense matrices that are distributed across a
//! group of workers, without ever assembling the matrix, `Q` or `R` on a single worker.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: Dense local matrices and the single-worker kernels.
//! - [`distributed`]: The communication layer (point-to-point, broadcasts, wait handles).
//! - [`dndarray`]: Matrices distributed by rows or columns.
//! - [`tiling`]: Diagonal-aligned tile grids over distributed matrices.
//! - [`linalg`]: The tiled QR factorization itself.
//!
//! ## Example
//!
//! ```rust
//! use tiled_qr::{ChannelCommunicator, DistributedMatrix, QrOptions, Split, tensor};
//!
//! let global = tensor!([2.0, 1.0, 1.0, 3.0, 0.0, 1.0, 4.0, 2.0], [4, 2]);
//!
//! let residuals = ChannelCommunicator::spawn_group(2, |comm| {
//!     let mut a = DistributedMatrix::from_global(&global, Split::Rows, &comm).unwrap();
//!     let result = tiled_qr::qr(&mut a, &comm, &QrOptions::default()).unwrap();
//!     let q = result.q.unwrap().gather(&comm).unwrap();
//!     let r = result.r.gather(&comm).unwrap();
//!     (&q.matmul(&r).unwrap() - &global).unwrap().max_abs()
//! });
//! assert!(residuals.iter().all(|&e| e < 1e-12));
//! ```

/// Macro for creating a Tensor with compile-time shape checking.
///
/// # Examples
///
/// ```rust
/// use tiled_qr::tensor;
/// use tiled_qr::tensor::Tensor;
///
/// // Works
/// let t: Tensor<f64, 2> = tensor!([1.0, 2.0, 3.0, 4.0], [2, 2]);
///
/// // Fails to compile:
/// // let t = tensor!([1.0, 2.0, 3.0], [2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($data:expr, $shape:expr) => {{
        // Constants to force compile-time evaluation
        const DATA_LEN: usize = (&$data as &[_]).len();
        const SHAPE: [usize; (&$shape as &[_]).len()] = $shape;
        const EXPECTED_SIZE: usize = {
            let mut size = 1;
            let mut i = 0;
            while i < (&SHAPE as &[_]).len() {
                size *= SHAPE[i];
                i += 1;
            }
            size
        };

        // This assertion triggers a compile-time error if false
        const _: () = assert!(
            DATA_LEN == EXPECTED_SIZE,
            "Shape mismatch: data length does not match shape product"
        );

        // Safe to unwrap because we checked at compile time
        $crate::tensor::Tensor::new($data.to_vec(), $shape).unwrap()
    }};
}

pub mod dndarray;
pub mod distributed;
pub mod linalg;
pub mod tensor;
pub mod tiling;

pub use distributed::{ChannelCommunicator, CommConfig, CommError, Communicator};
pub use dndarray::{ArrayError, DistributedMatrix, Split};
pub use linalg::{Qr, QrError, QrMode, QrOptions, qr};
pub use tensor::{FloatElem, Tensor, TensorElem, TensorError};
pub use tiling::TileGrid;
