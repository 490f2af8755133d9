//! Matrix operations.
//!
//! # Overview
//!
//! This module implements the local linear algebra every worker runs on its own blocks:
//! - **Element-wise Arithmetic**: `+`, `-` on equally shaped blocks.
//! - **Matrix Multiplication**: `[M, K] x [K, N] -> [M, N]`, delegated to the kernels crate.
//! - **Block Surgery**: Cutting sub-blocks out of a share, writing them back, stacking tiles.
//! - **Dense QR**: Complete Householder factorization of a single block.
//!
//! # Parallelism
//!
//! > [!TIP]
//! > **Efficiency Note**: Element-wise work and the kernels are parallelized using `rayon`.
//! > Tiles handed to the QR kernel are usually small, so the per-tile cost is dominated by
//! > the reflector loop rather than by thread synchronization.
//!
//! # Examples
//!
//! ```rust
//! use tiled_qr::tensor::Tensor;
//!
//! let a = Tensor::<f64, 2>::new(vec![1.0, 2.0, 3.0, 4.0], [2, 2]).unwrap();
//! let b = Tensor::<f64, 2>::eye(2);
//!
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[2.0, 2.0, 3.0, 5.0]);
//!
//! let top = a.slice(0..1, 0..2).unwrap();
//! assert_eq!(top.data(), &[1.0, 2.0]);
//! ```

use super::{FloatElem, Result, Tensor, TensorElem, TensorError};

use rayon::prelude::*;
use std::ops::{Add, Range, Sub};

/// Implements a binary arithmetic operation trait (e.g., `Add`, `Sub`) for `&Tensor`.
///
/// The macro checks shape compatibility, allocates the output and performs the
/// element-wise operation in parallel using `rayon`.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK>
        where
            T: TensorElem,
        {
            type Output = crate::tensor::Result<Tensor<T, RANK>>;

            fn $method(self, rhs: Self) -> Self::Output {
                if self.shape != rhs.shape {
                    return Err(TensorError::ShapeMismatch {
                        expected: self.shape.to_vec(),
                        got: rhs.shape.to_vec(),
                    });
                }

                let mut out = Tensor::zeros(self.shape);
                out.data
                    .as_mut_slice()
                    .par_iter_mut()
                    .zip(self.data.as_slice().par_iter())
                    .zip(rhs.data.as_slice().par_iter())
                    .for_each(|((o, a), b)| {
                        *o = a.$method(*b);
                    });

                Ok(out)
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Applies a function element-wise to the tensor.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tiled_qr::tensor::Tensor;
    /// let t = Tensor::<f64, 1>::new(vec![1.0, -2.0, 3.0], [3]).unwrap();
    /// let flipped = t.map(|x| -x);
    /// assert_eq!(flipped.data(), &[-1.0, 2.0, -3.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = Tensor::zeros(self.shape);
        out.data
            .as_mut_slice()
            .par_iter_mut()
            .zip(self.data.as_slice().par_iter())
            .for_each(|(o, i)| *o = f(*i));
        out
    }
}

impl<T> Tensor<T, 2>
where
    T: TensorElem,
{
    /// Matrix Multiplication: `[M, K] x [K, N] -> [M, N]`.
    ///
    /// Empty operands are allowed; a zero inner dimension yields an all-zero result.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        // Delegate to the kernel
        let out_data = tiled_qr_kernels::cpu_matmul(
            self.data.as_slice(),
            rhs.data.as_slice(),
            &self.shape,
            &rhs.shape,
        )?;
        Tensor::new(out_data, [self.shape[0], rhs.shape[1]])
    }

    /// Transposes the matrix.
    pub fn transpose(&self) -> Result<Self> {
        let out_data = tiled_qr_kernels::cpu_transpose(self.data.as_slice(), &self.shape)?;
        Tensor::new(out_data, [self.shape[1], self.shape[0]])
    }

    /// Copies the sub-block `rows x cols` into a new matrix.
    ///
    /// Empty ranges are valid and produce empty blocks.
    pub fn slice(&self, rows: Range<usize>, cols: Range<usize>) -> Result<Self> {
        self.check_block(rows.start, cols.start, rows.len(), cols.len())?;
        let width = cols.len();
        let mut out = Vec::with_capacity(rows.len() * width);
        for row in self.data.chunks(self.shape[1].max(1)).take(rows.end).skip(rows.start) {
            out.extend_from_slice(&row[cols.clone()]);
        }
        Tensor::new(out, [rows.len(), width])
    }

    /// Overwrites the block starting at `(row, col)` with `block`.
    pub fn assign(&mut self, row: usize, col: usize, block: &Self) -> Result<()> {
        let [h, w] = block.shape;
        self.check_block(row, col, h, w)?;
        if w == 0 {
            return Ok(());
        }
        let n = self.shape[1];
        for (dst, src) in self
            .data
            .chunks_mut(n)
            .skip(row)
            .take(h)
            .zip(block.data.chunks(w))
        {
            dst[col..col + w].copy_from_slice(src);
        }
        Ok(())
    }

    /// Stacks `self` on top of `lower`. Both must have the same number of columns.
    pub fn vstack(&self, lower: &Self) -> Result<Self> {
        if self.shape[1] != lower.shape[1] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![lower.shape[0], self.shape[1]],
                got: lower.shape.to_vec(),
            });
        }
        let mut data = Vec::with_capacity(self.data.len() + lower.data.len());
        data.extend_from_slice(&self.data);
        data.extend_from_slice(&lower.data);
        Tensor::new(data, [self.shape[0] + lower.shape[0], self.shape[1]])
    }

    /// Returns a copy widened to `cols` columns with zeros on the right.
    pub fn pad_cols(&self, cols: usize) -> Result<Self> {
        let [m, n] = self.shape;
        if cols < n {
            return Err(TensorError::Unsupported(format!(
                "cannot pad {} columns down to {}",
                n, cols
            )));
        }
        let mut out = Tensor::zeros([m, cols]);
        out.assign(0, 0, self)?;
        Ok(out)
    }

    /// Keeps only the first `rows` rows.
    pub fn truncate_rows(&mut self, rows: usize) {
        if rows < self.shape[0] {
            self.data.truncate(rows * self.shape[1]);
            self.shape[0] = rows;
            self.strides = super::compute_strides(&self.shape);
        }
    }

    fn check_block(&self, row: usize, col: usize, h: usize, w: usize) -> Result<()> {
        if row + h > self.shape[0] || col + w > self.shape[1] {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![row + h, col + w],
                shape: self.shape.to_vec(),
            });
        }
        Ok(())
    }
}

impl<T> Tensor<T, 2>
where
    T: FloatElem,
{
    /// Complete QR factorization `self = Q * R`.
    ///
    /// For an `[M, N]` block this returns the `[M, M]` orthogonal `Q` and the `[M, N]`
    /// upper-trapezoidal `R`. The signs of `R`'s diagonal are whatever the Householder
    /// reflectors produce; callers must not rely on them.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::NonFinite` if the block holds NaN or infinite values.
    pub fn qr(&self) -> Result<(Self, Self)> {
        let [m, n] = self.shape;
        let (q, r) = tiled_qr_kernels::cpu_qr(self.data.as_slice(), &self.shape)?;
        Ok((Tensor::new(q, [m, m])?, Tensor::new(r, [m, n])?))
    }

    /// Largest absolute value, zero for an empty block.
    pub fn max_abs(&self) -> T {
        self.data
            .iter()
            .fold(T::zero(), |acc, &x| acc.max(x.abs()))
    }

    /// Returns `true` if every element is finite.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }
}
