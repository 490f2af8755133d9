use crate::{KernelElem, Result};
use rayon::prelude::*;

/// CPU Implementation of Matrix Multiplication.
///
/// Computes `[M, K] x [K, N] -> [M, N]` on row-major buffers. This is the black-box
/// multiply kernel used for every tile update; it is kept separate from the `Tensor`
/// type so that it can be swapped for a BLAS `dgemm` without touching callers.
///
/// # SOTA Integration Guide
///
/// To integrate a SOTA library like `cblas` or `matrixmultiply`:
/// 1. Replace the body of this function with a call to the library's `sgemm` or `dgemm`.
/// 2. Ensure the memory layout matches (Row-Major vs Column-Major).
///    - `tiled-qr` uses Row-Major.
///    - BLAS typically defaults to Column-Major but supports Row-Major via flags.
pub fn cpu_matmul<T>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize; 2],
    rhs_shape: &[usize; 2],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let [m, k] = *lhs_shape;
    let n = rhs_shape[1];

    if k != rhs_shape[0] {
        return Err(crate::KernelError::ShapeMismatch {
            expected: vec![k],
            got: vec![rhs_shape[0]],
        });
    }
    if lhs_data.len() != m * k || rhs_data.len() != k * n {
        return Err(crate::KernelError::ShapeMismatch {
            expected: vec![m * k, k * n],
            got: vec![lhs_data.len(), rhs_data.len()],
        });
    }

    let mut out_data = vec![T::zero(); m * n];
    if m == 0 || n == 0 || k == 0 {
        return Ok(out_data);
    }

    // Transpose rhs so that both operands are walked sequentially.
    let rhs_t_data = super::cpu_transpose::cpu_transpose(rhs_data, rhs_shape)?;

    out_data
        .as_mut_slice()
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(row, out_row)| {
            let a_slice = &lhs_data[row * k..(row + 1) * k];

            for (col, out_elem) in out_row.iter_mut().enumerate() {
                let b_t_slice = &rhs_t_data[col * k..(col + 1) * k];

                let mut sum = T::zero();
                for (&val_a, &val_b) in a_slice.iter().zip(b_t_slice.iter()) {
                    sum += val_a * val_b;
                }
                *out_elem = sum;
            }
        });

    Ok(out_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelError;

    #[test]
    fn test_matmul_simple() {
        let a = vec![1.0, 2.0, 3.0, 4.0]; // 2x2
        let b = vec![5.0, 6.0, 7.0, 8.0]; // 2x2

        let result = cpu_matmul(&a, &b, &[2, 2], &[2, 2]).unwrap();
        // [1*5+2*7, 1*6+2*8] = [19, 22]
        // [3*5+4*7, 3*6+4*8] = [43, 50]
        assert_eq!(result, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_rectangular() {
        // [2, 3] x [3, 1]
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = vec![1.0, 0.0, -1.0];

        let result = cpu_matmul(&a, &b, &[2, 3], &[3, 1]).unwrap();
        assert_eq!(result, vec![-2.0, -2.0]);
    }

    #[test]
    fn test_matmul_empty_inner_dim() {
        let result = cpu_matmul::<f64>(&[], &[], &[2, 0], &[0, 3]).unwrap();
        assert_eq!(result, vec![0.0; 6]);
    }

    #[test]
    fn test_matmul_shape_mismatch() {
        let a = vec![1.0; 4]; // 2x2
        let b = vec![1.0; 6]; // 3x2

        let err = cpu_matmul(&a, &b, &[2, 2], &[3, 2]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }
}
