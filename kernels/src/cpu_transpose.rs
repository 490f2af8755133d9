use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// CPU Implementation of Transpose.
///
/// Turns a row-major `[M, N]` buffer into a row-major `[N, M]` buffer.
pub fn cpu_transpose<T>(data: &[T], shape: &[usize; 2]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let [m, n] = *shape;
    if data.len() != m * n {
        return Err(KernelError::ShapeMismatch {
            expected: vec![m * n],
            got: vec![data.len()],
        });
    }

    let mut out_data = vec![T::zero(); m * n];
    if m == 0 || n == 0 {
        return Ok(out_data);
    }

    // Each output row is one input column.
    out_data
        .as_mut_slice()
        .par_chunks_mut(m)
        .enumerate()
        .for_each(|(col_idx, out_row)| {
            for (r, out_elem) in out_row.iter_mut().enumerate() {
                *out_elem = data[r * n + col_idx];
            }
        });

    Ok(out_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transpose_simple() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // 2x3

        let result = cpu_transpose(&data, &[2, 3]).unwrap();
        // [1, 4]
        // [2, 5]
        // [3, 6]
        assert_eq!(result, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_transpose_single_row() {
        let data = vec![1.0, 2.0, 3.0];
        let result = cpu_transpose(&data, &[1, 3]).unwrap();
        assert_eq!(result, data);
    }

    #[test]
    fn test_transpose_length_mismatch() {
        let err = cpu_transpose(&[1.0, 2.0, 3.0], &[2, 2]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }
}
