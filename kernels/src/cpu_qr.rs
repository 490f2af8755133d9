use crate::{KernelError, KernelFloat, Result};
use rayon::prelude::*;

/// CPU Implementation of the complete QR factorization.
///
/// Factors a row-major `[M, N]` buffer as `A = Q * R` with Householder reflections and
/// returns `(Q, R)`, where `Q` is the full `[M, M]` orthogonal factor and `R` is the
/// `[M, N]` upper-trapezoidal factor. Entries of `R` below the diagonal are exact zeros.
///
/// No pivoting is done: rank-deficient input is factorized as-is. Inputs containing
/// `NaN` or infinities are rejected with `KernelError::NonFinite` before any work.
///
/// The result is a deterministic function of the input, so two workers factorizing the
/// same stacked block obtain bit-identical factors.
pub fn cpu_qr<T>(data: &[T], shape: &[usize; 2]) -> Result<(Vec<T>, Vec<T>)>
where
    T: KernelFloat,
{
    let [m, n] = *shape;
    if data.len() != m * n {
        return Err(KernelError::ShapeMismatch {
            expected: vec![m * n],
            got: vec![data.len()],
        });
    }
    if let Some(pos) = data.iter().position(|v| !v.is_finite()) {
        return Err(KernelError::NonFinite {
            row: pos / n.max(1),
            col: pos % n.max(1),
            rows: m,
            cols: n,
        });
    }

    let mut r = data.to_vec();
    let mut q = vec![T::zero(); m * m];
    for i in 0..m {
        q[i * m + i] = T::one();
    }

    let two = T::one() + T::one();
    let steps = n.min(m.saturating_sub(1));
    let mut v = Vec::with_capacity(m);
    let mut dots = vec![T::zero(); n];

    for k in 0..steps {
        // Householder vector for column k, rows k..m.
        v.clear();
        v.extend((k..m).map(|i| r[i * n + k]));

        let norm = v.iter().fold(T::zero(), |acc, &x| acc + x * x).sqrt();
        if norm == T::zero() {
            continue;
        }
        let alpha = if v[0] > T::zero() { -norm } else { norm };
        v[0] -= alpha;
        let v_norm2 = v.iter().fold(T::zero(), |acc, &x| acc + x * x);
        if v_norm2 == T::zero() {
            continue;
        }
        let scale = two / v_norm2;

        // R <- H * R on the trailing columns.
        let width = n - k;
        let proj = &mut dots[..width];
        proj.iter_mut().for_each(|d| *d = T::zero());
        for (offset, &vi) in v.iter().enumerate() {
            let row = &r[(k + offset) * n + k..(k + offset + 1) * n];
            for (d, &x) in proj.iter_mut().zip(row) {
                *d += vi * x;
            }
        }
        r.par_chunks_mut(n)
            .skip(k)
            .zip(v.par_iter())
            .for_each(|(row, &vi)| {
                for (x, &d) in row[k..].iter_mut().zip(proj.iter()) {
                    *x -= scale * vi * d;
                }
            });

        // Q <- Q * H, row by row.
        q.par_chunks_mut(m).for_each(|row| {
            let tail = &mut row[k..];
            let s = tail
                .iter()
                .zip(v.iter())
                .fold(T::zero(), |acc, (&x, &vi)| acc + x * vi);
            for (x, &vi) in tail.iter_mut().zip(v.iter()) {
                *x -= scale * s * vi;
            }
        });

        r[k * n + k] = alpha;
        for i in k + 1..m {
            r[i * n + k] = T::zero();
        }
    }

    Ok((q, r))
}
