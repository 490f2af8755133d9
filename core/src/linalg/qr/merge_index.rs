//! Sparse accumulator for the merge factors of one tile column.
//!
//! The merges of a column act on a handful of `w x w` row blocks ("slots"), one per
//! participating worker. Their product `G = E_1 * E_2 * ...` is block sparse: entry
//! `(x, y)` is non-zero only if slot `x` ever fed into slot `y`. A missing diagonal entry
//! stands for the identity, a missing off-diagonal entry for zero.

use super::Result;
use crate::tensor::{FloatElem, Tensor};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Default)]
pub(crate) struct MergeIndex<T: FloatElem> {
    blocks: BTreeMap<(usize, usize), Tensor<T, 2>>,
}

impl<T: FloatElem> MergeIndex<T> {
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
        }
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&Tensor<T, 2>> {
        self.blocks.get(&(row, col))
    }

    pub fn keys(&self) -> Vec<(usize, usize)> {
        self.blocks.keys().copied().collect()
    }

    pub fn into_blocks(self) -> impl Iterator<Item = ((usize, usize), Tensor<T, 2>)> {
        self.blocks.into_iter()
    }

    /// Right-multiplies the accumulated product by the merge of slots `upper` and `lower`.
    ///
    /// `factor` is `(hu + hl) x (hu + hl)`, where `hu` and `hl` are the heights of the upper
    /// and lower blocks. Only the columns `upper` and `lower` of the product change:
    ///
    /// ```text
    /// G'(x, u) = G(x, u) * TL + G(x, l) * BL
    /// G'(x, l) = G(x, u) * TR + G(x, l) * BR
    /// ```
    pub fn compose(
        &mut self,
        upper: usize,
        lower: usize,
        factor: &Tensor<T, 2>,
        upper_rows: usize,
        lower_rows: usize,
    ) -> Result<()> {
        let size = upper_rows + lower_rows;
        let tl = factor.slice(0..upper_rows, 0..upper_rows)?;
        let tr = factor.slice(0..upper_rows, upper_rows..size)?;
        let bl = factor.slice(upper_rows..size, 0..upper_rows)?;
        let br = factor.slice(upper_rows..size, upper_rows..size)?;

        let mut rows: BTreeSet<usize> = self
            .blocks
            .keys()
            .filter(|&&(_, col)| col == upper || col == lower)
            .map(|&(row, _)| row)
            .collect();
        rows.insert(upper);
        rows.insert(lower);

        for row in rows {
            let g_upper = self.entry(row, upper, upper_rows);
            let g_lower = self.entry(row, lower, lower_rows);
            let new_upper = combine(g_upper.as_ref(), &tl, g_lower.as_ref(), &bl)?;
            let new_lower = combine(g_upper.as_ref(), &tr, g_lower.as_ref(), &br)?;
            if let Some(block) = new_upper {
                self.blocks.insert((row, upper), block);
            }
            if let Some(block) = new_lower {
                self.blocks.insert((row, lower), block);
            }
        }
        Ok(())
    }

    /// Stored block, or the implicit identity on the diagonal.
    fn entry(&self, row: usize, col: usize, size: usize) -> Option<Tensor<T, 2>> {
        match self.get(row, col) {
            Some(block) => Some(block.clone()),
            None if row == col => Some(Tensor::eye(size)),
            None => None,
        }
    }
}

/// `a * x + b * y`, skipping absent terms.
fn combine<T: FloatElem>(
    a: Option<&Tensor<T, 2>>,
    x: &Tensor<T, 2>,
    b: Option<&Tensor<T, 2>>,
    y: &Tensor<T, 2>,
) -> Result<Option<Tensor<T, 2>>> {
    let first = a.map(|a| a.matmul(x)).transpose()?;
    let second = b.map(|b| b.matmul(y)).transpose()?;
    Ok(match (first, second) {
        (Some(f), Some(s)) => Some((&f + &s)?),
        (f, s) => f.or(s),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Embeds the slot blocks of `index` into a dense `(slots * w)` matrix.
    fn dense(index: &MergeIndex<f64>, slots: usize, w: usize) -> Tensor<f64, 2> {
        let mut out = Tensor::eye(slots * w);
        for s in 0..slots {
            out.assign(s * w, s * w, &Tensor::zeros([w, w])).unwrap();
        }
        for x in 0..slots {
            for y in 0..slots {
                match index.get(x, y) {
                    Some(block) => out.assign(x * w, y * w, block).unwrap(),
                    None if x == y => out.assign(x * w, y * w, &Tensor::eye(w)).unwrap(),
                    None => {}
                }
            }
        }
        out
    }

    /// The merge of slots `u` and `l` as a dense `(slots * w)` matrix.
    fn embed(factor: &Tensor<f64, 2>, u: usize, l: usize, slots: usize, w: usize) -> Tensor<f64, 2> {
        let mut out = Tensor::eye(slots * w);
        for (i, si) in [u, l].into_iter().enumerate() {
            for (j, sj) in [u, l].into_iter().enumerate() {
                let block = factor.slice(i * w..(i + 1) * w, j * w..(j + 1) * w).unwrap();
                out.assign(si * w, sj * w, &block).unwrap();
            }
        }
        out
    }

    fn factor(seed: f64) -> Tensor<f64, 2> {
        let data: Vec<f64> = (0..16).map(|i| ((i as f64 + seed) * 1.7).sin()).collect();
        Tensor::new(data, [4, 4]).unwrap().qr().unwrap().0
    }

    #[test]
    fn test_single_merge_is_the_factor() {
        let f = factor(0.3);
        let mut index = MergeIndex::new();
        index.compose(0, 1, &f, 2, 2).unwrap();
        assert_eq!(index.keys(), vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        let diff = (&dense(&index, 2, 2) - &f).unwrap();
        assert!(diff.max_abs() < 1e-14);
    }

    #[test]
    fn test_composition_matches_dense_product() {
        // Merges of a four-slot tree: (0, 2), (1, 3), then (0, 1).
        let merges = [(0, 2, factor(0.1)), (1, 3, factor(1.2)), (0, 1, factor(2.7))];
        let mut index = MergeIndex::new();
        let mut expected = Tensor::eye(8);
        for (u, l, f) in &merges {
            index.compose(*u, *l, f, 2, 2).unwrap();
            expected = expected.matmul(&embed(f, *u, *l, 4, 2)).unwrap();
        }
        let diff = (&dense(&index, 4, 2) - &expected).unwrap();
        assert!(diff.max_abs() < 1e-12);
        assert!(index.get(2, 0).is_some());
        assert!(index.get(0, 2).is_some());
    }

    #[test]
    fn test_untouched_slots_stay_implicit() {
        let mut index = MergeIndex::new();
        assert!(index.keys().is_empty());
        index.compose(3, 5, &factor(0.9), 2, 2).unwrap();
        assert!(index.get(0, 0).is_none());
        assert!(index.get(3, 0).is_none());
        assert_eq!(index.keys().len(), 4);
    }
}
