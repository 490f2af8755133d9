//! Tile grids.
//!
//! A [`TileGrid`] cuts a distributed matrix into rectangular tiles such that tile `(i, i)`
//! always starts on the matrix diagonal. Tiles never straddle two workers: along the split
//! axis every worker's share is cut into whole tiles, and the boundaries along the other
//! axis are copied from the split axis.
//!
//! ```text
//!          col 0   col 1   col 2
//!        +-------+-------+-------+
//! row 0  | (0,0) |       |       |  <- rank 0
//!        +-------+-------+-------+
//! row 1  |       | (1,1) |       |  <- rank 0
//!        +-------+-------+-------+
//! row 2  |       |       | (2,2) |  <- rank 1
//!        +-------+-------+-------+
//! row 3  |       |       |       |  <- rank 1
//!        +-------+-------+-------+
//! ```

use crate::dndarray::{ArrayError, DistributedMatrix, Result, Split, balanced_counts};
use crate::tensor::{Tensor, TensorElem};
use std::ops::Range;

/// Tile boundaries and ownership of one distributed matrix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileGrid {
    gshape: [usize; 2],
    split: Split,
    row_bounds: Vec<usize>,
    col_bounds: Vec<usize>,
    /// Tiles per worker along the split axis.
    tiles: Vec<usize>,
    /// First tile index of every worker along the split axis, plus the total.
    tile_starts: Vec<usize>,
}

impl TileGrid {
    /// Builds the diagonal-aligned grid for `matrix`.
    ///
    /// Every non-empty share is cut into `tiles_per_proc` nearly equal tiles (fewer if the
    /// share is smaller). For row-distributed matrices the tiles are refined further so that
    /// none is taller than the smallest non-empty share.
    pub fn square_diag<T: TensorElem>(
        matrix: &DistributedMatrix<T>,
        tiles_per_proc: usize,
    ) -> Result<Self> {
        Self::from_shares(matrix.gshape(), matrix.split(), matrix.counts(), tiles_per_proc)
    }

    pub fn from_shares(
        gshape: [usize; 2],
        split: Split,
        counts: &[usize],
        tiles_per_proc: usize,
    ) -> Result<Self> {
        let Some(axis) = split.axis() else {
            return Err(ArrayError::Layout(
                "replicated matrices have no tile grid".to_string(),
            ));
        };
        if counts.iter().sum::<usize>() != gshape[axis] {
            return Err(ArrayError::Layout(format!(
                "shares {:?} do not cover {} entries",
                counts, gshape[axis]
            )));
        }
        let tiles_per_proc = tiles_per_proc.max(1);
        let min_share = counts.iter().copied().filter(|&c| c > 0).min().unwrap_or(1);

        let tiles: Vec<usize> = counts
            .iter()
            .map(|&c| match c {
                0 => 0,
                c if axis == 0 => tiles_per_proc.min(c).max(c.div_ceil(min_share)),
                c => tiles_per_proc.min(c),
            })
            .collect();

        let mut split_bounds = vec![0];
        for (&count, &t) in counts.iter().zip(&tiles) {
            let base = split_bounds.last().copied().unwrap_or(0);
            let mut acc = base;
            for height in balanced_counts(count, t) {
                acc += height;
                split_bounds.push(acc);
            }
        }
        let other_bounds = derive_bounds(&split_bounds, gshape[1 - axis]);

        let (row_bounds, col_bounds) = if axis == 0 {
            (split_bounds, other_bounds)
        } else {
            (other_bounds, split_bounds)
        };
        Ok(Self {
            gshape,
            split,
            row_bounds,
            col_bounds,
            tile_starts: prefix(&tiles),
            tiles,
        })
    }

    /// Grid for the orthogonal factor of a matrix tiled by `self`.
    ///
    /// The result is `m x m`, distributed by rows, and shares its row boundaries with `self`;
    /// both column and row boundaries are the row boundaries of `self`. For row-distributed
    /// input the tile ownership is copied; for column-distributed input whole tile rows are
    /// handed out with balanced chunking.
    pub fn match_tiles(&self, world_size: usize) -> Self {
        let m = self.gshape[0];
        let tiles = match self.split {
            Split::Rows => self.tiles.clone(),
            _ => balanced_counts(self.tile_rows(), world_size),
        };
        Self {
            gshape: [m, m],
            split: Split::Rows,
            row_bounds: self.row_bounds.clone(),
            col_bounds: self.row_bounds.clone(),
            tile_starts: prefix(&tiles),
            tiles,
        }
    }

    pub const fn gshape(&self) -> [usize; 2] {
        self.gshape
    }

    pub const fn split(&self) -> Split {
        self.split
    }

    pub fn tile_rows(&self) -> usize {
        self.row_bounds.len() - 1
    }

    pub fn tile_columns(&self) -> usize {
        self.col_bounds.len() - 1
    }

    pub fn row_bounds(&self) -> &[usize] {
        &self.row_bounds
    }

    pub fn col_bounds(&self) -> &[usize] {
        &self.col_bounds
    }

    /// Number of tiles on the diagonal.
    pub fn diagonal_columns(&self) -> usize {
        self.tile_rows().min(self.tile_columns())
    }

    /// `(row_start, row_end, col_start, col_end)` of a tile in global indices.
    pub fn tile_extent(&self, tile_row: usize, tile_col: usize) -> (usize, usize, usize, usize) {
        (
            self.row_bounds[tile_row],
            self.row_bounds[tile_row + 1],
            self.col_bounds[tile_col],
            self.col_bounds[tile_col + 1],
        )
    }

    /// Worker holding the tile.
    pub fn owning_process(&self, tile_row: usize, tile_col: usize) -> usize {
        let index = if self.split == Split::Rows {
            tile_row
        } else {
            tile_col
        };
        self.tile_starts
            .partition_point(|&start| start <= index)
            .saturating_sub(1)
    }

    pub fn tile_rows_per_process(&self) -> Vec<usize> {
        match self.split {
            Split::Rows => self.tiles.clone(),
            _ => self.spanning(self.tile_rows()),
        }
    }

    pub fn tile_columns_per_process(&self) -> Vec<usize> {
        match self.split {
            Split::Cols => self.tiles.clone(),
            _ => self.spanning(self.tile_columns()),
        }
    }

    /// Index of the first tile owned by `rank` along the split axis.
    pub fn process_tile_start(&self, rank: usize) -> usize {
        self.tile_starts[rank]
    }

    /// Extent of every worker's share along the split axis.
    pub fn shares(&self) -> Vec<usize> {
        let bounds = self.split_bounds();
        self.tile_starts
            .windows(2)
            .map(|w| bounds[w[1]] - bounds[w[0]])
            .collect()
    }

    /// Copies the tiles `tile_rows x tile_cols` out of this worker's share.
    pub fn local_get<T: TensorElem>(
        &self,
        matrix: &DistributedMatrix<T>,
        tile_rows: Range<usize>,
        tile_cols: Range<usize>,
    ) -> Result<Tensor<T, 2>> {
        let (rows, cols) = self.local_window(matrix, tile_rows, tile_cols)?;
        Ok(matrix.local().slice(rows, cols)?)
    }

    /// Writes `block` over the tiles starting at `(tile_rows.start, tile_cols.start)`.
    pub fn local_set<T: TensorElem>(
        &self,
        matrix: &mut DistributedMatrix<T>,
        tile_rows: Range<usize>,
        tile_cols: Range<usize>,
        block: &Tensor<T, 2>,
    ) -> Result<()> {
        let (rows, cols) = self.local_window(matrix, tile_rows, tile_cols)?;
        if block.shape() != &[rows.len(), cols.len()] {
            return Err(ArrayError::Layout(format!(
                "block {:?} does not fit tiles of {}x{}",
                block.shape(),
                rows.len(),
                cols.len()
            )));
        }
        matrix.local_mut().assign(rows.start, cols.start, block)?;
        Ok(())
    }

    /// Translates a tile window into local row and column ranges of the caller's share.
    fn local_window<T: TensorElem>(
        &self,
        matrix: &DistributedMatrix<T>,
        tile_rows: Range<usize>,
        tile_cols: Range<usize>,
    ) -> Result<(Range<usize>, Range<usize>)> {
        let rank = matrix.rank();
        let mut rows = self.row_bounds[tile_rows.start]..self.row_bounds[tile_rows.end];
        let mut cols = self.col_bounds[tile_cols.start]..self.col_bounds[tile_cols.end];
        let (window, owned) = match self.split {
            Split::Rows => (&mut rows, tile_rows),
            _ => (&mut cols, tile_cols),
        };
        let mine = self.tile_starts[rank]..self.tile_starts[rank + 1];
        if !owned.is_empty() && (owned.start < mine.start || owned.end > mine.end) {
            return Err(ArrayError::Layout(format!(
                "tiles {:?} are not owned by rank {}",
                owned, rank
            )));
        }
        let offset = matrix.local_range(rank).start;
        *window = window.start - offset..window.end - offset;
        Ok((rows, cols))
    }

    fn split_bounds(&self) -> &[usize] {
        match self.split {
            Split::Rows => &self.row_bounds,
            _ => &self.col_bounds,
        }
    }

    fn spanning(&self, count: usize) -> Vec<usize> {
        self.tiles
            .iter()
            .map(|&t| if t > 0 { count } else { 0 })
            .collect()
    }
}

/// Boundaries along the non-split axis: every split boundary below `len`, then `len`.
fn derive_bounds(split_bounds: &[usize], len: usize) -> Vec<usize> {
    let mut bounds: Vec<usize> = split_bounds.iter().copied().filter(|&b| b < len).collect();
    bounds.push(len);
    bounds
}

fn prefix(tiles: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(tiles.len() + 1);
    out.push(0);
    for &t in tiles {
        out.push(out[out.len() - 1] + t);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{ChannelCommunicator, Communicator};

    #[test]
    fn test_rows_grid() {
        let grid = TileGrid::from_shares([9, 6], Split::Rows, &[5, 4], 2).unwrap();
        assert_eq!(grid.row_bounds(), &[0, 3, 5, 7, 9]);
        assert_eq!(grid.col_bounds(), &[0, 3, 5, 6]);
        assert_eq!(grid.diagonal_columns(), 3);
        assert_eq!(grid.owning_process(2, 0), 1);
        assert_eq!(grid.owning_process(1, 2), 0);
        assert_eq!(grid.process_tile_start(1), 2);
        assert_eq!(grid.tile_extent(1, 1), (3, 5, 3, 5));
        assert_eq!(grid.tile_rows_per_process(), vec![2, 2]);
        assert_eq!(grid.tile_columns_per_process(), vec![3, 3]);
        assert_eq!(grid.shares(), vec![5, 4]);
    }

    #[test]
    fn test_rows_grid_refines_tall_tiles() {
        // Smallest share is 2 rows, so the 7-row share needs 4 tiles.
        let grid = TileGrid::from_shares([9, 2], Split::Rows, &[7, 2], 1).unwrap();
        assert_eq!(grid.row_bounds(), &[0, 2, 4, 6, 7, 9]);
        assert_eq!(grid.col_bounds(), &[0, 2]);
        assert_eq!(grid.tile_rows_per_process(), vec![4, 1]);
    }

    #[test]
    fn test_rows_grid_with_empty_ranks() {
        let grid = TileGrid::from_shares([2, 2], Split::Rows, &[1, 1, 0, 0], 3).unwrap();
        assert_eq!(grid.row_bounds(), &[0, 1, 2]);
        assert_eq!(grid.tile_rows_per_process(), vec![1, 1, 0, 0]);
        assert_eq!(grid.owning_process(1, 1), 1);
        assert_eq!(grid.shares(), vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_cols_grid() {
        let grid = TileGrid::from_shares([6, 9], Split::Cols, &[3, 3, 3], 1).unwrap();
        assert_eq!(grid.col_bounds(), &[0, 3, 6, 9]);
        assert_eq!(grid.row_bounds(), &[0, 3, 6]);
        assert_eq!(grid.diagonal_columns(), 2);
        assert_eq!(grid.owning_process(0, 2), 2);
        assert_eq!(grid.tile_rows_per_process(), vec![2, 2, 2]);
    }

    #[test]
    fn test_match_tiles() {
        let grid = TileGrid::from_shares([9, 4], Split::Cols, &[2, 2], 1).unwrap();
        assert_eq!(grid.row_bounds(), &[0, 2, 4, 9]);
        let q = grid.match_tiles(2);
        assert_eq!(q.gshape(), [9, 9]);
        assert_eq!(q.split(), Split::Rows);
        assert_eq!(q.row_bounds(), grid.row_bounds());
        assert_eq!(q.col_bounds(), grid.row_bounds());
        assert_eq!(q.shares(), vec![4, 5]);
    }

    #[test]
    fn test_replicated_has_no_grid() {
        assert!(TileGrid::from_shares([2, 2], Split::Replicated, &[], 1).is_err());
    }

    #[test]
    fn test_local_get_and_set() {
        let global = Tensor::<f64, 2>::new((0..24).map(f64::from).collect(), [6, 4]).unwrap();
        let out = ChannelCommunicator::spawn_group(2, |comm| {
            let mut a = DistributedMatrix::from_global(&global, Split::Rows, &comm).unwrap();
            let grid = TileGrid::square_diag(&a, 1).unwrap();
            let mine = comm.rank();
            let block = grid.local_get(&a, mine..mine + 1, 1..2).unwrap();
            let foreign = grid.local_get(&a, 1 - mine..2 - mine, 0..1);
            grid.local_set(&mut a, mine..mine + 1, 0..1, &Tensor::zeros([3, 3]))
                .unwrap();
            (block, foreign.is_err(), a.local().get(2, 2).unwrap())
        });
        assert_eq!(out[0].0.data(), &[3.0, 7.0, 11.0]);
        assert_eq!(out[1].0.data(), &[15.0, 19.0, 23.0]);
        assert!(out[0].1 && out[1].1);
        assert_eq!(out[0].2, 0.0);
    }
}
