//! Local panel factorization.
//!
//! A worker factorizes the part of one tile column it owns, from its first unfinished tile
//! row down to the end of its share, and applies the transposed factor to the tiles to the
//! right so that later columns see the eliminated rows.

use super::Result;
use super::records::LocalFactor;
use crate::dndarray::DistributedMatrix;
use crate::tensor::FloatElem;
use crate::tiling::TileGrid;
use tracing::trace;

/// Factorizes tile rows `first_tile..` of tile column `column` on the calling worker.
///
/// Returns the complete local orthogonal factor. The panel's upper triangle is written back
/// in place.
pub(crate) fn factor_panel<T: FloatElem>(
    a: &mut DistributedMatrix<T>,
    grid: &TileGrid,
    column: usize,
    first_tile: usize,
) -> Result<LocalFactor<T>> {
    let rank = a.rank();
    let rows = first_tile..grid.process_tile_start(rank + 1);
    let panel = grid.local_get(a, rows.clone(), column..column + 1)?;
    let (q, r) = panel.qr()?;
    grid.local_set(a, rows.clone(), column..column + 1, &r)?;

    let trailing = column + 1..grid.tile_columns();
    if !trailing.is_empty() {
        let block = grid.local_get(a, rows.clone(), trailing.clone())?;
        let updated = q.transpose()?.matmul(&block)?;
        grid.local_set(a, rows.clone(), trailing, &updated)?;
    }

    let local_start = grid.row_bounds()[first_tile] - a.local_range(rank).start;
    trace!(rank, column, rows = q.rows(), local_start, "panel factorized");
    Ok(LocalFactor { q, local_start })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dndarray::Split;
    use crate::distributed::ChannelCommunicator;
    use crate::tensor::Tensor;

    #[test]
    fn test_panel_triangularizes_and_updates_trailing() {
        let global = Tensor::<f64, 2>::new(
            vec![
                2.0, 1.0, 0.0, //
                1.0, 3.0, 1.0, //
                0.0, 1.0, 4.0, //
                4.0, 0.0, 1.0,
            ],
            [4, 3],
        )
        .unwrap();
        let comms = ChannelCommunicator::group(1);
        let mut a = DistributedMatrix::from_global(&global, Split::Rows, &comms[0]).unwrap();
        let grid = TileGrid::from_shares([4, 3], Split::Rows, &[4], 4).unwrap();
        assert_eq!(grid.col_bounds(), &[0, 1, 2, 3]);

        let factor = factor_panel(&mut a, &grid, 0, 0).unwrap();
        assert_eq!(factor.local_start, 0);
        assert_eq!(factor.q.shape(), &[4, 4]);
        for i in 1..4 {
            assert!(a.local().get(i, 0).unwrap().abs() < 1e-12);
        }
        // Q * (updated A) gives back the input.
        let back = factor.q.matmul(a.local()).unwrap();
        assert!((&back - &global).unwrap().max_abs() < 1e-12);
    }

    #[test]
    fn test_panel_starting_below_first_tile() {
        let global = Tensor::<f64, 2>::new((1..=12).map(f64::from).collect(), [4, 3]).unwrap();
        let comms = ChannelCommunicator::group(1);
        let mut a = DistributedMatrix::from_global(&global, Split::Rows, &comms[0]).unwrap();
        let grid = TileGrid::from_shares([4, 3], Split::Rows, &[4], 4).unwrap();

        let factor = factor_panel(&mut a, &grid, 1, 1).unwrap();
        assert_eq!(factor.local_start, 1);
        assert_eq!(factor.q.shape(), &[3, 3]);
        // Row 0 and column 0 are untouched.
        assert_eq!(a.local().slice(0..1, 0..3).unwrap(), global.slice(0..1, 0..3).unwrap());
        assert_eq!(a.local().slice(0..4, 0..1).unwrap(), global.slice(0..4, 0..1).unwrap());
    }
}
