use crate::types::{Partition, SegError, SegResult, TileCoord};
use rand::Rng;

/// Tiles with `(x + y) % EVALUATION_MODULUS == 0` are held out for evaluation
pub const EVALUATION_MODULUS: usize = 7;

/// Partition membership of a tile; a pure function of its coordinate
pub fn partition(tile: TileCoord) -> Partition {
    if (tile.x + tile.y) % EVALUATION_MODULUS == 0 {
        Partition::Evaluation
    } else {
        Partition::Trainable
    }
}

/// Evaluation tiles of a raster in x-major, then y order, at most `limit`
pub fn enumerate_evaluation_tiles(
    width: usize,
    height: usize,
    window_size: usize,
    limit: usize,
) -> SegResult<Vec<TileCoord>> {
    Ok(TileGrid::from_dimensions(width, height, window_size)?.evaluation_tiles(limit))
}

/// Non-overlapping tile grid over a raster; partial edge tiles are dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub cols: usize,
    pub rows: usize,
    pub window_size: usize,
}

impl TileGrid {
    pub fn from_dimensions(width: usize, height: usize, window_size: usize) -> SegResult<Self> {
        if window_size == 0 {
            return Err(SegError::Config("Window size must be positive".to_string()));
        }
        Ok(Self {
            cols: width / window_size,
            rows: height / window_size,
            window_size,
        })
    }

    pub fn tile_count(&self) -> usize {
        self.cols * self.rows
    }

    pub fn contains(&self, tile: TileCoord) -> bool {
        tile.x < self.cols && tile.y < self.rows
    }

    /// Every tile, x-major then y
    pub fn tiles(&self) -> impl Iterator<Item = TileCoord> + '_ {
        (0..self.cols).flat_map(move |x| (0..self.rows).map(move |y| TileCoord::new(x, y)))
    }

    pub fn evaluation_tiles(&self, limit: usize) -> Vec<TileCoord> {
        self.tiles()
            .filter(|t| partition(*t) == Partition::Evaluation)
            .take(limit)
            .collect()
    }

    pub fn trainable_count(&self) -> usize {
        self.tiles()
            .filter(|t| partition(*t) == Partition::Trainable)
            .count()
    }
}

/// Draws trainable tiles uniformly, with replacement
#[derive(Debug, Clone)]
pub struct TrainableSampler {
    grid: TileGrid,
}

impl TrainableSampler {
    /// Fails when the grid has no trainable tile, which would make rejection
    /// sampling loop forever
    pub fn new(grid: TileGrid) -> SegResult<Self> {
        if grid.trainable_count() == 0 {
            return Err(SegError::Config(format!(
                "Raster tile grid {}x{} (window {}) has no trainable tiles",
                grid.cols, grid.rows, grid.window_size
            )));
        }
        Ok(Self { grid })
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> TileCoord {
        loop {
            let tile = TileCoord::new(
                rng.gen_range(0..self.grid.cols),
                rng.gen_range(0..self.grid.rows),
            );
            if partition(tile) == Partition::Trainable {
                return tile;
            }
        }
    }

    pub fn sample_batch<R: Rng>(&self, rng: &mut R, count: usize) -> Vec<TileCoord> {
        (0..count).map(|_| self.sample(rng)).collect()
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_partition_rule_full_cycle() {
        for x in 0..EVALUATION_MODULUS {
            for y in 0..EVALUATION_MODULUS {
                let expected = if (x + y) % 7 == 0 {
                    Partition::Evaluation
                } else {
                    Partition::Trainable
                };
                assert_eq!(partition(TileCoord::new(x, y)), expected);
                assert_eq!(partition(TileCoord::new(x + 70, y + 140)), expected);
            }
        }
    }

    #[test]
    fn test_evaluation_enumeration_is_deterministic() {
        let first = enumerate_evaluation_tiles(5000, 3000, 224, usize::MAX).unwrap();
        let second = enumerate_evaluation_tiles(5000, 3000, 224, usize::MAX).unwrap();
        assert_eq!(first, second);
        assert!(first.iter().all(|t| (t.x + t.y) % 7 == 0));

        // x-major ordering
        assert_eq!(first[0], TileCoord::new(0, 0));
        assert_eq!(first[1], TileCoord::new(0, 7));
        assert!(first.windows(2).all(|w| (w[0].x, w[0].y) < (w[1].x, w[1].y)));

        let limited = enumerate_evaluation_tiles(5000, 3000, 224, 3).unwrap();
        assert_eq!(limited, first[..3].to_vec());
    }

    #[test]
    fn test_four_tile_raster() {
        let grid = TileGrid::from_dimensions(448, 448, 224).unwrap();
        assert_eq!(grid.tile_count(), 4);
        assert_eq!(grid.evaluation_tiles(usize::MAX), vec![TileCoord::new(0, 0)]);
        for tile in [TileCoord::new(1, 0), TileCoord::new(0, 1), TileCoord::new(1, 1)] {
            assert_eq!(partition(tile), Partition::Trainable);
        }
        assert_eq!(grid.trainable_count(), 3);
    }

    #[test]
    fn test_sampler_only_draws_trainable_tiles() {
        let grid = TileGrid::from_dimensions(2240, 2240, 224).unwrap();
        let sampler = TrainableSampler::new(grid).unwrap();
        let mut rng = StdRng::seed_from_u64(33);
        for tile in sampler.sample_batch(&mut rng, 500) {
            assert!(grid.contains(tile));
            assert_eq!(partition(tile), Partition::Trainable);
        }
    }

    #[test]
    fn test_sampler_rejects_degenerate_grid() {
        // a single tile, (0, 0), is always held out
        let grid = TileGrid::from_dimensions(300, 300, 224).unwrap();
        assert!(matches!(TrainableSampler::new(grid), Err(SegError::Config(_))));

        let empty = TileGrid::from_dimensions(100, 100, 224).unwrap();
        assert_eq!(empty.tile_count(), 0);
        assert!(TrainableSampler::new(empty).is_err());
    }
}
