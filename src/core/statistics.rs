use crate::core::partition::TileGrid;
use crate::io::raster::RasterSource;
use crate::io::window_reader::WindowReader;
use crate::types::{BandStats, NormalizationStats, SegError, SegResult, TileCoord, Window};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// How normalization statistics are obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticsMode {
    /// Scan every pixel of every band
    Exact,
    /// Sample random tiles from the whole raster
    Approximate,
}

/// Statistics estimation parameters
#[derive(Debug, Clone)]
pub struct StatisticsParams {
    /// Tile size for approximate sampling and strip height for exact scans
    pub window_size: usize,
    /// Number of random tiles drawn in approximate mode
    pub sample_tiles: usize,
    /// Imagery value treated as nodata (NaN is always nodata)
    pub image_nodata: Option<f64>,
    /// Seed of the tile sampler
    pub seed: u64,
}

impl Default for StatisticsParams {
    fn default() -> Self {
        Self {
            window_size: 224,
            sample_tiles: 133,
            image_nodata: None,
            seed: 33,
        }
    }
}

/// Running mean/variance (Welford)
#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Moments {
    fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Population statistics; NaN when no sample was seen
    fn finish(&self) -> BandStats {
        if self.count == 0 {
            return BandStats {
                mean: f64::NAN,
                std: f64::NAN,
            };
        }
        BandStats {
            mean: self.mean,
            std: (self.m2 / self.count as f64).sqrt(),
        }
    }
}

/// Per-band normalization statistics estimator
pub struct StatisticsEstimator {
    params: StatisticsParams,
    reader: WindowReader,
}

impl StatisticsEstimator {
    pub fn new(params: StatisticsParams) -> Self {
        Self {
            params,
            reader: WindowReader::new(),
        }
    }

    pub fn standard() -> Self {
        Self::new(StatisticsParams::default())
    }

    /// Estimate (mean, std) of every band of `source`
    ///
    /// A band without a single valid sample comes back as NaN; run
    /// [`NormalizationStats::validate`] before using the result.
    pub fn estimate(
        &self,
        source: &dyn RasterSource,
        mode: StatisticsMode,
    ) -> SegResult<NormalizationStats> {
        log::info!(
            "Computing {:?} normalization statistics for {} ({} bands)",
            mode,
            source.describe(),
            source.band_count()
        );

        let moments = match mode {
            StatisticsMode::Exact => self.scan_exact(source)?,
            StatisticsMode::Approximate => self.sample_approximate(source)?,
        };
        let stats = NormalizationStats::new(moments.iter().map(Moments::finish).collect());

        log::info!("Means:               {:?}", stats.means());
        log::info!("Standard Deviations: {:?}", stats.stds());
        Ok(stats)
    }

    fn scan_exact(&self, source: &dyn RasterSource) -> SegResult<Vec<Moments>> {
        let (width, height) = source.dimensions();
        let strip = self.params.window_size.max(1);
        let mut moments = vec![Moments::default(); source.band_count()];

        for (i, band_moments) in moments.iter_mut().enumerate() {
            let mut row = 0;
            while row < height {
                let rows = strip.min(height - row);
                let data = self
                    .reader
                    .read_raw(source, i + 1, Window::new(0, row, width, rows))?;
                self.accumulate(band_moments, &data);
                row += rows;
            }
            log::debug!("Band {}: {} valid samples", i + 1, band_moments.count);
        }

        Ok(moments)
    }

    fn sample_approximate(&self, source: &dyn RasterSource) -> SegResult<Vec<Moments>> {
        let (width, height) = source.dimensions();
        let grid = TileGrid::from_dimensions(width, height, self.params.window_size)?;
        if grid.tile_count() == 0 {
            return Err(SegError::Config(format!(
                "{} ({}x{}) is smaller than one {}-pixel window",
                source.describe(),
                width,
                height,
                self.params.window_size
            )));
        }

        // Tiles come from the whole grid, evaluation tiles included
        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let mut moments = vec![Moments::default(); source.band_count()];

        for _ in 0..self.params.sample_tiles {
            let tile = TileCoord::new(rng.gen_range(0..grid.cols), rng.gen_range(0..grid.rows));
            let window = tile.window(self.params.window_size);
            for (i, band_moments) in moments.iter_mut().enumerate() {
                let data = self.reader.read_raw(source, i + 1, window)?;
                self.accumulate(band_moments, &data);
            }
        }

        Ok(moments)
    }

    fn accumulate(&self, moments: &mut Moments, data: &Array2<f64>) {
        let nodata = self.params.image_nodata;
        data.iter()
            .filter(|v| !v.is_nan() && Some(**v) != nodata)
            .for_each(|&v| moments.push(v));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::raster::MemoryRaster;
    use approx::assert_relative_eq;

    fn params(window_size: usize, image_nodata: Option<f64>) -> StatisticsParams {
        StatisticsParams {
            window_size,
            image_nodata,
            ..Default::default()
        }
    }

    #[test]
    fn test_exact_constant_raster() {
        let raster = MemoryRaster::constant("flat", 50, 30, &[4.0, -2.5]).unwrap();
        let estimator = StatisticsEstimator::new(params(8, None));
        let stats = estimator.estimate(&raster, StatisticsMode::Exact).unwrap();

        assert_eq!(stats.bands.len(), 2);
        assert_relative_eq!(stats.bands[0].mean, 4.0);
        assert_relative_eq!(stats.bands[0].std, 0.0);
        assert_relative_eq!(stats.bands[1].mean, -2.5);
        assert_relative_eq!(stats.bands[1].std, 0.0);
        assert!(stats.validate().is_ok());
    }

    #[test]
    fn test_exact_population_statistics() {
        // values 0..12 laid out over a 4x3 raster
        let band = Array2::from_shape_fn((3, 4), |(r, c)| (r * 4 + c) as f64);
        let raster = MemoryRaster::new("ramp", vec![band]).unwrap();
        let estimator = StatisticsEstimator::new(params(2, None));
        let stats = estimator.estimate(&raster, StatisticsMode::Exact).unwrap();

        assert_relative_eq!(stats.bands[0].mean, 5.5, epsilon = 1e-12);
        // population variance of 0..12 is (12^2 - 1) / 12
        assert_relative_eq!(stats.bands[0].std, (143.0f64 / 12.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_nodata_excluded() {
        let mut band = Array2::from_elem((4, 4), 10.0);
        band[[0, 0]] = -9999.0;
        band[[1, 1]] = f64::NAN;
        let raster = MemoryRaster::new("holes", vec![band]).unwrap();
        let estimator = StatisticsEstimator::new(params(2, Some(-9999.0)));

        for mode in [StatisticsMode::Exact, StatisticsMode::Approximate] {
            let stats = estimator.estimate(&raster, mode).unwrap();
            assert_relative_eq!(stats.bands[0].mean, 10.0);
            assert_relative_eq!(stats.bands[0].std, 0.0);
        }
    }

    #[test]
    fn test_all_nodata_band_is_undefined() {
        let raster = MemoryRaster::constant("empty", 8, 8, &[1.0, -1.0]).unwrap();
        let estimator = StatisticsEstimator::new(params(4, Some(-1.0)));
        let stats = estimator
            .estimate(&raster, StatisticsMode::Approximate)
            .unwrap();

        assert_relative_eq!(stats.bands[0].mean, 1.0);
        assert!(stats.bands[1].mean.is_nan());
        assert!(stats.bands[1].std.is_nan());
        assert!(matches!(stats.validate(), Err(SegError::Config(_))));
    }

    #[test]
    fn test_approximate_needs_one_window() {
        let raster = MemoryRaster::constant("tiny", 8, 8, &[1.0]).unwrap();
        let estimator = StatisticsEstimator::new(params(16, None));
        assert!(estimator
            .estimate(&raster, StatisticsMode::Approximate)
            .is_err());
    }
}
