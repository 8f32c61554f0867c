use geoseg::core::batch::{BatchAssembler, SamplingParams};
use geoseg::io::{GdalRaster, MemoryRaster, RasterPair, RasterSource};
use geoseg::types::{
    BandSelector, BandSpec, BandStats, NormalizationStats, SegResult, TileCoord, Window,
};
use ndarray::Array2;
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const SIZE: usize = 64;
const WINDOW: usize = 16;

/// Encodes band, row and column into every pixel value
fn coded_band(band: usize) -> Array2<f64> {
    Array2::from_shape_fn((SIZE, SIZE), |(r, c)| (band * 10000 + r * 100 + c) as f64)
}

fn checkerboard() -> Array2<f64> {
    Array2::from_shape_fn((SIZE, SIZE), |(r, c)| ((r + c) % 2) as f64)
}

/// Memory raster whose reads finish in random order
struct JitteryRaster {
    inner: MemoryRaster,
}

impl RasterSource for JitteryRaster {
    fn dimensions(&self) -> (usize, usize) {
        self.inner.dimensions()
    }

    fn band_count(&self) -> usize {
        self.inner.band_count()
    }

    fn read_window(&self, band: usize, window: Window) -> SegResult<Array2<f64>> {
        let delay = rand::thread_rng().gen_range(0..4);
        thread::sleep(Duration::from_millis(delay));
        self.inner.read_window(band, window)
    }

    fn describe(&self) -> String {
        format!("jittery {}", self.inner.describe())
    }
}

fn identity_stats(bands: usize) -> Arc<NormalizationStats> {
    Arc::new(NormalizationStats::new(vec![
        BandStats { mean: 0.0, std: 1.0 };
        bands
    ]))
}

fn raw_bands(count: usize) -> Arc<BandSpec> {
    Arc::new(BandSpec::new((1..=count).map(BandSelector::Raw).collect()).unwrap())
}

#[test]
fn test_slots_survive_out_of_order_reads() {
    let imagery = MemoryRaster::new("imagery", (1..=3).map(coded_band).collect()).unwrap();
    let labels = MemoryRaster::new("labels", vec![checkerboard()]).unwrap();
    let pair = RasterPair::new(
        Box::new(JitteryRaster { inner: imagery }),
        Box::new(JitteryRaster { inner: labels }),
    )
    .unwrap();

    let tiles = vec![
        TileCoord::new(3, 1),
        TileCoord::new(0, 2),
        TileCoord::new(3, 1),
        TileCoord::new(1, 3),
        TileCoord::new(2, 0),
        TileCoord::new(0, 1),
    ];
    let assembler = BatchAssembler::new(
        &pair,
        raw_bands(3),
        identity_stats(3),
        SamplingParams::new(WINDOW, 2),
        tiles.len(),
    )
    .expect("Failed to build assembler");

    // repeated assemblies must agree pixel for pixel
    let first = assembler.assemble(&tiles).unwrap();
    for _ in 0..5 {
        let again = assembler.assemble(&tiles).unwrap();
        assert_eq!(again.images, first.images);
        assert_eq!(again.labels, first.labels);
    }

    assert_eq!(first.images.dim(), (tiles.len(), 3, WINDOW, WINDOW));
    assert_eq!(first.tiles, tiles);
    for (i, tile) in tiles.iter().enumerate() {
        for channel in 0..3 {
            for r in 0..WINDOW {
                for c in 0..WINDOW {
                    let row = tile.y * WINDOW + r;
                    let col = tile.x * WINDOW + c;
                    let expected = ((channel + 1) * 10000 + row * 100 + col) as f32;
                    assert_eq!(first.images[[i, channel, r, c]], expected);
                }
            }
        }
        let label = first.labels[[i, 0, 0]];
        assert_eq!(label, ((tile.x * WINDOW + tile.y * WINDOW) % 2) as i64);
    }
}

#[test]
fn test_assembly_from_geotiff_pair() {
    let temp = TempDir::new().unwrap();
    let imagery_path = temp.path().join("mul.tif");
    let labels_path = temp.path().join("mask.tif");

    let driver = gdal::DriverManager::get_driver_by_name("GTiff").unwrap();
    {
        let dataset = driver
            .create_with_band_type::<f64, _>(&imagery_path, SIZE as isize, SIZE as isize, 2)
            .unwrap();
        for band in 1..=2 {
            let mut rasterband = dataset.rasterband(band as isize).unwrap();
            let data: Vec<f64> = coded_band(band).iter().cloned().collect();
            let buffer = gdal::raster::Buffer::new((SIZE, SIZE), data);
            rasterband.write((0, 0), (SIZE, SIZE), &buffer).unwrap();
        }
        let mut first = dataset.rasterband(1).unwrap();
        first.set_no_data_value(Some(-9999.0)).unwrap();
    }
    {
        let dataset = driver
            .create_with_band_type::<u8, _>(&labels_path, SIZE as isize, SIZE as isize, 1)
            .unwrap();
        let mut rasterband = dataset.rasterband(1).unwrap();
        let data: Vec<u8> = checkerboard().iter().map(|&v| v as u8).collect();
        let buffer = gdal::raster::Buffer::new((SIZE, SIZE), data);
        rasterband.write((0, 0), (SIZE, SIZE), &buffer).unwrap();
    }

    let raster = GdalRaster::open(&imagery_path).expect("Failed to open imagery");
    assert_eq!(raster.dimensions(), (SIZE, SIZE));
    assert_eq!(raster.band_count(), 2);
    assert_eq!(raster.nodata(1).unwrap(), Some(-9999.0));

    let pair = RasterPair::open(&imagery_path, &labels_path).expect("Failed to open pair");
    let spec = Arc::new(BandSpec::new(vec![BandSelector::Raw(2), BandSelector::Raw(1)]).unwrap());
    let assembler = BatchAssembler::new(
        &pair,
        spec,
        identity_stats(2),
        SamplingParams::new(WINDOW, 2),
        2,
    )
    .unwrap();

    let tiles = [TileCoord::new(1, 2), TileCoord::new(3, 3)];
    let batch = assembler.assemble(&tiles).unwrap();
    assert_eq!(batch.images.dim(), (2, 2, WINDOW, WINDOW));

    // channel order follows the band list, not the file
    assert_eq!(batch.images[[0, 0, 0, 0]], (20000 + 32 * 100 + 16) as f32);
    assert_eq!(batch.images[[0, 1, 0, 0]], (10000 + 32 * 100 + 16) as f32);
    assert_eq!(batch.images[[1, 1, 5, 7]], (10000 + 53 * 100 + 55) as f32);
    assert_eq!(batch.labels[[1, 5, 7]], ((53 + 55) % 2) as i64);
    assert_eq!(batch.ignored_pixels(2), 0);
}
