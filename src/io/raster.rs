use crate::types::{SegError, SegResult, Window};
use gdal::Dataset;
use ndarray::{s, Array2};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Read access to a multi-band raster
///
/// Implementations are shared by every read worker of a batch, so they must
/// be `Sync`. Sources backed by a handle that is not safe for concurrent use
/// serialize access internally.
pub trait RasterSource: Send + Sync {
    /// Raster size as (width, height) in pixels
    fn dimensions(&self) -> (usize, usize);

    /// Number of bands
    fn band_count(&self) -> usize;

    /// Read one window of a 1-indexed band as a (rows x cols) array
    fn read_window(&self, band: usize, window: Window) -> SegResult<Array2<f64>>;

    /// Short human-readable name for diagnostics
    fn describe(&self) -> String;

    /// Nodata value the raster declares for a 1-indexed band, if any
    fn nodata(&self, band: usize) -> SegResult<Option<f64>> {
        self.check_request(band, Window::new(0, 0, 0, 0))?;
        Ok(None)
    }

    /// Reject band indices and windows the raster cannot serve
    fn check_request(&self, band: usize, window: Window) -> SegResult<()> {
        if band == 0 || band > self.band_count() {
            return Err(SegError::Config(format!(
                "Band {} out of range for {} ({} bands)",
                band,
                self.describe(),
                self.band_count()
            )));
        }
        let (width, height) = self.dimensions();
        if !window.fits_within(width, height) {
            return Err(SegError::Config(format!(
                "Window {} exceeds {} ({}x{})",
                window,
                self.describe(),
                width,
                height
            )));
        }
        Ok(())
    }
}

/// GDAL-backed raster
///
/// GDAL dataset handles must not be used from several threads at once, so
/// the dataset sits behind a single coarse lock: workers of a batch read one
/// at a time from the same open handle.
pub struct GdalRaster {
    path: PathBuf,
    width: usize,
    height: usize,
    band_count: usize,
    dataset: Mutex<Dataset>,
}

impl GdalRaster {
    /// Open a raster file
    pub fn open<P: AsRef<Path>>(path: P) -> SegResult<Self> {
        log::info!("Opening raster: {}", path.as_ref().display());

        let dataset = Dataset::open(path.as_ref())?;
        let (width, height) = dataset.raster_size();
        let band_count = dataset.raster_count().max(0) as usize;

        log::debug!("Raster size: {}x{}, bands: {}", width, height, band_count);

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            width,
            height,
            band_count,
            dataset: Mutex::new(dataset),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> SegResult<std::sync::MutexGuard<'_, Dataset>> {
        self.dataset.lock().map_err(|_| {
            SegError::Processing(format!("Dataset lock poisoned for {}", self.path.display()))
        })
    }
}

impl RasterSource for GdalRaster {
    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn band_count(&self) -> usize {
        self.band_count
    }

    fn read_window(&self, band: usize, window: Window) -> SegResult<Array2<f64>> {
        self.check_request(band, window)?;

        let buffer = {
            let dataset = self.lock()?;
            let rasterband = dataset.rasterband(band as isize)?;
            rasterband.read_as::<f64>(
                (window.col_off as isize, window.row_off as isize),
                (window.width, window.height),
                (window.width, window.height),
                None,
            )?
        };

        Array2::from_shape_vec((window.height, window.width), buffer.data)
            .map_err(|e| SegError::Processing(format!("Failed to reshape window data: {}", e)))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn nodata(&self, band: usize) -> SegResult<Option<f64>> {
        self.check_request(band, Window::new(0, 0, 0, 0))?;
        let dataset = self.lock()?;
        let rasterband = dataset.rasterband(band as isize)?;
        Ok(rasterband.no_data_value())
    }
}

/// Raster held entirely in memory, used for synthetic data
///
/// Reads only borrow the band arrays, so concurrent readers need no lock.
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    name: String,
    bands: Vec<Array2<f64>>,
    nodata: Option<f64>,
}

impl MemoryRaster {
    /// Build from (rows x cols) band arrays of identical shape
    pub fn new(name: &str, bands: Vec<Array2<f64>>) -> SegResult<Self> {
        let first = bands
            .first()
            .ok_or_else(|| SegError::Config(format!("Raster '{}' has no bands", name)))?;
        let shape = first.dim();
        if bands.iter().any(|b| b.dim() != shape) {
            return Err(SegError::Config(format!(
                "Bands of raster '{}' differ in shape",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            bands,
            nodata: None,
        })
    }

    /// Declare a nodata value shared by every band
    pub fn with_nodata(mut self, value: f64) -> Self {
        self.nodata = Some(value);
        self
    }

    /// Raster where every band holds a single value
    pub fn constant(name: &str, width: usize, height: usize, values: &[f64]) -> SegResult<Self> {
        let bands = values
            .iter()
            .map(|&v| Array2::from_elem((height, width), v))
            .collect();
        Self::new(name, bands)
    }
}

impl RasterSource for MemoryRaster {
    fn dimensions(&self) -> (usize, usize) {
        let (rows, cols) = self.bands[0].dim();
        (cols, rows)
    }

    fn band_count(&self) -> usize {
        self.bands.len()
    }

    fn read_window(&self, band: usize, window: Window) -> SegResult<Array2<f64>> {
        self.check_request(band, window)?;
        let data = self.bands[band - 1]
            .slice(s![
                window.row_off..window.row_off + window.height,
                window.col_off..window.col_off + window.width
            ])
            .to_owned();
        Ok(data)
    }

    fn describe(&self) -> String {
        format!("memory raster '{}'", self.name)
    }

    fn nodata(&self, band: usize) -> SegResult<Option<f64>> {
        self.check_request(band, Window::new(0, 0, 0, 0))?;
        Ok(self.nodata)
    }
}

/// Co-registered imagery and label rasters
pub struct RasterPair {
    imagery: Box<dyn RasterSource>,
    labels: Box<dyn RasterSource>,
}

impl RasterPair {
    /// Pair two rasters, rejecting any dimension mismatch
    pub fn new(imagery: Box<dyn RasterSource>, labels: Box<dyn RasterSource>) -> SegResult<Self> {
        let (width, height) = imagery.dimensions();
        let (label_width, label_height) = labels.dimensions();

        if width != label_width || height != label_height {
            log::error!("width {} {}", width, label_width);
            log::error!("height {} {}", height, label_height);
            return Err(SegError::Config(format!(
                "Imagery {} is {}x{} but labels {} are {}x{}",
                imagery.describe(),
                width,
                height,
                labels.describe(),
                label_width,
                label_height
            )));
        }
        if imagery.band_count() == 0 {
            return Err(SegError::Config(format!("{} has no bands", imagery.describe())));
        }
        if labels.band_count() == 0 {
            return Err(SegError::Config(format!("{} has no bands", labels.describe())));
        }

        Ok(Self { imagery, labels })
    }

    /// Open a GeoTIFF pair from disk
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(imagery: P, labels: Q) -> SegResult<Self> {
        Self::new(
            Box::new(GdalRaster::open(imagery)?),
            Box::new(GdalRaster::open(labels)?),
        )
    }

    pub fn imagery(&self) -> &dyn RasterSource {
        self.imagery.as_ref()
    }

    pub fn labels(&self) -> &dyn RasterSource {
        self.labels.as_ref()
    }

    pub fn width(&self) -> usize {
        self.imagery.dimensions().0
    }

    pub fn height(&self) -> usize {
        self.imagery.dimensions().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_raster_window() {
        let band = Array2::from_shape_fn((4, 6), |(r, c)| (r * 10 + c) as f64);
        let raster = MemoryRaster::new("grid", vec![band]).unwrap();
        assert_eq!(raster.dimensions(), (6, 4));

        let window = raster.read_window(1, Window::new(2, 1, 3, 2)).unwrap();
        assert_eq!(window.dim(), (2, 3));
        assert_eq!(window[[0, 0]], 12.0);
        assert_eq!(window[[1, 2]], 24.0);
    }

    #[test]
    fn test_out_of_range_requests() {
        let raster = MemoryRaster::constant("flat", 4, 4, &[1.0]).unwrap();
        assert!(matches!(
            raster.read_window(2, Window::new(0, 0, 2, 2)),
            Err(SegError::Config(_))
        ));
        assert!(matches!(
            raster.read_window(1, Window::new(3, 0, 2, 2)),
            Err(SegError::Config(_))
        ));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let imagery = MemoryRaster::constant("imagery", 8, 8, &[1.0, 2.0]).unwrap();
        let labels = MemoryRaster::constant("labels", 8, 7, &[0.0]).unwrap();
        let pair = RasterPair::new(Box::new(imagery), Box::new(labels));
        assert!(matches!(pair, Err(SegError::Config(_))));
    }

    #[test]
    fn test_declared_nodata() {
        let plain = MemoryRaster::constant("plain", 4, 4, &[1.0, 2.0]).unwrap();
        assert_eq!(plain.nodata(1).unwrap(), None);

        let flagged = plain.with_nodata(-9999.0);
        assert_eq!(flagged.nodata(2).unwrap(), Some(-9999.0));
        assert!(matches!(flagged.nodata(3), Err(SegError::Config(_))));
    }
}
