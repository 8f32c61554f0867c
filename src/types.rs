use ndarray::{Array2, Array3, Array4};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Real-valued imagery sample as fed to the model
pub type Sample = f32;

/// Class code (raw or dense)
pub type ClassCode = i64;

/// One window of one imagery channel (rows x cols)
pub type BandWindow = Array2<Sample>;

/// One window of label codes (rows x cols)
pub type LabelWindow = Array2<ClassCode>;

/// Imagery batch (batch x channel x rows x cols)
pub type ImageBatch = Array4<Sample>;

/// Label batch (batch x rows x cols)
pub type LabelBatch = Array3<ClassCode>;

/// Pixel rectangle inside a raster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

impl Window {
    pub fn new(col_off: usize, row_off: usize, width: usize, height: usize) -> Self {
        Self { col_off, row_off, width, height }
    }

    /// Check that the window lies inside a raster of the given size
    pub fn fits_within(&self, raster_width: usize, raster_height: usize) -> bool {
        self.col_off + self.width <= raster_width && self.row_off + self.height <= raster_height
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "col {} row {} ({}x{})",
            self.col_off, self.row_off, self.width, self.height
        )
    }
}

/// Grid address of a `window_size x window_size` tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: usize,
    pub y: usize,
}

impl TileCoord {
    pub fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    /// Pixel window covered by this tile
    pub fn window(&self, window_size: usize) -> Window {
        Window::new(
            self.x * window_size,
            self.y * window_size,
            window_size,
            window_size,
        )
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Which side of the train/eval split a tile belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Trainable,
    Evaluation,
}

/// A single input channel (or the label band)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BandSelector {
    /// 1-indexed imagery band
    Raw(usize),
    /// Normalized difference water index, (green - swir) / (green + swir)
    Ndwi,
    /// Normalized difference vegetation index, (nir - red) / (nir + red)
    Ndvi,
    /// Band 1 of the label raster
    Label,
}

impl BandSelector {
    /// Raw operands `(a, b)` of a derived index, combined as `(a - b) / (a + b)`
    pub fn derived_operands(&self) -> Option<(usize, usize)> {
        match self {
            BandSelector::Ndwi => Some((2, 5)), // green, swir
            BandSelector::Ndvi => Some((4, 3)), // nir, red
            _ => None,
        }
    }

    /// Highest imagery band index this selector reads
    pub fn highest_band(&self) -> Option<usize> {
        match self {
            BandSelector::Raw(band) => Some(*band),
            BandSelector::Label => None,
            derived => derived.derived_operands().map(|(a, b)| a.max(b)),
        }
    }
}

impl fmt::Display for BandSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandSelector::Raw(band) => write!(f, "{}", band),
            BandSelector::Ndwi => write!(f, "ndwi"),
            BandSelector::Ndvi => write!(f, "ndvi"),
            BandSelector::Label => write!(f, "label"),
        }
    }
}

impl FromStr for BandSelector {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ndwi" | "-1" => Ok(BandSelector::Ndwi),
            "ndvi" | "-2" => Ok(BandSelector::Ndvi),
            other => match other.parse::<usize>() {
                Ok(band) if band >= 1 => Ok(BandSelector::Raw(band)),
                _ => Err(SegError::Config(format!(
                    "Invalid band selector '{}': expected a 1-indexed band, 'ndwi' or 'ndvi'",
                    s
                ))),
            },
        }
    }
}

/// Ordered channel list of the model input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandSpec {
    selectors: Vec<BandSelector>,
}

impl BandSpec {
    pub fn new(selectors: Vec<BandSelector>) -> SegResult<Self> {
        if selectors.is_empty() {
            return Err(SegError::Config("Band specification is empty".to_string()));
        }
        if selectors.contains(&BandSelector::Label) {
            return Err(SegError::Config(
                "The label band cannot be used as an input channel".to_string(),
            ));
        }
        Ok(Self { selectors })
    }

    /// Check every selector against the number of imagery bands
    pub fn validate_against(&self, band_count: usize) -> SegResult<()> {
        for selector in &self.selectors {
            match selector.highest_band() {
                Some(0) => {
                    return Err(SegError::Config("Band indices are 1-indexed".to_string()));
                }
                Some(band) if band > band_count => {
                    return Err(SegError::Config(format!(
                        "Channel '{}' needs band {} but the imagery has {} bands",
                        selector, band, band_count
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn channels(&self) -> usize {
        self.selectors.len()
    }

    pub fn selectors(&self) -> &[BandSelector] {
        &self.selectors
    }

    pub fn iter(&self) -> impl Iterator<Item = &BandSelector> {
        self.selectors.iter()
    }
}

impl fmt::Display for BandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.selectors.iter().map(|s| s.to_string()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Raw label code to dense training class
///
/// Every entry is matched against the original codes, so mappings never
/// chain (`1:2,2:3` sends 1 to 2, not to 3).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMapping {
    map: std::collections::BTreeMap<ClassCode, ClassCode>,
}

impl LabelMapping {
    pub fn new(pairs: impl IntoIterator<Item = (ClassCode, ClassCode)>) -> Self {
        Self {
            map: pairs.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, raw: ClassCode) -> ClassCode {
        self.map.get(&raw).copied().unwrap_or(raw)
    }

    pub fn apply(&self, labels: &LabelWindow) -> LabelWindow {
        if self.map.is_empty() {
            return labels.clone();
        }
        labels.mapv(|code| self.get(code))
    }
}

impl FromStr for LabelMapping {
    type Err = SegError;

    /// Parse `raw:dense,raw:dense`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut pairs = Vec::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (raw, dense) = entry.split_once(':').ok_or_else(|| {
                SegError::Config(format!("Label mapping entry '{}' is not raw:dense", entry))
            })?;
            let parse = |v: &str| {
                v.trim().parse::<ClassCode>().map_err(|e| {
                    SegError::Config(format!("Invalid label code '{}' in mapping: {}", v, e))
                })
            };
            pairs.push((parse(raw)?, parse(dense)?));
        }
        Ok(Self::new(pairs))
    }
}

impl fmt::Display for LabelMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self.map.iter().map(|(k, v)| format!("{}:{}", k, v)).collect();
        write!(f, "{}", entries.join(","))
    }
}

/// Compute backend a batch is prepared for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum Backend {
    Cpu,
    Cuda,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cpu => write!(f, "cpu"),
            Backend::Cuda => write!(f, "cuda"),
        }
    }
}

/// Mean and standard deviation of one raw band
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandStats {
    pub mean: f64,
    pub std: f64,
}

/// Per-band normalization constants, index 0 is raster band 1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    pub bands: Vec<BandStats>,
}

impl NormalizationStats {
    pub fn new(bands: Vec<BandStats>) -> Self {
        Self { bands }
    }

    /// Reject undefined statistics (e.g. a band with no valid samples)
    pub fn validate(&self) -> SegResult<()> {
        if self.bands.is_empty() {
            return Err(SegError::Config("No normalization statistics".to_string()));
        }
        for (i, stats) in self.bands.iter().enumerate() {
            if !stats.mean.is_finite() || !stats.std.is_finite() {
                return Err(SegError::Config(format!(
                    "Normalization statistics for band {} are undefined (mean={}, std={}); \
                     the band has no valid samples",
                    i + 1,
                    stats.mean,
                    stats.std
                )));
            }
            if stats.std == 0.0 {
                log::warn!(
                    "Band {} has zero standard deviation; it will only be centred",
                    i + 1
                );
            }
        }
        Ok(())
    }

    /// Statistics of a 1-indexed raw band
    pub fn band(&self, band: usize) -> Option<&BandStats> {
        band.checked_sub(1).and_then(|i| self.bands.get(i))
    }

    pub fn means(&self) -> Vec<f64> {
        self.bands.iter().map(|b| b.mean).collect()
    }

    pub fn stds(&self) -> Vec<f64> {
        self.bands.iter().map(|b| b.std).collect()
    }
}

/// Error types for segmentation training and evaluation
#[derive(Debug, thiserror::Error)]
pub enum SegError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Read of band {band} at {window} failed after {attempts} attempts: {message}")]
    RasterRead {
        band: usize,
        window: Window,
        attempts: usize,
        message: String,
    },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Blob store error: {0}")]
    BlobStore(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("NPY write error: {0}")]
    Npy(#[from] ndarray_npy::WriteNpyError),

    #[error("Processing error: {0}")]
    Processing(String),
}

impl SegError {
    /// Errors worth retrying at the window reader
    pub fn is_transient(&self) -> bool {
        matches!(self, SegError::Io(_) | SegError::Gdal(_))
    }
}

/// Result type for segmentation operations
pub type SegResult<T> = Result<T, SegError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_selector_parsing() {
        assert_eq!("3".parse::<BandSelector>().unwrap(), BandSelector::Raw(3));
        assert_eq!("NDWI".parse::<BandSelector>().unwrap(), BandSelector::Ndwi);
        assert_eq!("-1".parse::<BandSelector>().unwrap(), BandSelector::Ndwi);
        assert_eq!("-2".parse::<BandSelector>().unwrap(), BandSelector::Ndvi);
        assert!("0".parse::<BandSelector>().is_err());
        assert!("red".parse::<BandSelector>().is_err());
    }

    #[test]
    fn test_band_spec_validation() {
        assert!(BandSpec::new(vec![]).is_err());
        assert!(BandSpec::new(vec![BandSelector::Label]).is_err());

        let spec = BandSpec::new(vec![BandSelector::Raw(1), BandSelector::Ndwi]).unwrap();
        assert_eq!(spec.channels(), 2);
        // NDWI needs band 5
        assert!(spec.validate_against(4).is_err());
        assert!(spec.validate_against(5).is_ok());
    }

    #[test]
    fn test_tile_window() {
        let window = TileCoord::new(2, 3).window(224);
        assert_eq!(window, Window::new(448, 672, 224, 224));
        assert!(window.fits_within(672, 896));
        assert!(!window.fits_within(671, 896));
    }

    #[test]
    fn test_label_mapping() {
        let mapping: LabelMapping = "1:0, 2:1,3:2".parse().unwrap();
        let labels: LabelWindow = ndarray::array![[1, 2], [3, 9]];
        let expected: LabelWindow = ndarray::array![[0, 1], [2, 9]];
        assert_eq!(mapping.apply(&labels), expected);
        assert_eq!(mapping.to_string(), "1:0,2:1,3:2");

        // entries do not chain
        let swap: LabelMapping = "0:1,1:0".parse().unwrap();
        let pair: LabelWindow = ndarray::array![[0, 1]];
        let swapped: LabelWindow = ndarray::array![[1, 0]];
        assert_eq!(swap.apply(&pair), swapped);

        assert!("1-2".parse::<LabelMapping>().is_err());
        assert!("".parse::<LabelMapping>().unwrap().is_empty());
    }

    #[test]
    fn test_identity_mapping_is_idempotent() {
        let identity = LabelMapping::new((0..4).map(|c| (c, c)));
        let dense: LabelWindow = ndarray::array![[0, 1, 2], [3, 2, 1]];
        let once = identity.apply(&dense);
        assert_eq!(once, dense);
        assert_eq!(identity.apply(&once), once);
    }

    #[test]
    fn test_undefined_statistics_rejected() {
        let stats = NormalizationStats::new(vec![
            BandStats { mean: 1.0, std: 2.0 },
            BandStats { mean: f64::NAN, std: f64::NAN },
        ]);
        assert!(matches!(stats.validate(), Err(SegError::Config(_))));
        assert_eq!(stats.band(1).unwrap().std, 2.0);
        assert!(stats.band(0).is_none());
    }
}
