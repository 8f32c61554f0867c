use crate::io::raster::{RasterPair, RasterSource};
use crate::types::{BandSelector, BandWindow, ClassCode, LabelWindow, SegError, SegResult, Window};
use ndarray::Array2;

/// Attempts made for every raw band read
pub const READ_ATTEMPTS: usize = 3;

/// Class code given to label pixels that are NaN or infinite in the raster
pub const MISSING_LABEL: ClassCode = ClassCode::MIN;

/// Result of reading one (band, window) pair
#[derive(Debug, Clone)]
pub enum WindowData {
    Imagery(BandWindow),
    Labels(LabelWindow),
}

/// Reads single windows of imagery, derived-index and label bands
///
/// Raw reads are retried on transient failures without backoff. Once the
/// attempts are used up the read fails with [`SegError::RasterRead`].
#[derive(Debug, Clone)]
pub struct WindowReader {
    attempts: usize,
}

impl WindowReader {
    pub fn new() -> Self {
        Self {
            attempts: READ_ATTEMPTS,
        }
    }

    /// Read one band selector over one window
    pub fn read(
        &self,
        pair: &RasterPair,
        selector: BandSelector,
        window: Window,
    ) -> SegResult<WindowData> {
        match selector {
            BandSelector::Label => {
                let raw = self.read_raw(pair.labels(), 1, window)?;
                let labels =
                    raw.mapv(|v| if v.is_finite() { v as ClassCode } else { MISSING_LABEL });
                Ok(WindowData::Labels(labels))
            }
            BandSelector::Raw(band) => {
                let raw = self.read_raw(pair.imagery(), band, window)?;
                Ok(WindowData::Imagery(raw.mapv(|v| v as f32)))
            }
            derived => {
                let (a, b) = derived.derived_operands().ok_or_else(|| {
                    SegError::Processing(format!("'{}' is not a derived index", derived))
                })?;
                Ok(WindowData::Imagery(
                    self.read_normalized_difference(pair.imagery(), a, b, window)?,
                ))
            }
        }
    }

    /// Read a raw band, retrying transient failures
    pub fn read_raw(
        &self,
        source: &dyn RasterSource,
        band: usize,
        window: Window,
    ) -> SegResult<Array2<f64>> {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            match source.read_window(band, window) {
                Ok(data) => return Ok(data),
                Err(e) if e.is_transient() => {
                    log::warn!(
                        "Read error for band {} at window {} on try {} of {}: {}",
                        band,
                        window,
                        attempt,
                        self.attempts,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(SegError::RasterRead {
            band,
            window,
            attempts: self.attempts,
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".to_string()),
        })
    }

    /// `(a - b) / (a + b)` in f32; zero denominators stay non-finite
    fn read_normalized_difference(
        &self,
        source: &dyn RasterSource,
        a: usize,
        b: usize,
        window: Window,
    ) -> SegResult<BandWindow> {
        let a = self.read_raw(source, a, window)?.mapv(|v| v as f32);
        let b = self.read_raw(source, b, window)?.mapv(|v| v as f32);
        Ok((&a - &b) / (&a + &b))
    }
}

impl Default for WindowReader {
    fn default() -> Self {
        Self::new()
    }
}
