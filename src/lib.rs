//! geoseg: windowed raster sampling and staged transfer learning for
//! land-cover segmentation
//!
//! Imagery and label rasters are cut into square tiles. One tile in seven
//! is held out for evaluation by a fixed coordinate rule; the rest feed a
//! four-phase training schedule whose snapshots live in a blob store under
//! a prefix derived from the run's hyperparameters, so an interrupted run
//! picks up where it stopped.

pub mod types;
pub mod config;
pub mod io;
pub mod core;
pub mod pipeline;

// Re-export main types and functions for easier access
pub use types::{
    Backend, BandSelector, BandSpec, BandStats, LabelMapping, NormalizationStats, SegError,
    SegResult, TileCoord, Window,
};

pub use config::{EvaluateArgs, TrainingConfig};
pub use io::{GdalRaster, LocalBlobStore, MemoryRaster, RasterPair, RasterSource};
pub use pipeline::{run_evaluation, run_training};
