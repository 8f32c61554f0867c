//! I/O modules for rasters, window reads and artifact storage

pub mod raster;
pub mod window_reader;
pub mod blob_store;

pub use raster::{GdalRaster, MemoryRaster, RasterPair, RasterSource};
pub use window_reader::{WindowData, WindowReader, MISSING_LABEL, READ_ATTEMPTS};
pub use blob_store::{ArtifactKeys, BlobStore, BlobUrl, LocalBlobStore, RunStore, SnapshotKind};
