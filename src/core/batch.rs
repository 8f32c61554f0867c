use crate::io::raster::RasterPair;
use crate::io::window_reader::{WindowData, WindowReader, MISSING_LABEL};
use crate::types::{
    Backend, BandSelector, BandSpec, BandWindow, ClassCode, ImageBatch, LabelBatch, LabelMapping,
    LabelWindow, NormalizationStats, SegError, SegResult, TileCoord, Window,
};
use ndarray::{stack, Array2, ArrayView2, ArrayView3, Axis, Zip};
use std::sync::Arc;

/// Upper bound on concurrent window reads
pub const MAX_READ_WORKERS: usize = 32;

/// How tiles are turned into model-ready samples
#[derive(Debug, Clone)]
pub struct SamplingParams {
    /// Tile edge length in pixels
    pub window_size: usize,
    /// Raw to dense label codes, applied before masking
    pub label_mapping: LabelMapping,
    /// Label code excluded from loss and metrics
    pub label_nodata: ClassCode,
    /// Raw imagery value marking missing data in the first channel
    pub image_nodata: Option<f64>,
    /// Backend the batches are prepared for
    pub device: Backend,
}

impl SamplingParams {
    pub fn new(window_size: usize, label_nodata: ClassCode) -> Self {
        Self {
            window_size,
            label_mapping: LabelMapping::default(),
            label_nodata,
            image_nodata: None,
            device: Backend::Cpu,
        }
    }
}

/// A stacked batch of normalized imagery and dense labels
#[derive(Debug, Clone)]
pub struct Batch {
    /// batch x channel x rows x cols
    pub images: ImageBatch,
    /// batch x rows x cols
    pub labels: LabelBatch,
    /// Tile of every batch entry, in order
    pub tiles: Vec<TileCoord>,
    pub device: Backend,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Number of pixels carrying the ignore code
    pub fn ignored_pixels(&self, label_nodata: ClassCode) -> usize {
        self.labels.iter().filter(|&&l| l == label_nodata).count()
    }
}

/// One entry of a read plan; `slot == channels` is the label read
#[derive(Debug, Clone, Copy)]
struct ReadRequest {
    tile_index: usize,
    slot: usize,
    selector: BandSelector,
    window: Window,
}

type SlotKey = (usize, usize);

/// Builds batches from a raster pair
///
/// Every (tile, channel) window and every tile's label window is read as an
/// independent request on a bounded pool that lives as long as the
/// assembler. Results are placed by their `(tile, slot)` key, so the order
/// in which workers finish never affects the batch layout.
pub struct BatchAssembler<'a> {
    pair: &'a RasterPair,
    bands: Arc<BandSpec>,
    stats: Arc<NormalizationStats>,
    params: SamplingParams,
    reader: WindowReader,
    workers: usize,
    #[cfg(feature = "parallel")]
    pool: rayon::ThreadPool,
}

impl<'a> BatchAssembler<'a> {
    /// Validate the channel layout against the raster and start the read pool
    ///
    /// `max_batch` is the largest number of tiles a single call to
    /// [`assemble`](Self::assemble) will receive; it sizes the pool.
    pub fn new(
        pair: &'a RasterPair,
        bands: Arc<BandSpec>,
        stats: Arc<NormalizationStats>,
        params: SamplingParams,
        max_batch: usize,
    ) -> SegResult<Self> {
        let band_count = pair.imagery().band_count();
        bands.validate_against(band_count)?;

        if stats.bands.len() != band_count {
            return Err(SegError::Config(format!(
                "{} normalization statistics for {} imagery bands",
                stats.bands.len(),
                band_count
            )));
        }
        if params.window_size == 0 {
            return Err(SegError::Config("Window size must be positive".to_string()));
        }

        let plan_size = max_batch.max(1) * (bands.channels() + 1);
        let workers = plan_size.min(MAX_READ_WORKERS);

        #[cfg(feature = "parallel")]
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("geoseg-read-{}", i))
            .build()
            .map_err(|e| SegError::Processing(format!("Failed to start read pool: {}", e)))?;

        log::debug!(
            "Batch assembler: channels {}, window {}, {} read workers",
            bands,
            params.window_size,
            workers
        );

        Ok(Self {
            pair,
            bands,
            stats,
            params,
            reader: WindowReader::new(),
            workers,
            #[cfg(feature = "parallel")]
            pool,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    pub fn bands(&self) -> &BandSpec {
        &self.bands
    }

    pub fn stats(&self) -> &NormalizationStats {
        &self.stats
    }

    pub fn pair(&self) -> &RasterPair {
        self.pair
    }

    /// Read, normalize, mask and stack the given tiles
    pub fn assemble(&self, tiles: &[TileCoord]) -> SegResult<Batch> {
        if tiles.is_empty() {
            return Err(SegError::Processing("Cannot assemble an empty batch".to_string()));
        }

        let plan = self.plan(tiles);
        let results = self.execute(&plan)?;

        let channels = self.bands.channels();
        let mut images: Vec<Vec<Option<BandWindow>>> = vec![vec![None; channels]; tiles.len()];
        let mut labels: Vec<Option<LabelWindow>> = vec![None; tiles.len()];

        for ((tile_index, slot), data) in results {
            match data {
                WindowData::Imagery(window) if slot < channels => {
                    images[tile_index][slot] = Some(window)
                }
                WindowData::Labels(window) if slot == channels => labels[tile_index] = Some(window),
                _ => {
                    return Err(SegError::Processing(format!(
                        "Read result for tile {} landed in the wrong slot {}",
                        tiles[tile_index], slot
                    )))
                }
            }
        }

        let mut tile_images = Vec::with_capacity(tiles.len());
        let mut tile_labels = Vec::with_capacity(tiles.len());
        for (i, (channel_windows, label_window)) in images.into_iter().zip(labels).enumerate() {
            let channel_windows = channel_windows
                .into_iter()
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| missing_slot(tiles[i]))?;
            let label_window = label_window.ok_or_else(|| missing_slot(tiles[i]))?;

            let (image, label) = self.finish_tile(channel_windows, label_window)?;
            tile_images.push(image);
            tile_labels.push(label);
        }

        let image_views: Vec<ArrayView3<f32>> = tile_images.iter().map(|a| a.view()).collect();
        let label_views: Vec<ArrayView2<ClassCode>> =
            tile_labels.iter().map(|a| a.view()).collect();

        let images = stack(Axis(0), &image_views)
            .map_err(|e| SegError::Processing(format!("Failed to stack imagery: {}", e)))?;
        let labels = stack(Axis(0), &label_views)
            .map_err(|e| SegError::Processing(format!("Failed to stack labels: {}", e)))?;

        Ok(Batch {
            images,
            labels,
            tiles: tiles.to_vec(),
            device: self.params.device,
        })
    }

    fn plan(&self, tiles: &[TileCoord]) -> Vec<ReadRequest> {
        let channels = self.bands.channels();
        let mut plan = Vec::with_capacity(tiles.len() * (channels + 1));

        for (tile_index, tile) in tiles.iter().enumerate() {
            let window = tile.window(self.params.window_size);
            for (slot, selector) in self.bands.iter().enumerate() {
                plan.push(ReadRequest {
                    tile_index,
                    slot,
                    selector: *selector,
                    window,
                });
            }
            plan.push(ReadRequest {
                tile_index,
                slot: channels,
                selector: BandSelector::Label,
                window,
            });
        }

        plan
    }

    #[cfg(feature = "parallel")]
    fn execute(&self, plan: &[ReadRequest]) -> SegResult<Vec<(SlotKey, WindowData)>> {
        use rayon::prelude::*;

        self.pool
            .install(|| plan.par_iter().map(|request| self.fetch(request)).collect())
    }

    #[cfg(not(feature = "parallel"))]
    fn execute(&self, plan: &[ReadRequest]) -> SegResult<Vec<(SlotKey, WindowData)>> {
        plan.iter().map(|request| self.fetch(request)).collect()
    }

    fn fetch(&self, request: &ReadRequest) -> SegResult<(SlotKey, WindowData)> {
        let data = self
            .reader
            .read(self.pair, request.selector, request.window)?;
        Ok(((request.tile_index, request.slot), data))
    }

    /// Normalize, remap and mask one tile
    fn finish_tile(
        &self,
        mut channels: Vec<BandWindow>,
        raw_labels: LabelWindow,
    ) -> SegResult<(ndarray::Array3<f32>, LabelWindow)> {
        let mut labels = self.params.label_mapping.apply(&raw_labels);
        let ignore = self.params.label_nodata;
        let image_nodata = self.params.image_nodata.map(|v| v as f32);

        // The sentinel is compared on the raw first channel, before normalization
        let mut mask: Array2<bool> = Array2::from_elem(labels.dim(), false);
        Zip::from(&mut mask)
            .and(&raw_labels)
            .and(&labels)
            .and(&channels[0])
            .for_each(|m, &raw, &label, &first| {
                *m = raw == MISSING_LABEL
                    || label == ignore
                    || first.is_nan()
                    || Some(first) == image_nodata;
            });

        for (selector, channel) in self.bands.iter().zip(channels.iter_mut()) {
            if let BandSelector::Raw(band) = selector {
                let stats = self.stats.band(*band).ok_or_else(|| {
                    SegError::Config(format!("No normalization statistics for band {}", band))
                })?;
                let mean = stats.mean;
                let std = if stats.std == 0.0 { 1.0 } else { stats.std };
                channel.mapv_inplace(|v| ((v as f64 - mean) / std) as f32);
            }
            Zip::from(&mut mask)
                .and(&*channel)
                .for_each(|m, v| *m |= !v.is_finite());
        }

        for channel in channels.iter_mut() {
            Zip::from(channel).and(&mask).for_each(|v, &m| {
                if m {
                    *v = 0.0;
                }
            });
        }
        Zip::from(&mut labels).and(&mask).for_each(|l, &m| {
            if m {
                *l = ignore;
            }
        });

        let views: Vec<ArrayView2<f32>> = channels.iter().map(|c| c.view()).collect();
        let image = stack(Axis(0), &views)
            .map_err(|e| SegError::Processing(format!("Failed to stack channels: {}", e)))?;

        Ok((image, labels))
    }
}

fn missing_slot(tile: TileCoord) -> SegError {
    SegError::Processing(format!("Missing read result for tile {}", tile))
}
