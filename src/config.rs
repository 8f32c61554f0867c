//! Command-line and environment configuration for training and evaluation

use crate::core::batch::SamplingParams;
use crate::core::model::ModelConfig;
use crate::core::phases::PhaseSchedule;
use crate::core::statistics::{StatisticsMode, StatisticsParams};
use crate::types::{Backend, BandSelector, BandSpec, ClassCode, LabelMapping, SegError, SegResult};
use clap::Parser;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

fn parse_band(value: &str) -> Result<BandSelector, String> {
    value.parse::<BandSelector>().map_err(|e| e.to_string())
}

fn parse_label_mapping(value: &str) -> Result<LabelMapping, String> {
    value.parse::<LabelMapping>().map_err(|e| e.to_string())
}

fn default_bands() -> Vec<BandSelector> {
    vec![
        BandSelector::Raw(1),
        BandSelector::Raw(2),
        BandSelector::Raw(3),
    ]
}

/// Resolve the label ignore code against the class count
///
/// Unset means one past the last class. A code that names a real class
/// would silently drop that class from training, so it is rejected.
pub fn resolve_label_nodata(label_nd: Option<ClassCode>, classes: usize) -> SegResult<ClassCode> {
    match label_nd {
        None => {
            let code = classes as ClassCode;
            log::warn!("Label nodata not set, using {}", code);
            Ok(code)
        }
        Some(code) if (0..classes as ClassCode).contains(&code) => Err(SegError::Config(format!(
            "Label nodata {} collides with one of the {} classes",
            code, classes
        ))),
        Some(code) => Ok(code),
    }
}

/// Staged transfer-learning run
#[derive(Parser, Debug, Clone)]
#[command(
    name = "geoseg-train",
    about = "Train a land-cover segmentation model on a raster pair with staged transfer learning"
)]
pub struct TrainingConfig {
    /// Input channels: 1-indexed bands, `ndwi` (or -1), `ndvi` (or -2)
    #[arg(
        long,
        env = "TRAINING_BANDS",
        num_args = 1..,
        value_delimiter = ',',
        allow_negative_numbers = true,
        value_parser = parse_band,
        default_values_t = default_bands()
    )]
    pub bands: Vec<BandSelector>,

    /// Epochs of phase 0 (adapter and heads)
    #[arg(long, env = "TRAINING_EPOCHS_1", default_value_t = 5)]
    pub epochs1: usize,

    /// Learning rate of phase 0
    #[arg(long, env = "LEARNING_RATE_1", default_value_t = 0.01)]
    pub learning_rate1: f32,

    /// Epochs of phase 1 (adapter and heads again)
    #[arg(long, env = "TRAINING_EPOCHS_2", default_value_t = 5)]
    pub epochs2: usize,

    /// Learning rate of phase 1
    #[arg(long, env = "LEARNING_RATE_2", default_value_t = 0.001)]
    pub learning_rate2: f32,

    /// Epochs of phase 2 (all layers)
    #[arg(long, env = "TRAINING_EPOCHS_3", default_value_t = 5)]
    pub epochs3: usize,

    /// Learning rate of phase 2
    #[arg(long, env = "LEARNING_RATE_3", default_value_t = 0.01)]
    pub learning_rate3: f32,

    /// Epochs of phase 3 (all layers again, with checkpoints)
    #[arg(long, env = "TRAINING_EPOCHS_4", default_value_t = 5)]
    pub epochs4: usize,

    /// Learning rate of phase 3
    #[arg(long, env = "LEARNING_RATE_4", default_value_t = 0.001)]
    pub learning_rate4: f32,

    /// Imagery raster: local path or s3://bucket/key
    #[arg(long, env = "INPUT_TRAINING_IMG")]
    pub training_img: String,

    /// Label raster: local path or s3://bucket/key
    #[arg(long, env = "INPUT_LABEL_IMG")]
    pub label_img: String,

    /// Label remapping, `raw:dense,raw:dense`
    #[arg(long, env = "LABEL_MAPPING", value_parser = parse_label_mapping)]
    pub label_map: Option<LabelMapping>,

    /// Label code ignored by loss and metrics (defaults to the class count)
    #[arg(long, env = "TRAINING_LABEL_ND", allow_negative_numbers = true)]
    pub label_nd: Option<ClassCode>,

    /// Imagery nodata value, checked on the first channel
    #[arg(long, env = "TRAINING_IMAGE_ND", allow_negative_numbers = true)]
    pub img_nd: Option<f64>,

    /// Class weights; their count is the number of classes
    #[arg(long, required = true, num_args = 1..)]
    pub weights: Vec<f32>,

    #[arg(long, env = "OUTPUT_DILATION", default_value_t = 1)]
    pub output_dilation: usize,

    #[arg(long, env = "OUTPUT_KERNEL", default_value_t = 1)]
    pub output_kernel: usize,

    #[arg(long, env = "OUTPUT_STRIDE", default_value_t = 1)]
    pub output_stride: usize,

    #[arg(long, env = "INPUT_DILATION", default_value_t = 1)]
    pub input_dilation: usize,

    #[arg(long, env = "INPUT_KERNEL", default_value_t = 7)]
    pub input_kernel: usize,

    #[arg(long, env = "INPUT_STRIDE", default_value_t = 2)]
    pub input_stride: usize,

    #[arg(long, default_value_t = 33)]
    pub random_seed: u64,

    /// Tiles per batch (at least 2)
    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,

    #[arg(long, value_enum, default_value_t = Backend::Cpu)]
    pub backend: Backend,

    /// Bucket for models, run records and evaluation artifacts
    #[arg(long)]
    pub s3_bucket: String,

    /// Key prefix for everything this run stores
    #[arg(long)]
    pub s3_prefix: String,

    #[arg(long, default_value_t = 224)]
    pub window_size: usize,

    /// Estimate normalization statistics from random tiles
    #[arg(long)]
    pub approx_mean_std: bool,

    /// Upper bound on batches per epoch
    #[arg(long, default_value_t = usize::MAX)]
    pub max_epoch_size: usize,

    /// Skip evaluation after training
    #[arg(long)]
    pub disable_eval: bool,

    /// Upper bound on evaluated windows
    #[arg(long, default_value_t = usize::MAX)]
    pub max_eval_windows: usize,

    /// Key of a saved model to run the final phase from
    #[arg(long)]
    pub start_from: Option<String>,

    /// Root directory of the local blob store
    #[arg(long, env = "GEOSEG_BLOB_ROOT", default_value = "./blobs")]
    pub blob_root: PathBuf,

    /// Directory for downloaded inputs and scratch files
    #[arg(long, env = "GEOSEG_WORK_DIR", default_value = "./work")]
    pub work_dir: PathBuf,
}

/// The subset of the configuration that identifies a run
///
/// Execution switches (backend, evaluation toggles) and local paths are
/// left out so the same run resumes wherever it executes.
#[derive(Debug, Serialize)]
pub struct HyperParameters<'a> {
    pub bands: &'a [BandSelector],
    pub epochs: [usize; 4],
    pub learning_rates: [f32; 4],
    pub training_img: &'a str,
    pub label_img: &'a str,
    pub label_map: Option<&'a LabelMapping>,
    pub label_nd: Option<ClassCode>,
    pub img_nd: Option<f64>,
    pub weights: &'a [f32],
    pub output_dilation: usize,
    pub output_kernel: usize,
    pub output_stride: usize,
    pub input_dilation: usize,
    pub input_kernel: usize,
    pub input_stride: usize,
    pub random_seed: u64,
    pub batch_size: usize,
    pub s3_bucket: &'a str,
    pub s3_prefix: &'a str,
    pub window_size: usize,
    pub approx_mean_std: bool,
    pub max_epoch_size: usize,
    pub start_from: Option<&'a str>,
}

impl TrainingConfig {
    pub fn hyperparameters(&self) -> HyperParameters<'_> {
        HyperParameters {
            bands: &self.bands,
            epochs: [self.epochs1, self.epochs2, self.epochs3, self.epochs4],
            learning_rates: [
                self.learning_rate1,
                self.learning_rate2,
                self.learning_rate3,
                self.learning_rate4,
            ],
            training_img: &self.training_img,
            label_img: &self.label_img,
            label_map: self.label_map.as_ref(),
            label_nd: self.label_nd,
            img_nd: self.img_nd,
            weights: &self.weights,
            output_dilation: self.output_dilation,
            output_kernel: self.output_kernel,
            output_stride: self.output_stride,
            input_dilation: self.input_dilation,
            input_kernel: self.input_kernel,
            input_stride: self.input_stride,
            random_seed: self.random_seed,
            batch_size: self.batch_size,
            s3_bucket: &self.s3_bucket,
            s3_prefix: &self.s3_prefix,
            window_size: self.window_size,
            approx_mean_std: self.approx_mean_std,
            max_epoch_size: self.max_epoch_size,
            start_from: self.start_from.as_deref(),
        }
    }

    /// Lowercase hex SHA-256 of the canonical JSON of the hyperparameters
    pub fn checkpoint_identity(&self) -> SegResult<String> {
        let canonical = serde_json::to_string(&self.hyperparameters())?;
        Ok(format!("{:x}", Sha256::digest(canonical.as_bytes())))
    }

    pub fn classes(&self) -> usize {
        self.weights.len()
    }

    pub fn band_spec(&self) -> SegResult<BandSpec> {
        BandSpec::new(self.bands.clone())
    }

    pub fn label_nodata(&self) -> SegResult<ClassCode> {
        resolve_label_nodata(self.label_nd, self.classes())
    }

    pub fn schedule(&self) -> PhaseSchedule {
        PhaseSchedule {
            epochs: [self.epochs1, self.epochs2, self.epochs3, self.epochs4],
            learning_rates: [
                self.learning_rate1,
                self.learning_rate2,
                self.learning_rate3,
                self.learning_rate4,
            ],
        }
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            input_channels: self.bands.len(),
            classes: self.classes(),
            input_kernel_size: self.input_kernel,
            input_stride: self.input_stride,
            input_dilation: self.input_dilation,
            output_kernel_size: self.output_kernel,
            output_stride: self.output_stride,
            output_dilation: self.output_dilation,
            backend: self.backend,
            seed: self.random_seed,
        }
    }

    /// `image_nodata` is the resolved sentinel: `--img-nd` or the raster's own
    pub fn sampling_params(
        &self,
        label_nodata: ClassCode,
        image_nodata: Option<f64>,
    ) -> SamplingParams {
        SamplingParams {
            window_size: self.window_size,
            label_mapping: self.label_map.clone().unwrap_or_default(),
            label_nodata,
            image_nodata,
            device: self.backend,
        }
    }

    pub fn statistics_mode(&self) -> StatisticsMode {
        if self.approx_mean_std {
            StatisticsMode::Approximate
        } else {
            StatisticsMode::Exact
        }
    }

    pub fn statistics_params(&self, image_nodata: Option<f64>) -> StatisticsParams {
        StatisticsParams {
            window_size: self.window_size,
            image_nodata,
            seed: self.random_seed,
            ..Default::default()
        }
    }

    /// Check everything that can be checked before any raster is opened
    pub fn validate(&self) -> SegResult<()> {
        if self.weights.is_empty() {
            return Err(SegError::Config("At least one class weight is required".to_string()));
        }
        if self.window_size == 0 {
            return Err(SegError::Config("Window size must be positive".to_string()));
        }
        for (i, lr) in self.schedule().learning_rates.iter().enumerate() {
            if !lr.is_finite() || *lr <= 0.0 {
                return Err(SegError::Config(format!(
                    "Learning rate of phase {} must be positive, got {}",
                    i, lr
                )));
            }
        }
        self.band_spec()?;
        self.label_nodata()?;
        Ok(())
    }

    /// Text of the run record stored next to the models
    pub fn run_record(&self, identity: &str, argv: &[String]) -> SegResult<String> {
        let hyperparameters = serde_json::to_string_pretty(&self.hyperparameters())?;
        Ok(format!(
            "identity: {}\nrecorded: {}\nbackend: {}\nargv: {:?}\nhyperparameters: {}\n",
            identity,
            chrono::Utc::now().to_rfc3339(),
            self.backend,
            argv,
            hyperparameters
        ))
    }
}

/// Stand-alone evaluation of a stored model
#[derive(Parser, Debug, Clone)]
#[command(
    name = "geoseg-evaluate",
    about = "Evaluate a stored segmentation model on the held-out tiles of a raster pair"
)]
pub struct EvaluateArgs {
    /// Bucket holding the inputs, the model and the outputs
    #[arg(long)]
    pub bucket: String,

    /// Key of the imagery raster
    #[arg(long)]
    pub imagery: String,

    /// Key of the label raster
    #[arg(long)]
    pub labels: String,

    /// Key of the model snapshot
    #[arg(long)]
    pub model: String,

    /// Key the predictions array is stored under
    #[arg(long)]
    pub predictions_key: String,

    /// Key the ground truth array is stored under
    #[arg(long)]
    pub ground_truth_key: String,

    /// Key the text report is stored under
    #[arg(long)]
    pub report_key: Option<String>,

    /// Input channels, as for training
    #[arg(
        long,
        env = "TRAINING_BANDS",
        num_args = 1..,
        value_delimiter = ',',
        allow_negative_numbers = true,
        value_parser = parse_band,
        default_values_t = default_bands()
    )]
    pub bands: Vec<BandSelector>,

    /// Number of classes the model predicts
    #[arg(long)]
    pub classes: usize,

    #[arg(long, env = "LABEL_MAPPING", value_parser = parse_label_mapping)]
    pub label_map: Option<LabelMapping>,

    #[arg(long, env = "TRAINING_LABEL_ND", allow_negative_numbers = true)]
    pub label_nd: Option<ClassCode>,

    #[arg(long, env = "TRAINING_IMAGE_ND", allow_negative_numbers = true)]
    pub img_nd: Option<f64>,

    #[arg(long, default_value_t = 224)]
    pub window_size: usize,

    #[arg(long, default_value_t = usize::MAX)]
    pub max_eval_windows: usize,

    #[arg(long, value_enum, default_value_t = Backend::Cpu)]
    pub backend: Backend,

    #[arg(long)]
    pub approx_mean_std: bool,

    #[arg(long, default_value_t = 33)]
    pub random_seed: u64,

    #[arg(long, env = "GEOSEG_BLOB_ROOT", default_value = "./blobs")]
    pub blob_root: PathBuf,

    #[arg(long, env = "GEOSEG_WORK_DIR", default_value = "./work")]
    pub work_dir: PathBuf,
}

impl EvaluateArgs {
    pub fn band_spec(&self) -> SegResult<BandSpec> {
        BandSpec::new(self.bands.clone())
    }

    pub fn label_nodata(&self) -> SegResult<ClassCode> {
        if self.classes == 0 {
            return Err(SegError::Config("At least one class is required".to_string()));
        }
        resolve_label_nodata(self.label_nd, self.classes)
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            backend: self.backend,
            seed: self.random_seed,
            ..ModelConfig::new(self.bands.len(), self.classes)
        }
    }

    pub fn sampling_params(
        &self,
        label_nodata: ClassCode,
        image_nodata: Option<f64>,
    ) -> SamplingParams {
        SamplingParams {
            window_size: self.window_size,
            label_mapping: self.label_map.clone().unwrap_or_default(),
            label_nodata,
            image_nodata,
            device: self.backend,
        }
    }

    pub fn statistics_mode(&self) -> StatisticsMode {
        if self.approx_mean_std {
            StatisticsMode::Approximate
        } else {
            StatisticsMode::Exact
        }
    }

    pub fn statistics_params(&self, image_nodata: Option<f64>) -> StatisticsParams {
        StatisticsParams {
            window_size: self.window_size,
            image_nodata,
            seed: self.random_seed,
            ..Default::default()
        }
    }
}
