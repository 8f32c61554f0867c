use crate::core::batch::Batch;
use crate::core::model::{
    ModelConfig, ModelFactory, ModelMode, OutputGradient, Parameter, SegmentationModel,
    SegmentationOutput, TrainableScope,
};
use crate::types::{Backend, SegError, SegResult};
use ndarray::{Array2, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Fully-connected layer applied to every pixel independently
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PointwiseLayer {
    weight: Parameter,
    bias: Parameter,
}

impl PointwiseLayer {
    fn new<R: Rng>(name: &str, inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (inputs as f32).sqrt();
        let weight =
            Array2::from_shape_simple_fn((inputs, outputs), || rng.gen_range(-bound..bound));
        let bias = Array2::from_shape_simple_fn((1, outputs), || rng.gen_range(-bound..bound));
        Self {
            weight: Parameter::new(format!("{}::weight", name), weight),
            bias: Parameter::new(format!("{}::bias", name), bias),
        }
    }

    fn inputs(&self) -> usize {
        self.weight.value().nrows()
    }

    fn outputs(&self) -> usize {
        self.weight.value().ncols()
    }

    /// `x . W + b` for a (pixels x inputs) matrix
    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(self.weight.value()) + self.bias.value()
    }

    /// Accumulate parameter gradients and return the input gradient
    fn backward(&mut self, x: &Array2<f32>, grad_out: &Array2<f32>) -> SegResult<Array2<f32>> {
        self.weight.accumulate(&x.t().dot(grad_out))?;
        self.bias.accumulate(&grad_out.sum_axis(Axis(0)).insert_axis(Axis(0)))?;
        Ok(grad_out.dot(&self.weight.value().t()))
    }

    fn set_trainable(&mut self, trainable: bool) {
        self.weight.set_trainable(trainable);
        self.bias.set_trainable(trainable);
    }

    fn visit(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> SegResult<()>,
    ) -> SegResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)
    }
}

/// Activations kept from a training-mode forward pass
#[derive(Debug, Clone)]
struct ForwardCache {
    dims: (usize, usize, usize),
    input: Array2<f32>,
    adapter_pre: Array2<f32>,
    adapter: Array2<f32>,
    backbone_pre: Array2<f32>,
    backbone: Array2<f32>,
}

/// Saved form of a [`PixelModel`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PixelModelSnapshot {
    input_channels: usize,
    classes: usize,
    hidden: usize,
    adapter: PointwiseLayer,
    backbone: PointwiseLayer,
    head: PointwiseLayer,
    aux_head: PointwiseLayer,
}

/// Small per-pixel network with the layout of a transfer-learning segmenter
///
/// An input adapter maps the configured channels into the hidden width, a
/// backbone layer follows, and two classifier heads produce the primary and
/// auxiliary class scores. Every layer is pointwise, so the spatial
/// settings of [`ModelConfig`] do not apply.
#[derive(Debug, Clone)]
pub struct PixelModel {
    adapter: PointwiseLayer,
    backbone: PointwiseLayer,
    head: PointwiseLayer,
    aux_head: PointwiseLayer,
    mode: ModelMode,
    cache: Option<ForwardCache>,
}

impl PixelModel {
    pub fn new(input_channels: usize, classes: usize, hidden: usize, seed: u64) -> SegResult<Self> {
        if input_channels == 0 || classes == 0 || hidden == 0 {
            return Err(SegError::Model(format!(
                "Invalid model size: {} channels, {} classes, hidden width {}",
                input_channels, classes, hidden
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        Ok(Self {
            adapter: PointwiseLayer::new("adapter", input_channels, hidden, &mut rng),
            backbone: PointwiseLayer::new("backbone", hidden, hidden, &mut rng),
            head: PointwiseLayer::new("head", hidden, classes, &mut rng),
            aux_head: PointwiseLayer::new("aux_head", hidden, classes, &mut rng),
            mode: ModelMode::Train,
            cache: None,
        })
    }

    pub fn input_channels(&self) -> usize {
        self.adapter.inputs()
    }

    pub fn classes(&self) -> usize {
        self.head.outputs()
    }

    pub fn load(path: &Path) -> SegResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        let snapshot: PixelModelSnapshot = serde_json::from_reader(reader)?;

        let mut model = Self {
            adapter: snapshot.adapter,
            backbone: snapshot.backbone,
            head: snapshot.head,
            aux_head: snapshot.aux_head,
            mode: ModelMode::Train,
            cache: None,
        };
        if model.input_channels() != snapshot.input_channels
            || model.classes() != snapshot.classes
            || model.backbone.inputs() != snapshot.hidden
        {
            return Err(SegError::Model(format!(
                "Snapshot {} is inconsistent with its recorded sizes",
                path.display()
            )));
        }
        model.zero_grad()?;
        Ok(model)
    }

    /// Flatten a (batch, channel, rows, cols) array into (pixels, channels)
    fn to_pixels(images: &Array4<f32>) -> SegResult<Array2<f32>> {
        let (batch, channels, rows, cols) = images.dim();
        images
            .view()
            .permuted_axes([0, 2, 3, 1])
            .as_standard_layout()
            .into_owned()
            .into_shape((batch * rows * cols, channels))
            .map_err(|e| SegError::Model(format!("Failed to flatten batch: {}", e)))
    }

    fn from_pixels(pixels: Array2<f32>, dims: (usize, usize, usize)) -> SegResult<Array4<f32>> {
        let (batch, rows, cols) = dims;
        let channels = pixels.ncols();
        let scores = pixels
            .into_shape((batch, rows, cols, channels))
            .map_err(|e| SegError::Model(format!("Failed to restore batch layout: {}", e)))?;
        Ok(scores.permuted_axes([0, 3, 1, 2]).as_standard_layout().into_owned())
    }

    fn relu(x: &Array2<f32>) -> Array2<f32> {
        x.mapv(|v| v.max(0.0))
    }

    fn relu_backward(mut grad: Array2<f32>, pre: &Array2<f32>) -> Array2<f32> {
        ndarray::Zip::from(&mut grad).and(pre).for_each(|g, &p| {
            if p <= 0.0 {
                *g = 0.0;
            }
        });
        grad
    }
}

impl SegmentationModel for PixelModel {
    fn device(&self) -> Backend {
        Backend::Cpu
    }

    fn mode(&self) -> ModelMode {
        self.mode
    }

    fn set_mode(&mut self, mode: ModelMode) {
        self.mode = mode;
        if mode == ModelMode::Eval {
            self.cache = None;
        }
    }

    fn set_trainable(&mut self, scope: TrainableScope) {
        self.adapter.set_trainable(true);
        self.head.set_trainable(true);
        self.aux_head.set_trainable(true);
        self.backbone.set_trainable(scope == TrainableScope::All);
    }

    fn forward(&mut self, batch: &Batch) -> SegResult<SegmentationOutput> {
        self.check_device(batch)?;
        let (b, channels, rows, cols) = batch.images.dim();
        if channels != self.input_channels() {
            return Err(SegError::Model(format!(
                "Batch has {} channels, model expects {}",
                channels,
                self.input_channels()
            )));
        }

        let input = Self::to_pixels(&batch.images)?;
        let adapter_pre = self.adapter.forward(&input);
        let adapter = Self::relu(&adapter_pre);
        let backbone_pre = self.backbone.forward(&adapter);
        let backbone = Self::relu(&backbone_pre);

        let dims = (b, rows, cols);
        let out = Self::from_pixels(self.head.forward(&backbone), dims)?;
        let aux = Self::from_pixels(self.aux_head.forward(&adapter), dims)?;

        self.cache = match self.mode {
            ModelMode::Train => Some(ForwardCache {
                dims,
                input,
                adapter_pre,
                adapter,
                backbone_pre,
                backbone,
            }),
            ModelMode::Eval => None,
        };

        Ok(SegmentationOutput {
            out,
            aux: Some(aux),
        })
    }

    fn backward(&mut self, grad: &OutputGradient) -> SegResult<()> {
        let cache = self.cache.take().ok_or_else(|| {
            SegError::Model("backward called without a training-mode forward pass".to_string())
        })?;
        let (b, rows, cols) = cache.dims;
        if grad.out.dim() != (b, self.classes(), rows, cols) {
            return Err(SegError::Model(format!(
                "Output gradient shape {:?} does not match the last forward pass",
                grad.out.dim()
            )));
        }

        let grad_out = Self::to_pixels(&grad.out)?;
        let grad_backbone = self.head.backward(&cache.backbone, &grad_out)?;
        let grad_backbone_pre = Self::relu_backward(grad_backbone, &cache.backbone_pre);
        let mut grad_adapter = self.backbone.backward(&cache.adapter, &grad_backbone_pre)?;

        if let Some(aux) = &grad.aux {
            let grad_aux = Self::to_pixels(aux)?;
            grad_adapter += &self.aux_head.backward(&cache.adapter, &grad_aux)?;
        }

        let grad_adapter_pre = Self::relu_backward(grad_adapter, &cache.adapter_pre);
        self.adapter.backward(&cache.input, &grad_adapter_pre)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> SegResult<()>,
    ) -> SegResult<()> {
        self.adapter.visit(visitor)?;
        self.backbone.visit(visitor)?;
        self.head.visit(visitor)?;
        self.aux_head.visit(visitor)
    }

    fn save(&self, path: &Path) -> SegResult<()> {
        let snapshot = PixelModelSnapshot {
            input_channels: self.input_channels(),
            classes: self.classes(),
            hidden: self.backbone.inputs(),
            adapter: self.adapter.clone(),
            backbone: self.backbone.clone(),
            head: self.head.clone(),
            aux_head: self.aux_head.clone(),
        };
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, &snapshot)?;
        log::debug!("Saved model to {}", path.display());
        Ok(())
    }
}

/// Factory for [`PixelModel`]
#[derive(Debug, Clone)]
pub struct PixelModelFactory {
    pub hidden: usize,
}

impl Default for PixelModelFactory {
    fn default() -> Self {
        Self { hidden: 16 }
    }
}

impl PixelModelFactory {
    fn check_config(config: &ModelConfig) -> SegResult<()> {
        if config.backend != Backend::Cpu {
            return Err(SegError::Model(format!(
                "The pointwise model runs on the cpu backend only, not {}",
                config.backend
            )));
        }
        Ok(())
    }
}

impl ModelFactory for PixelModelFactory {
    type Model = PixelModel;

    fn build(&self, config: &ModelConfig) -> SegResult<PixelModel> {
        Self::check_config(config)?;
        log::info!(
            "Building pointwise model: {} channels, {} classes, hidden width {}",
            config.input_channels,
            config.classes,
            self.hidden
        );
        PixelModel::new(config.input_channels, config.classes, self.hidden, config.seed)
    }

    fn load(&self, path: &Path, config: &ModelConfig) -> SegResult<PixelModel> {
        Self::check_config(config)?;
        let model = PixelModel::load(path)?;
        if model.input_channels() != config.input_channels || model.classes() != config.classes {
            return Err(SegError::Model(format!(
                "Model {} has {} channels and {} classes, configuration needs {} and {}",
                path.display(),
                model.input_channels(),
                model.classes(),
                config.input_channels,
                config.classes
            )));
        }
        log::info!("Loaded model from {}", path.display());
        Ok(model)
    }
}
