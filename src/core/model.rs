use crate::core::batch::Batch;
use crate::types::{Backend, SegError, SegResult};
use ndarray::{Array2, Array4};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Momentum of every optimizer the training loop creates
pub const SGD_MOMENTUM: f32 = 0.9;

/// Per-pixel class scores, batch x class x rows x cols
#[derive(Debug, Clone)]
pub struct SegmentationOutput {
    pub out: Array4<f32>,
    /// Auxiliary head scores, same layout as `out`
    pub aux: Option<Array4<f32>>,
}

/// Loss gradient with respect to each output head
#[derive(Debug, Clone)]
pub struct OutputGradient {
    pub out: Array4<f32>,
    pub aux: Option<Array4<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    Train,
    Eval,
}

/// Which parameter groups receive updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainableScope {
    /// Input adapter and both classifier heads; the backbone is frozen
    AdapterAndHeads,
    All,
}

/// Trainable tensor with its gradient accumulator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    value: Array2<f32>,
    #[serde(skip)]
    grad: Array2<f32>,
    #[serde(skip, default = "trainable_default")]
    trainable: bool,
}

fn trainable_default() -> bool {
    true
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Array2<f32>) -> Self {
        let grad = Array2::zeros(value.dim());
        Self {
            name: name.into(),
            value,
            grad,
            trainable: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Array2<f32> {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Array2<f32> {
        &mut self.value
    }

    pub fn grad(&self) -> &Array2<f32> {
        &self.grad
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    /// Add to the gradient accumulator; frozen parameters ignore it
    pub fn accumulate(&mut self, grad: &Array2<f32>) -> SegResult<()> {
        if grad.dim() != self.value.dim() {
            return Err(SegError::Model(format!(
                "Gradient shape {:?} does not match parameter {} {:?}",
                grad.dim(),
                self.name,
                self.value.dim()
            )));
        }
        if self.trainable {
            if self.grad.dim() != self.value.dim() {
                self.grad = Array2::zeros(self.value.dim());
            }
            self.grad += grad;
        }
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        if self.grad.dim() == self.value.dim() {
            self.grad.fill(0.0);
        } else {
            self.grad = Array2::zeros(self.value.dim());
        }
    }
}

/// Settings a model factory builds a network from
///
/// The kernel, stride and dilation settings describe the replaced input
/// convolution and output classifier. Factories whose layers have no
/// spatial extent ignore them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub input_channels: usize,
    pub classes: usize,
    pub input_kernel_size: usize,
    pub input_stride: usize,
    pub input_dilation: usize,
    pub output_kernel_size: usize,
    pub output_stride: usize,
    pub output_dilation: usize,
    pub backend: Backend,
    pub seed: u64,
}

impl ModelConfig {
    pub fn new(input_channels: usize, classes: usize) -> Self {
        Self {
            input_channels,
            classes,
            input_kernel_size: 7,
            input_stride: 2,
            input_dilation: 1,
            output_kernel_size: 1,
            output_stride: 1,
            output_dilation: 1,
            backend: Backend::Cpu,
            seed: 33,
        }
    }
}

/// A segmentation network the training and evaluation drivers can run
pub trait SegmentationModel: Send {
    /// Backend the model lives on; batches tagged otherwise are rejected
    fn device(&self) -> Backend;

    fn mode(&self) -> ModelMode;

    fn set_mode(&mut self, mode: ModelMode);

    fn set_trainable(&mut self, scope: TrainableScope);

    fn forward(&mut self, batch: &Batch) -> SegResult<SegmentationOutput>;

    /// Accumulate parameter gradients for the last training-mode forward
    fn backward(&mut self, grad: &OutputGradient) -> SegResult<()>;

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> SegResult<()>,
    ) -> SegResult<()>;

    fn zero_grad(&mut self) -> SegResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_grad();
            Ok(())
        })
    }

    fn save(&self, path: &Path) -> SegResult<()>;

    /// Reject a batch prepared for another backend
    fn check_device(&self, batch: &Batch) -> SegResult<()> {
        if batch.device != self.device() {
            return Err(SegError::Model(format!(
                "Batch prepared for {} but the model runs on {}",
                batch.device,
                self.device()
            )));
        }
        Ok(())
    }
}

/// Builds fresh models and restores saved ones
pub trait ModelFactory {
    type Model: SegmentationModel;

    fn build(&self, config: &ModelConfig) -> SegResult<Self::Model>;

    fn load(&self, path: &Path, config: &ModelConfig) -> SegResult<Self::Model>;
}

/// Stochastic gradient descent with momentum
///
/// `v = momentum * v + grad; value -= lr * v`, velocities keyed by
/// parameter name. Frozen parameters are skipped.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    velocities: HashMap<String, Array2<f32>>,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self::with_momentum(lr, SGD_MOMENTUM)
    }

    pub fn with_momentum(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            velocities: HashMap::new(),
        }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn step<M: SegmentationModel + ?Sized>(&mut self, model: &mut M) -> SegResult<()> {
        let lr = self.lr;
        let momentum = self.momentum;
        let velocities = &mut self.velocities;

        model.visit_parameters_mut(&mut |param| {
            if !param.is_trainable() {
                return Ok(());
            }
            let grad = param.grad().clone();
            let velocity = velocities
                .entry(param.name().to_string())
                .or_insert_with(|| Array2::zeros(grad.dim()));
            if velocity.dim() != grad.dim() {
                return Err(SegError::Model(format!(
                    "Parameter {} changed shape between steps",
                    param.name()
                )));
            }
            velocity.mapv_inplace(|v| v * momentum);
            *velocity += &grad;
            param.value_mut().scaled_add(-lr, &*velocity);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_frozen_parameter_ignores_gradients() {
        let mut param = Parameter::new("w", array![[1.0, 2.0]]);
        param.set_trainable(false);
        param.accumulate(&array![[1.0, 1.0]]).unwrap();
        assert!(param.grad().iter().all(|&g| g == 0.0));

        assert!(param.accumulate(&array![[1.0], [1.0]]).is_err());
    }

    #[test]
    fn test_parameter_snapshot_round_trip() {
        let mut param = Parameter::new("head::weight", array![[0.5, -1.5]]);
        param.accumulate(&array![[1.0, 1.0]]).unwrap();
        let json = serde_json::to_string(&param).unwrap();
        let mut restored: Parameter = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.name(), "head::weight");
        assert_eq!(restored.value(), param.value());
        assert!(restored.is_trainable());
        restored.zero_grad();
        assert_eq!(restored.grad().dim(), (1, 2));
        assert_relative_eq!(restored.value()[[0, 1]], -1.5);
    }
}
