//! Sampling, statistics, model and training-loop modules

pub mod partition;
pub mod statistics;
pub mod batch;
pub mod model;
pub mod loss;
pub mod pixel_model;
pub mod phases;
pub mod training;
pub mod evaluation;

// Re-export main types
pub use partition::{
    enumerate_evaluation_tiles, partition, TileGrid, TrainableSampler, EVALUATION_MODULUS,
};
pub use statistics::{StatisticsEstimator, StatisticsMode, StatisticsParams};
pub use batch::{Batch, BatchAssembler, SamplingParams, MAX_READ_WORKERS};
pub use model::{
    ModelConfig, ModelFactory, ModelMode, OutputGradient, Parameter, SegmentationModel,
    SegmentationOutput, Sgd, TrainableScope,
};
pub use loss::{CrossEntropy, SegmentationObjective, AUX_LOSS_WEIGHT};
pub use pixel_model::{PixelModel, PixelModelFactory};
pub use phases::{plan_resume, PhaseSchedule, PhaseSpec, PhaseState, ResumePlan};
pub use training::{steps_per_epoch, EpochReport, TrainingLoop, TrainingParams};
pub use evaluation::{
    argmax_classes, ConfusionCounts, EvaluationOutcome, EvaluationParams, Evaluator,
};
