use crate::core::batch::BatchAssembler;
use crate::core::loss::SegmentationObjective;
use crate::core::model::{ModelMode, SegmentationModel, Sgd};
use crate::core::partition::{TileGrid, TrainableSampler, EVALUATION_MODULUS};
use crate::core::phases::{is_checkpoint_epoch, PhaseSchedule, PhaseSpec, PhaseState, FINAL_PHASE};
use crate::io::blob_store::RunStore;
use crate::types::{SegError, SegResult};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};

/// Smallest batch the loop will run with
pub const MIN_BATCH_SIZE: usize = 2;

/// Batches per epoch: enough to visit the trainable share of the raster
/// once, capped at `max_epoch_size` and never below one
pub fn steps_per_epoch(
    width: usize,
    height: usize,
    window_size: usize,
    batch_size: usize,
    max_epoch_size: usize,
) -> usize {
    let trainable = (EVALUATION_MODULUS - 1) as f64;
    let tiles = (width as f64 * height as f64 * trainable)
        / ((window_size * window_size) as f64 * EVALUATION_MODULUS as f64 * batch_size as f64);
    (tiles as usize).min(max_epoch_size).max(1)
}

/// Raise a batch size below [`MIN_BATCH_SIZE`], with a warning
pub fn effective_batch_size(requested: usize) -> usize {
    if requested < MIN_BATCH_SIZE {
        log::warn!(
            "Batch size must be at least {}, using {} instead of {}",
            MIN_BATCH_SIZE,
            MIN_BATCH_SIZE,
            requested
        );
        MIN_BATCH_SIZE
    } else {
        requested
    }
}

/// Training loop parameters
#[derive(Debug, Clone)]
pub struct TrainingParams {
    pub batch_size: usize,
    pub steps_per_epoch: usize,
    pub seed: u64,
    pub schedule: PhaseSchedule,
}

/// Outcome of one epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub phase: usize,
    pub epoch: usize,
    pub mean_loss: f64,
    pub elapsed: Duration,
}

/// Save a model to a scratch file and upload it under `key`
pub fn upload_model<M: SegmentationModel + ?Sized>(
    model: &M,
    run: &RunStore,
    key: &str,
) -> SegResult<()> {
    let scratch = run.scratch_file(".pth")?;
    model.save(scratch.path())?;
    run.upload(scratch.path(), key)
}

/// Drives the staged transfer-learning schedule
pub struct TrainingLoop<'a> {
    assembler: &'a BatchAssembler<'a>,
    sampler: TrainableSampler,
    objective: SegmentationObjective,
    params: TrainingParams,
    run: &'a RunStore,
}

impl<'a> TrainingLoop<'a> {
    pub fn new(
        assembler: &'a BatchAssembler<'a>,
        objective: SegmentationObjective,
        params: TrainingParams,
        run: &'a RunStore,
    ) -> SegResult<Self> {
        if params.batch_size < MIN_BATCH_SIZE {
            return Err(SegError::Config(format!(
                "Batch size {} is below the minimum of {}",
                params.batch_size, MIN_BATCH_SIZE
            )));
        }
        let pair = assembler.pair();
        let grid = TileGrid::from_dimensions(
            pair.width(),
            pair.height(),
            assembler.params().window_size,
        )?;
        let sampler = TrainableSampler::new(grid)?;

        log::info!(
            "Training on {} trainable tiles, batch size {}, {} steps per epoch",
            grid.trainable_count(),
            params.batch_size,
            params.steps_per_epoch
        );

        Ok(Self {
            assembler,
            sampler,
            objective,
            params,
            run,
        })
    }

    /// Run every phase from `start` on, uploading each phase boundary
    pub fn run<M: SegmentationModel>(
        &self,
        model: &mut M,
        start: PhaseState,
    ) -> SegResult<Vec<EpochReport>> {
        let keys = self.run.keys();
        let mut reports = Vec::new();
        let mut state = start;

        while let Some(spec) = state.spec(&self.params.schedule) {
            log::info!("Training {}", state);
            reports.extend(self.run_phase(model, &spec)?);

            upload_model(&*model, self.run, &keys.phase(spec.phase))?;
            if spec.phase == FINAL_PHASE {
                upload_model(&*model, self.run, &keys.final_model())?;
            }
            state = state.next();
        }

        log::info!("Training complete");
        Ok(reports)
    }

    /// One phase: fresh optimizer, reseeded sampler, `epochs - start_epoch` epochs
    pub fn run_phase<M: SegmentationModel>(
        &self,
        model: &mut M,
        spec: &PhaseSpec,
    ) -> SegResult<Vec<EpochReport>> {
        model.set_trainable(spec.scope);
        model.set_mode(ModelMode::Train);

        let mut optimizer = Sgd::new(spec.learning_rate);
        let mut rng = StdRng::seed_from_u64(self.params.seed.wrapping_add(spec.seed_offset));
        let steps = self.params.steps_per_epoch.max(1);
        let mut reports = Vec::new();

        log::debug!(
            "Phase {}: lr {}, epochs {}..{}, scope {:?}",
            spec.phase,
            spec.learning_rate,
            spec.start_epoch,
            spec.epochs,
            spec.scope
        );

        for epoch in spec.start_epoch..spec.epochs {
            let started = Instant::now();
            let mut total_loss = 0.0;

            for _ in 0..steps {
                let tiles = self.sampler.sample_batch(&mut rng, self.params.batch_size);
                let batch = self.assembler.assemble(&tiles)?;

                model.zero_grad()?;
                let output = model.forward(&batch)?;
                let value = self.objective.evaluate(&output, &batch.labels)?;
                model.backward(&value.grad)?;
                optimizer.step(model)?;

                total_loss += value.loss;
            }

            let report = EpochReport {
                phase: spec.phase,
                epoch,
                mean_loss: total_loss / steps as f64,
                elapsed: started.elapsed(),
            };
            log::info!(
                "epoch={} time={:.3}s avg_loss={:.6}",
                report.epoch,
                report.elapsed.as_secs_f64(),
                report.mean_loss
            );

            if spec.checkpoints && is_checkpoint_epoch(epoch) {
                upload_model(&*model, self.run, &self.run.keys().checkpoint(epoch))?;
            }
            reports.push(report);
        }

        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_per_epoch() {
        // 4480 x 4480 at 224: 400 tiles, 6/7 trainable, batch 16
        assert_eq!(steps_per_epoch(4480, 4480, 224, 16, usize::MAX), 21);
        assert_eq!(steps_per_epoch(4480, 4480, 224, 16, 5), 5);
        // tiny rasters still get one step
        assert_eq!(steps_per_epoch(448, 448, 224, 16, usize::MAX), 1);
    }

    #[test]
    fn test_batch_size_floor() {
        assert_eq!(effective_batch_size(0), 2);
        assert_eq!(effective_batch_size(1), 2);
        assert_eq!(effective_batch_size(16), 16);
    }
}
