//! End-to-end drivers behind the two binaries

use crate::config::{EvaluateArgs, TrainingConfig};
use crate::core::batch::BatchAssembler;
use crate::core::evaluation::{
    EvaluationOutcome, EvaluationParams, Evaluator, EVALUATION_BATCH_SIZE,
};
use crate::core::loss::{CrossEntropy, SegmentationObjective};
use crate::core::model::{ModelFactory, SegmentationModel};
use crate::core::phases::{plan_resume, ResumePlan};
use crate::core::pixel_model::{PixelModel, PixelModelFactory};
use crate::core::statistics::StatisticsEstimator;
use crate::core::training::{
    effective_batch_size, steps_per_epoch, EpochReport, TrainingLoop, TrainingParams,
};
use crate::io::blob_store::{ArtifactKeys, BlobStore, BlobUrl, LocalBlobStore, RunStore};
use crate::io::raster::{RasterPair, RasterSource};
use crate::types::{NormalizationStats, SegResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Local name of the downloaded imagery raster
pub const IMAGERY_FILE: &str = "mul.tif";
/// Local name of the downloaded label raster
pub const LABELS_FILE: &str = "mask.tif";

/// What a training run did
#[derive(Debug)]
pub struct TrainingSummary {
    pub identity: String,
    pub resume: ResumePlan,
    pub stats: NormalizationStats,
    pub epochs: Vec<EpochReport>,
    pub evaluation: Option<EvaluationOutcome>,
}

/// Download `bucket/key` to `destination` unless a file is already there
pub fn fetch_if_absent(
    store: &dyn BlobStore,
    bucket: &str,
    key: &str,
    destination: &Path,
) -> SegResult<()> {
    if destination.is_file() {
        log::info!("Using existing {}", destination.display());
        return Ok(());
    }
    log::info!("Downloading {}/{} to {}", bucket, key, destination.display());
    store.get(bucket, key, destination)
}

/// Resolve an input location to a local file
///
/// Bucket URLs are fetched into `work_dir/local_name` once; anything else
/// is taken as a local path.
pub fn stage_input(
    store: &dyn BlobStore,
    location: &str,
    work_dir: &Path,
    local_name: &str,
) -> SegResult<PathBuf> {
    if !location.contains("://") {
        return Ok(PathBuf::from(location));
    }
    let url = BlobUrl::parse(location)?;
    let destination = work_dir.join(local_name);
    fetch_if_absent(store, &url.bucket, &url.key, &destination)?;
    Ok(destination)
}

/// Imagery nodata sentinel: the configured one, else what band 1 declares
pub fn resolve_image_nodata(configured: Option<f64>, pair: &RasterPair) -> SegResult<Option<f64>> {
    if configured.is_some() {
        return Ok(configured);
    }
    let declared = pair.imagery().nodata(1)?;
    if let Some(value) = declared {
        log::info!("Using nodata {} declared by {}", value, pair.imagery().describe());
    }
    Ok(declared)
}

fn open_store(root: &Path) -> SegResult<Arc<dyn BlobStore>> {
    Ok(Arc::new(LocalBlobStore::new(root)?))
}

/// Train (or resume) from the configuration, then evaluate
pub fn run_training(config: &TrainingConfig, argv: &[String]) -> SegResult<TrainingSummary> {
    config.validate()?;
    fs::create_dir_all(&config.work_dir)?;
    let store = open_store(&config.blob_root)?;

    let work_dir = &config.work_dir;
    let imagery = stage_input(store.as_ref(), &config.training_img, work_dir, IMAGERY_FILE)?;
    let labels = stage_input(store.as_ref(), &config.label_img, work_dir, LABELS_FILE)?;
    let pair = RasterPair::open(&imagery, &labels)?;

    train_on_pair(config, &pair, store, argv)
}

/// Training driver over an already opened raster pair
pub fn train_on_pair(
    config: &TrainingConfig,
    pair: &RasterPair,
    store: Arc<dyn BlobStore>,
    argv: &[String],
) -> SegResult<TrainingSummary> {
    let started = Instant::now();
    config.validate()?;

    let identity = config.checkpoint_identity()?;
    let keys = ArtifactKeys::new(&config.s3_prefix, &identity);
    log::info!("Run prefix {}/{}", config.s3_bucket, keys.run_prefix());
    let run = RunStore::new(store, &config.s3_bucket, keys, config.work_dir.join("scratch"))?;

    let record = run.scratch_file(".txt")?;
    fs::write(record.path(), config.run_record(&identity, argv)?)?;
    run.upload(record.path(), &run.keys().training_args())?;

    let image_nodata = resolve_image_nodata(config.img_nd, pair)?;
    let estimator = StatisticsEstimator::new(config.statistics_params(image_nodata));
    let stats = estimator.estimate(pair.imagery(), config.statistics_mode())?;
    stats.validate()?;
    log::info!("Means:               {:?}", stats.means());
    log::info!("Standard Deviations: {:?}", stats.stds());
    let stats = Arc::new(stats);

    let label_nodata = config.label_nodata()?;
    let batch_size = effective_batch_size(config.batch_size);
    let assembler = BatchAssembler::new(
        pair,
        Arc::new(config.band_spec()?),
        Arc::clone(&stats),
        config.sampling_params(label_nodata, image_nodata),
        batch_size.max(EVALUATION_BATCH_SIZE),
    )?;

    let resume = plan_resume(&run.list_run()?, config.start_from.as_deref());
    let factory = PixelModelFactory::default();
    let mut model = restore_or_build(&factory, &run, &resume, config)?;

    let epochs = if resume.state.is_done() {
        log::info!("Every phase of this run is already complete");
        Vec::new()
    } else {
        let objective =
            SegmentationObjective::new(CrossEntropy::new(config.weights.clone(), label_nodata)?);
        let params = TrainingParams {
            batch_size,
            steps_per_epoch: steps_per_epoch(
                pair.width(),
                pair.height(),
                config.window_size,
                batch_size,
                config.max_epoch_size,
            ),
            seed: config.random_seed,
            schedule: config.schedule(),
        };
        TrainingLoop::new(&assembler, objective, params, &run)?.run(&mut model, resume.state)?
    };

    let evaluation = if config.disable_eval {
        log::info!("Evaluation disabled");
        None
    } else {
        let params = EvaluationParams {
            max_windows: config.max_eval_windows,
            ..Default::default()
        };
        let outcome = Evaluator::new(&assembler, config.classes(), params).evaluate(&mut model)?;
        outcome.publish(&stats, &run)?;
        Some(outcome)
    };

    log::info!("Run finished in {:.1}s", started.elapsed().as_secs_f64());
    Ok(TrainingSummary {
        identity,
        resume,
        stats: stats.as_ref().clone(),
        epochs,
        evaluation,
    })
}

fn restore_or_build(
    factory: &PixelModelFactory,
    run: &RunStore,
    resume: &ResumePlan,
    config: &TrainingConfig,
) -> SegResult<PixelModel> {
    let model_config = config.model_config();
    match &resume.snapshot {
        Some(key) => {
            log::info!("Resuming at {} from {}", resume.state, key);
            let local = run.scratch_file(".pth")?;
            run.download(key, local.path())?;
            factory.load(local.path(), &model_config)
        }
        None => factory.build(&model_config),
    }
}

/// Evaluate a stored model on the held-out tiles and store the results
pub fn run_evaluation(args: &EvaluateArgs) -> SegResult<EvaluationOutcome> {
    fs::create_dir_all(&args.work_dir)?;
    let store = open_store(&args.blob_root)?;

    let imagery = args.work_dir.join(IMAGERY_FILE);
    let labels = args.work_dir.join(LABELS_FILE);
    fetch_if_absent(store.as_ref(), &args.bucket, &args.imagery, &imagery)?;
    fetch_if_absent(store.as_ref(), &args.bucket, &args.labels, &labels)?;
    let pair = RasterPair::open(&imagery, &labels)?;

    evaluate_on_pair(args, &pair, store.as_ref())
}

/// Evaluation driver over an already opened raster pair
pub fn evaluate_on_pair(
    args: &EvaluateArgs,
    pair: &RasterPair,
    store: &dyn BlobStore,
) -> SegResult<EvaluationOutcome> {
    let label_nodata = args.label_nodata()?;
    let bands = args.band_spec()?;

    let image_nodata = resolve_image_nodata(args.img_nd, pair)?;
    let estimator = StatisticsEstimator::new(args.statistics_params(image_nodata));
    let stats = estimator.estimate(pair.imagery(), args.statistics_mode())?;
    stats.validate()?;
    let stats = Arc::new(stats);

    let assembler = BatchAssembler::new(
        pair,
        Arc::new(bands),
        Arc::clone(&stats),
        args.sampling_params(label_nodata, image_nodata),
        EVALUATION_BATCH_SIZE,
    )?;

    let scratch = args.work_dir.join("scratch");
    fs::create_dir_all(&scratch)?;
    let snapshot = tempfile::Builder::new()
        .prefix("geoseg-")
        .suffix(".pth")
        .tempfile_in(&scratch)?;
    store.get(&args.bucket, &args.model, snapshot.path())?;
    let mut model = PixelModelFactory::default().load(snapshot.path(), &args.model_config())?;
    log::info!("Evaluating {} on {}", args.model, model.device());

    let params = EvaluationParams {
        max_windows: args.max_eval_windows,
        ..Default::default()
    };
    let outcome = Evaluator::new(&assembler, args.classes, params).evaluate(&mut model)?;

    let dir = tempfile::Builder::new()
        .prefix("geoseg-eval-")
        .tempdir_in(&scratch)?;
    outcome.write_artifacts(&stats, dir.path())?;
    store.put(&args.bucket, &args.predictions_key, &dir.path().join("predictions.npy"))?;
    store.put(&args.bucket, &args.ground_truth_key, &dir.path().join("ground_truth.npy"))?;
    if let Some(key) = &args.report_key {
        store.put(&args.bucket, key, &dir.path().join("evaluations.txt"))?;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::raster::MemoryRaster;
    use tempfile::TempDir;

    fn pair_with_nodata(nodata: Option<f64>) -> RasterPair {
        let imagery = MemoryRaster::constant("mul", 4, 4, &[1.0, 2.0]).unwrap();
        let imagery = match nodata {
            Some(value) => imagery.with_nodata(value),
            None => imagery,
        };
        let labels = MemoryRaster::constant("mask", 4, 4, &[0.0]).unwrap();
        RasterPair::new(Box::new(imagery), Box::new(labels)).unwrap()
    }

    #[test]
    fn test_image_nodata_resolution() {
        let declared = pair_with_nodata(Some(-9999.0));
        assert_eq!(resolve_image_nodata(None, &declared).unwrap(), Some(-9999.0));
        // an explicit value wins over the raster's own
        assert_eq!(resolve_image_nodata(Some(0.0), &declared).unwrap(), Some(0.0));

        let plain = pair_with_nodata(None);
        assert_eq!(resolve_image_nodata(None, &plain).unwrap(), None);
    }

    #[test]
    fn test_stage_input() {
        let temp = TempDir::new().unwrap();
        let store = LocalBlobStore::new(temp.path().join("blobs")).unwrap();
        let work = temp.path().join("work");

        // plain paths pass through untouched
        let local = stage_input(&store, "/data/mul.tif", &work, IMAGERY_FILE).unwrap();
        assert_eq!(local, PathBuf::from("/data/mul.tif"));

        let source = temp.path().join("upload.tif");
        fs::write(&source, b"raster").unwrap();
        store.put("imagery", "scene/mul.tif", &source).unwrap();

        let url = "s3://imagery/scene/mul.tif";
        let staged = stage_input(&store, url, &work, IMAGERY_FILE).unwrap();
        assert_eq!(staged, work.join(IMAGERY_FILE));
        assert_eq!(fs::read(&staged).unwrap(), b"raster");

        // an existing local copy is reused
        fs::write(&staged, b"cached").unwrap();
        stage_input(&store, "s3://imagery/scene/mul.tif", &work, IMAGERY_FILE).unwrap();
        assert_eq!(fs::read(&staged).unwrap(), b"cached");

        assert!(stage_input(&store, "s3://imagery/missing.tif", &work, LABELS_FILE).is_err());
    }
}
