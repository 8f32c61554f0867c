use clap::Parser;
use geoseg::config::TrainingConfig;
use geoseg::pipeline::run_training;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();

    let argv: Vec<String> = std::env::args().collect();
    let config = TrainingConfig::parse();
    log::debug!("{:?}", config);

    let summary = run_training(&config, &argv).map_err(|e| {
        log::error!("Training failed: {}", e);
        e
    })?;

    log::info!(
        "Run {} trained {} epochs from {}",
        summary.identity,
        summary.epochs.len(),
        summary.resume.state
    );
    if let Some(outcome) = &summary.evaluation {
        print!("{}", outcome.report(&summary.stats));
    }
    Ok(())
}
