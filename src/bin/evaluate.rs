use clap::Parser;
use geoseg::config::EvaluateArgs;
use geoseg::pipeline::run_evaluation;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();

    let args = EvaluateArgs::parse();
    let outcome = run_evaluation(&args).map_err(|e| {
        log::error!("Evaluation failed: {}", e);
        e
    })?;

    log::info!("Evaluated {} windows", outcome.windows);
    for (class, f1) in outcome.f1_scores().iter().enumerate() {
        match f1 {
            Some(score) => println!("class {}: f1 {:.4}", class, score),
            None => println!("class {}: f1 undefined", class),
        }
    }
    Ok(())
}
