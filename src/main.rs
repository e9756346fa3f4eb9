//! glacierflow CLI: run the orbit-correction chain over a batch of units

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use glacierflow::config::PipelineConfig;
use glacierflow::core::ChainDriver;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "glacierflow")]
#[command(
    author,
    version,
    about = "Orbit-corrected multi-source glacier velocity time series",
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML); defaults to the user config directory
    #[arg(short, long, env = "GLACIERFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Comma-separated units to process (all units found when omitted)
    #[arg(short, long, value_delimiter = ',')]
    glaciers: Vec<String>,

    /// First acquisition date, YYYYMMDD
    #[arg(long, value_parser = parse_date)]
    start_date: Option<NaiveDate>,

    /// Last acquisition date, YYYYMMDD
    #[arg(long, value_parser = parse_date)]
    end_date: Option<NaiveDate>,

    /// Output root directory
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Units processed in parallel
    #[arg(short, long)]
    workers: Option<usize>,

    /// Log level: error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_date(text: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(text, "%Y%m%d")
        .map_err(|e| format!("'{}' is not YYYYMMDD: {}", text, e))
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let path = cli.config.clone().or_else(|| PipelineConfig::default_path().filter(|p| p.exists()));
    let mut config = match path {
        Some(path) => PipelineConfig::from_toml_file(&path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => {
            log::info!("No configuration file, using defaults");
            PipelineConfig::default()
        }
    };

    if !cli.glaciers.is_empty() {
        config.glaciers = cli.glaciers.clone();
    }
    if let Some(date) = cli.start_date {
        config.start_date = date;
    }
    if let Some(date) = cli.end_date {
        config.end_date = date;
    }
    if let Some(dir) = &cli.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let config = load_config(&cli)?;
    log::info!(
        "glacierflow v{} | {} to {} | output {}",
        config.version,
        config.start_date,
        config.end_date,
        config.output_dir.display()
    );

    let start = Instant::now();
    let driver = ChainDriver::from_config(config);
    let batch = driver.run_batch().context("running batch")?;

    for report in &batch.units {
        println!(
            "{:<24} {:<20} steps={:<5} records={:<5} corrected={:<5} excluded={}",
            report.unit,
            report.state.to_string(),
            report.steps,
            report.records,
            report.corrected,
            report.excluded
        );
    }
    println!(
        "Finished in {:.1}s: {} delivered, {} partially delivered, {} failed",
        start.elapsed().as_secs_f64(),
        batch.delivered().len(),
        batch.partially_delivered().len(),
        batch.failed().len()
    );
    if !batch.failed().is_empty() || !batch.partially_delivered().is_empty() {
        println!("Failure log: {}", driver.failure_log().path().display());
    }

    std::process::exit(batch.exit_code());
}
