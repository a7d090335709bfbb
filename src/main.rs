use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::sync::Arc;
use time::macros::format_description;

use opa_scraper::config::DEFAULT_BASE_URL;
use opa_scraper::{load_identifiers, FieldSchema, HttpSource, Pipeline, PipelineConfig};

#[derive(Parser, Clone)]
#[command(name = "OPA Scraper")]
#[command(about = "Fetches OPA property records by account number and flattens them into CSV tables.")]
#[command(version = "1.0.0")]
struct Cli {
    #[arg(short, long, help = "Source JSON file containing an array of OPA account numbers", required = true)]
    file: PathBuf,
    #[arg(short, long, default_value = "1", help = "Number of concurrent fetch workers (0 for auto)")]
    concurrent: usize,
    #[arg(long, default_value = DEFAULT_BASE_URL, help = "Base URL of the account endpoint")]
    base_url: String,
    #[arg(short, long, default_value = ".", help = "Output directory for opa.csv and opa-val.csv")]
    output: PathBuf,
    #[arg(long, help = "Directory for raw <id>.json responses (default: fresh opa-downloads-* under the output directory)")]
    download_dir: Option<PathBuf>,
    #[arg(long, help = "YAML file overriding the per-section field lists")]
    schema: Option<PathBuf>,
    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
    #[arg(long, help = "Disable the progress bar")]
    no_progress: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => { eprintln!("Invalid log level '{}', defaulting to INFO.", cli.log_level); LevelFilter::Info }
    };
    SimpleLogger::new()
        .with_level(log_level)
        .with_timestamp_format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .init()?;

    info!("Starting OPA Scraper");

    let ids = load_identifiers(&cli.file)?;
    info!("Loaded {} identifiers from {}", ids.len(), cli.file.display());

    let workers = if cli.concurrent == 0 {
        let cores = num_cpus::get();
        info!("Auto-detected {} CPU cores. Using {} workers.", cores, cores);
        cores
    } else {
        cli.concurrent
    };

    let schema = match &cli.schema {
        Some(path) => {
            info!("Loading field schema from: {}", path.display());
            FieldSchema::from_yaml_file(path)?
        }
        None => FieldSchema::default(),
    };

    let mut config = PipelineConfig::new(&cli.output)
        .with_base_url(&cli.base_url)
        .with_workers(workers)
        .with_schema(schema);
    if let Some(dir) = &cli.download_dir {
        config = config.with_download_dir(dir);
    }

    let progress_bar = if cli.no_progress {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(ids.len() as u64);
        bar.set_style(ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta} @ {per_sec}) {msg}")
            .context("Failed to create progress bar template")?
            .progress_chars("=> "));
        bar
    };

    let source = Arc::new(HttpSource::new(config.base_url.clone()));
    let pipeline = Pipeline::new(config, source).with_progress(progress_bar);
    let summary = pipeline.run(&ids)?;
    summary.log();

    info!("Scrape finished. {} identifiers produced no row.", summary.dropped());
    Ok(())
}
