// ABOUTME: Entry point started by the sandbox bootstrap script
// ABOUTME: `run` executes the whole payload in batch, `serve` speaks the line protocol on stdio

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use osiris_core::constants::MANIFEST_FILE;
use osiris_core::{Manifest, StreamWriter};
use osiris_worker::{run_batch, ProxyWorker, WorkerConfig};
use std::io::BufReader;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "osiris-worker", version, about = "Osiris in-sandbox pipeline worker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute every step of the extracted payload
    Run {
        /// Directory holding manifest.json, run_config.json, and cfg/
        #[arg(long, default_value = ".")]
        payload_dir: PathBuf,
    },
    /// Read commands from stdin and write responses to stdout
    Serve {
        #[arg(long, default_value = ".")]
        payload_dir: PathBuf,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    match Cli::parse().command {
        Commands::Run { payload_dir } => {
            let (config, run_config) = WorkerConfig::load(&payload_dir)
                .with_context(|| format!("loading run config from {}", payload_dir.display()))?;
            let manifest = Manifest::from_path(payload_dir.join(MANIFEST_FILE))
                .with_context(|| format!("loading manifest from {}", payload_dir.display()))?;

            let mut worker = ProxyWorker::new(config, StreamWriter::stdout());
            let report = run_batch(&mut worker, &run_config.session_id, &manifest)?;
            info!(
                "Pipeline {} finished: {}/{} steps",
                run_config.pipeline_id, report.steps_completed, report.steps_total
            );
            if let Some(error) = &report.error {
                eprintln!("Pipeline failed: {}", error);
            }
            std::process::exit(report.exit_code());
        }
        Commands::Serve { payload_dir } => {
            let config = match WorkerConfig::load(&payload_dir) {
                Ok((config, _)) => config,
                Err(_) => WorkerConfig::new(&payload_dir),
            };
            let mut worker = ProxyWorker::new(config, StreamWriter::stdout());
            worker.serve(BufReader::new(std::io::stdin().lock()))?;
            Ok(())
        }
    }
}
