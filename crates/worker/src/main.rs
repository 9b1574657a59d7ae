//! FilingForge Worker
//!
//! Operator CLI over the same store and pipeline the gateway uses:
//! 1. Imports filing documents from JSONL
//! 2. Runs a generation job to completion in-process
//! 3. Prints job status and token usage
//! 4. Resumes jobs a stopped process left unfinished

mod commands;
mod importer;

use anyhow::Context;
use clap::Parser;
use filingforge_common::{
    config::AppConfig, llm::create_completion_client, open_store, AppError, VERSION,
};
use filingforge_pipeline::{ConfigRegistry, Orchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::commands::{Cli, CommandRunner};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("line {line}: {message}")]
    InvalidRecord { line: usize, message: String },

    #[error("cannot open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    App(#[from] AppError),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = AppConfig::load().context("failed to load configuration")?;

    // Logs go to stderr so command output stays clean on stdout
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if config.observability.json_logging {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting FilingForge Worker v{}", VERSION);

    let store = open_store(&config).await?;
    let mut registry = ConfigRegistry::with_defaults()?;
    if let Some(path) = &config.registry.path {
        registry.load_overrides(path)?;
    }
    let client = create_completion_client(&config.completion)?;
    let orchestrator = Orchestrator::from_config(store, client, Arc::new(registry), &config.pipeline);

    let runner = CommandRunner::new(orchestrator);
    match runner.execute(cli.command).await {
        Ok(outcome) => {
            println!("{}", outcome.render());
            let code = outcome.exit_code();
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
