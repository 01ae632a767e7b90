mod cli;
mod config;
mod controller;
mod detector;
mod fetch;
mod identity;
mod logging;
mod metrics;
mod pacing;
mod recovery;
mod scheduler;
mod session;
mod store;
mod util;

use clap::Parser;
use cli::{Cli, Commands};
use config::{ControllerConfig, Defaults};
use controller::{setup_shutdown_handler, ChangeDetectSink, Controller};
use fetch::HttpFetcher;
use std::sync::Arc;
use store::{ControllerStore, RecoveryStateRecord};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MainError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Controller error: {0}")]
    Controller(String),
}

impl From<Box<dyn std::error::Error>> for MainError {
    fn from(err: Box<dyn std::error::Error>) -> Self {
        MainError::Controller(err.to_string())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            data_dir,
            workers,
        } => run_command(&config, &data_dir, workers).await,
        Commands::ResetSuspended { target, data_dir } => reset_suspended_command(&target, &data_dir),
        Commands::ForceSchedule { target, data_dir } => force_schedule_command(&target, &data_dir),
        Commands::Status { config, data_dir } => status_command(&config, &data_dir),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        let code = match e {
            MainError::Config(_) => 2,
            _ => 3,
        };
        std::process::exit(code);
    }
}

async fn run_command(
    config_path: &str,
    data_dir: &str,
    workers: Option<usize>,
) -> Result<(), MainError> {
    logging::init_logging_in_data_dir(data_dir)?;

    let mut config = ControllerConfig::load(config_path)?;
    if let Some(workers) = workers {
        config.workers = workers;
    }

    tracing::info!(
        config = config_path,
        data_dir,
        targets = config.targets.len(),
        workers = config.workers,
        "Starting controller"
    );

    let fetcher = Arc::new(HttpFetcher::new(Defaults::FETCH_TIMEOUT_SECS));
    let sink = Arc::new(ChangeDetectSink::new());
    let controller = Arc::new(Controller::new(config, data_dir, fetcher, sink)?);

    let shutdown = setup_shutdown_handler();
    controller.run(shutdown).await;
    Ok(())
}

/// Operator override: flip a persisted suspension back to healthy. Applies
/// on the next controller start (or immediately through the in-process
/// boundary call when embedded as a library).
fn reset_suspended_command(target: &str, data_dir: &str) -> Result<(), MainError> {
    let store = ControllerStore::new(data_dir)?;

    match store.load_recovery(target)? {
        Some(mut record) => {
            if !matches!(record.state, RecoveryStateRecord::Suspended { .. }) {
                println!("{} is not suspended (state: {:?})", target, record.state);
                return Ok(());
            }
            record.state = RecoveryStateRecord::Healthy;
            record.consecutive_failures = 0;
            record.consecutive_empty = 0;
            store.save_recovery(target, &record)?;
            println!("{} reset to healthy", target);
            Ok(())
        }
        None => {
            println!("{} has no persisted recovery state", target);
            Ok(())
        }
    }
}

/// Operator override: clear the persisted min-interval stamp so the target
/// is due as soon as the controller considers it.
fn force_schedule_command(target: &str, data_dir: &str) -> Result<(), MainError> {
    let store = ControllerStore::new(data_dir)?;

    match store.load_schedule(target)? {
        Some(mut record) => {
            record.last_fetch_secs = 0;
            store.save_schedule(target, &record)?;
            println!("{} will be fetched at the next opportunity", target);
            Ok(())
        }
        None => {
            println!("{} has no persisted schedule state", target);
            Ok(())
        }
    }
}

fn status_command(config_path: &str, data_dir: &str) -> Result<(), MainError> {
    let config = ControllerConfig::load(config_path)?;
    let fetcher = Arc::new(HttpFetcher::new(Defaults::FETCH_TIMEOUT_SECS));
    let sink = Arc::new(ChangeDetectSink::new());
    let controller = Controller::new(config, data_dir, fetcher, sink)?;

    print!("{}", controller.status_report()?);
    Ok(())
}
