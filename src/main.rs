//! Headless service entry point.
//!
//! Opens the project named by `-c`, starts the storage SCP and runs until
//! interrupted. Exit codes: 0 clean shutdown, 2 configuration error,
//! 3 bind failure, 4 storage error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dicom_anonymizer::config::ProjectModel;
use dicom_anonymizer::{AnonymizerController, Error};

const EXIT_CONFIG: u8 = 2;
const EXIT_BIND: u8 = 3;
const EXIT_STORAGE: u8 = 4;

/// DICOM de-identification service.
#[derive(Debug, Parser)]
#[command(name = "dicom-anonymizer", version)]
struct Cli {
    /// Path to the project configuration (ProjectModel.json)
    #[arg(short = 'c', long = "config")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ProjectModel::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // RUST_LOG overrides the project's configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(filter)
            .finish(),
    );

    let mut controller = match AnonymizerController::open(config) {
        Ok(controller) => controller,
        Err(e @ Error::Config { .. }) => {
            error!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_STORAGE);
        }
    };

    if let Err(e) = controller.start_scp().await {
        error!("cannot start SCP: {e}");
        return ExitCode::from(EXIT_BIND);
    }
    let totals = controller.totals().await;
    info!(
        "project {} open: {} patients, {} studies, {} series, {} instances",
        controller.config().project_name,
        totals.patients,
        totals.studies,
        totals.series,
        totals.instances
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for shutdown signal: {e}");
    }
    info!("shutdown requested");

    match controller.shutdown().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("shutdown failed: {e}");
            ExitCode::from(EXIT_STORAGE)
        }
    }
}
