//! CLI entry point for Loopcast
//!
//! Parses command line arguments, loads configuration, and runs the stream
//! supervisor until it halts.

use clap::Parser;
use loopcast::selector::{RandomSource, Selector};
use loopcast::{run_startup_checks, Config, FfmpegEncoder, Supervisor};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Loopcast - Supervised 24/7 media broadcast daemon
#[derive(Parser, Debug)]
#[command(name = "loopcast")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (ffmpeg, library directory). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(config = %args.config.display(), error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        error!(error = %e, "startup check failed");
        return ExitCode::FAILURE;
    }

    info!(
        library = %config.library.dir.display(),
        catalog_size = config.library.catalog_size,
        url = %config.stream.url,
        "loopcast starting"
    );

    let selector = Selector::new(&config.library, RandomSource);
    let mut supervisor = Supervisor::new(&config, selector, FfmpegEncoder);

    if let Err(e) = supervisor.start_stream().await {
        error!(error = %e, "failed to start stream");
        return ExitCode::FAILURE;
    }

    match supervisor.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "supervisor stopped");
            ExitCode::FAILURE
        }
    }
}
