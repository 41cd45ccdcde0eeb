//! `delta` binary: `generator` and `processor` subcommands.
//!
//! Both subcommands load and validate the configuration, build the run
//! context and hand over to the respective driver. Every fatal path logs a
//! single ERROR line with the run id and exits with the error's code
//! (1 configuration, 2 transport, 3 storage); a normal end-of-stream drain
//! exits 0.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info};

use delta_fusion::config::Settings;
use delta_fusion::{DeltaError, RunContext};

#[derive(Parser)]
#[command(
    name = "delta",
    about = "Streaming spectral analysis for KSTAR ECEI diagnostic data"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay an archived shot over the transport.
    Generator {
        /// Run configuration file (JSON or TOML).
        #[arg(long)]
        config: PathBuf,
    },
    /// Receive the stream and run the analysis pipeline.
    Processor {
        /// Run configuration file (JSON or TOML).
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(e.exit_code() as u8),
    }
}

fn run(cli: Cli) -> Result<(), DeltaError> {
    match cli.command {
        Command::Generator { config } => {
            let ctx = load_context(&config)?;
            delta_fusion::generator::run(&ctx).map_err(|e| {
                error!("run_id={} generator failed: {e}", ctx.run_id);
                e
            })
        }
        Command::Processor { config } => {
            let ctx = load_context(&config)?;
            let runtime = tokio::runtime::Runtime::new().map_err(DeltaError::Io)?;
            let stats = runtime
                .block_on(delta_fusion::processor::run(&ctx))
                .map_err(|e| {
                    error!("run_id={} processor failed: {e}", ctx.run_id);
                    e
                })?;
            info!(
                "run_id={} stored {} results ({} kernel failures, {} storage failures)",
                ctx.run_id, stats.stored, stats.kernel_failures, stats.storage_failures
            );
            Ok(())
        }
    }
}

fn load_context(config: &std::path::Path) -> Result<RunContext, DeltaError> {
    let settings = Settings::from_file(config).map_err(|e| {
        error!("run_id=------ cannot load {}: {e}", config.display());
        e
    })?;
    let ctx = RunContext::new(settings);
    info!("run_id={} configuration {} loaded", ctx.run_id, config.display());
    Ok(ctx)
}
