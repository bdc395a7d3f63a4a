//! larder-maint - recipe service maintenance pipeline
//!
//! `run` executes the configured stages, `reset` forgets one stage's
//! progress, `stages` lists stage names and the configured order.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use larder_maint::checkpoint::CheckpointStore;
use larder_maint::config::split_list;
use larder_maint::{HttpRecipeService, MaintConfig, Pipeline, RunOverrides, StageName};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Command-line arguments for larder-maint
#[derive(Parser, Debug)]
#[command(name = "larder-maint")]
#[command(about = "Staged maintenance pipeline for a Mealie recipe service")]
#[command(version)]
struct Args {
    /// Config file (default: LARDER_CONFIG, then the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the maintenance pipeline
    Run {
        /// Comma separated stage order, e.g. "foods,units"
        #[arg(long)]
        stages: Option<String>,

        /// Plan everything, write nothing
        #[arg(long)]
        audit_only: bool,

        /// Keep running later stages after a stage fails
        #[arg(long)]
        continue_on_error: bool,

        /// Maximum actions per stage this run
        #[arg(long, allow_negative_numbers = true)]
        max_actions: Option<i64>,

        /// Concurrent actions within a stage
        #[arg(long)]
        workers: Option<usize>,

        /// Stop starting new actions after this many seconds
        #[arg(long)]
        deadline_seconds: Option<u64>,
    },
    /// Delete a stage's checkpoint so its items are evaluated again
    Reset {
        stage: String,
    },
    /// List valid stage names and the configured order
    Stages,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run_cli().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("larder-maint: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run_cli() -> Result<u8> {
    let args = Args::parse();
    let mut config = MaintConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Stages => {
            let valid: Vec<&str> = StageName::ALL.iter().map(|s| s.as_str()).collect();
            println!("valid stages: {}", valid.join(", "));
            let order = config.stage_order()?;
            for stage in order {
                println!("{:<12} {}", stage.as_str(), config.mode_for(stage));
            }
            Ok(0)
        }
        Command::Reset { stage } => {
            let stage: StageName = stage.parse().map_err(anyhow::Error::msg)?;
            let removed = CheckpointStore::reset(&config.pipeline.checkpoint_dir, stage.as_str())
                .context("Failed to reset checkpoint")?;
            if removed {
                println!("checkpoint for '{}' removed", stage);
            } else {
                println!("no checkpoint for '{}'", stage);
            }
            Ok(0)
        }
        Command::Run {
            stages,
            audit_only,
            continue_on_error,
            max_actions,
            workers,
            deadline_seconds,
        } => {
            config.apply_overrides(&RunOverrides {
                stages: stages.as_deref().map(split_list),
                audit_only,
                continue_on_error,
                max_actions,
                workers,
                deadline_seconds,
            });

            larder_common::logging::init_tracing(&config.logging, "sqlx=warn,hyper=warn,reqwest=warn")?;
            info!("Starting larder-maint {}", env!("CARGO_PKG_VERSION"));

            let settings = config.service.settings()?;
            let service = HttpRecipeService::new(settings).context("Failed to build service client")?;
            let pipeline = Pipeline::new(Arc::new(service), config)?;

            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_signal(cancel.clone()));

            let report = pipeline.run(cancel).await;
            println!(
                "run {} {:?}: {}",
                report.run_id,
                report.state,
                report
                    .stages
                    .iter()
                    .map(|s| format!(
                        "{}={} (proposed {}, applied {}, failed {})",
                        s.stage, s.status, s.counts.proposed, s.counts.applied, s.counts.failed
                    ))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            Ok(report.exit_code())
        }
    }
}

/// Cancel the run on Ctrl+C or SIGTERM; in-flight actions finish
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, cancelling run"),
        _ = terminate => info!("Received terminate signal, cancelling run"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}
