//! stepwise worker entry point.
//!
//! Binary name: `stepwise-worker`
//!
//! Hosts the durable backend: loads `engine.toml`, opens the database,
//! registers the built-in step types, imports definition files, and restarts
//! every execution a previous process left running or waiting. It then keeps
//! those drivers alive until Ctrl+C or SIGTERM.

mod state;

use std::path::PathBuf;

use clap::Parser;
use stepwise_infra::config::resolve_data_dir;
use stepwise_observe::tracing_setup::{LogFormat, init_tracing_with, shutdown_tracing};

use state::WorkerState;

/// Run and recover durable stepwise workflow executions.
#[derive(Parser)]
#[command(name = "stepwise-worker", version, about, long_about = None)]
struct Cli {
    /// Data directory holding engine.toml and the default database.
    #[arg(long, env = "STEPWISE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Database URL (overrides engine.toml).
    #[arg(long, env = "STEPWISE_DATABASE_URL")]
    database_url: Option<String>,

    /// Directory of workflow definition files to import on startup.
    #[arg(long)]
    workflows: Option<PathBuf>,

    /// Log output format: text or json.
    #[arg(long, default_value = "text")]
    log_format: LogFormat,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long)]
    otel: bool,

    /// Suppress all logs except errors.
    #[arg(long)]
    quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "info,stepwise_core=debug,stepwise_worker=debug",
        _ => "trace",
    };
    init_tracing_with(cli.log_format, cli.otel, filter)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let data_dir = cli.data_dir.unwrap_or_else(resolve_data_dir);
    let state = WorkerState::init(data_dir, cli.database_url).await?;
    tracing::info!(
        data_dir = %state.data_dir.display(),
        approval_timeout_policy = ?state.config.approval_timeout_policy,
        max_subflow_depth = state.config.max_subflow_depth,
        circuit_breaker_threshold = state.config.circuit_breaker_threshold,
        "worker starting"
    );

    if let Some(dir) = &cli.workflows {
        let stored = state.import_definitions(dir).await?;
        tracing::info!(dir = %dir.display(), stored, "imported workflow definitions");
    }

    let recovered = state.executor.recover().await?;
    tracing::info!(count = recovered.len(), "recovered unfinished executions");

    shutdown_signal().await;
    match state.executor.engine().execution_analytics(None).await {
        Ok(summary) => tracing::info!(
            total = summary.total,
            active = summary.active,
            completed = summary.completed,
            failed = summary.failed,
            "execution summary"
        ),
        Err(e) => tracing::warn!(error = %e, "failed to summarize executions"),
    }
    tracing::info!("worker stopping");
    shutdown_tracing();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
