#![forbid(unsafe_code)]

//! `lab-orchestrator` — HTTP server binary.
//!
//! Bootstraps configuration and credentials, opens the status store, wires
//! the compute backend and Guacamole provisioner, and serves the JSON API
//! until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use lab_orchestrator::compute::http::HttpComputeBackend;
use lab_orchestrator::compute::ComputeBackend;
use lab_orchestrator::config::GlobalConfig;
use lab_orchestrator::http::{self, AppState};
use lab_orchestrator::models::session::SessionStatus;
use lab_orchestrator::persistence::db;
use lab_orchestrator::persistence::session_repo::SessionRepo;
use lab_orchestrator::provisioner::guacamole::GuacamoleProvisioner;
use lab_orchestrator::provisioner::ConnectionProvisioner;
use lab_orchestrator::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "lab-orchestrator", about = "Lab environment orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("lab-orchestrator bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    config.load_credentials().await?;
    let config = Arc::new(config);
    info!("configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db_path = config.db_path.to_string_lossy().to_string();
    let db = Arc::new(db::connect(&db_path).await?);
    info!(%db_path, "database connected");

    report_open_sessions(&db).await;

    // ── Collaborators ───────────────────────────────────
    let compute: Arc<dyn ComputeBackend> = Arc::new(HttpComputeBackend::new(&config.compute)?);
    let provisioner: Arc<dyn ConnectionProvisioner> =
        Arc::new(GuacamoleProvisioner::new(&config.guacamole)?);

    let state = Arc::new(AppState::new(Arc::clone(&config), db, compute, provisioner));

    // ── Serve ───────────────────────────────────────────
    let ct = CancellationToken::new();
    let server_ct = ct.clone();
    let server = tokio::spawn(async move { http::serve(state, server_ct).await });

    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(%err, "http server failed"),
        Err(err) => error!(%err, "http server task panicked"),
    }

    info!("lab-orchestrator shut down");
    Ok(())
}

/// Log how many sessions are still open from a previous run. They resume
/// on their next poll.
async fn report_open_sessions(db: &Arc<db::Database>) {
    let repo = SessionRepo::new(Arc::clone(db));
    let mut open = 0usize;
    for status in SessionStatus::ACTIVE {
        match repo.list_by_status(status).await {
            Ok(sessions) => open += sessions.len(),
            Err(err) => {
                error!(%err, "failed to count open sessions");
                return;
            }
        }
    }
    info!(open_sessions = open, "startup session check complete");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
