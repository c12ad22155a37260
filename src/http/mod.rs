//! JSON HTTP surface.
//!
//! The router is thin: handlers translate requests into manager calls and
//! [`error::ApiError`] maps failures to status codes. No lifecycle logic
//! lives here.

pub mod error;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::compute::ComputeBackend;
use crate::config::GlobalConfig;
use crate::orchestrator::lab_manager::LabManager;
use crate::orchestrator::session_manager::SessionManager;
use crate::persistence::db::Database;
use crate::provisioner::ConnectionProvisioner;
use crate::{AppError, Result};

/// Shared state handed to every handler.
pub struct AppState {
    /// Immutable configuration.
    pub config: Arc<GlobalConfig>,
    /// Pooled session operations.
    pub sessions: SessionManager,
    /// Lab session operations.
    pub labs: LabManager,
}

impl AppState {
    /// Wire managers to the store and collaborators.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        db: Arc<Database>,
        compute: Arc<dyn ComputeBackend>,
        provisioner: Arc<dyn ConnectionProvisioner>,
    ) -> Self {
        Self {
            sessions: SessionManager::new(
                Arc::clone(&config),
                Arc::clone(&db),
                Arc::clone(&compute),
                provisioner,
            ),
            labs: LabManager::new(Arc::clone(&config), db, compute),
            config,
        }
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/sessions", post(handlers::create_session))
        .route(
            "/sessions/{id}",
            get(handlers::get_session).delete(handlers::terminate_session),
        )
        .route("/sessions/{id}/heartbeat", post(handlers::heartbeat))
        .route(
            "/students/{id}/sessions",
            get(handlers::list_student_sessions),
        )
        .route("/lab/create", post(handlers::create_lab))
        .route("/lab/status/{id}", get(handlers::lab_status))
        .route("/lab/terminate", post(handlers::terminate_lab))
        .route("/templates", get(handlers::list_templates))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the router on `http_bind:http_port` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the address is invalid or cannot be bound,
/// or `AppError::Io` if the server fails while running.
pub async fn serve(state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let bind: SocketAddr = format!("{}:{}", state.config.http_bind, state.config.http_port)
        .parse()
        .map_err(|err| AppError::Config(format!("invalid http bind address: {err}")))?;

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {bind}: {err}")))?;

    info!(%bind, "starting HTTP server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("HTTP server error: {err}")))?;

    info!("HTTP server shut down");
    Ok(())
}
