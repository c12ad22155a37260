//! Request handlers. Each one validates its input shape, delegates to a
//! manager, and wraps the result in the response envelope.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::models::template::LabTemplate;
use crate::orchestrator::lab_manager::{CreateLabRequest, LabCreated, LabSessionView, LabTermination};
use crate::orchestrator::session_manager::{CreateSessionRequest, SessionCreated, StudentSessions};
use crate::orchestrator::stage::SessionView;

use super::error::ApiResult;
use super::AppState;

/// Successful response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// Always `true`.
    pub success: bool,
    /// Short summary.
    pub message: String,
    /// Payload.
    pub data: T,
}

fn ok<T>(message: impl Into<String>, data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        message: message.into(),
        data,
    })
}

/// Liveness payload.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `ok`.
    pub status: &'static str,
    /// Crate version.
    pub version: &'static str,
}

/// `GET /health`
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /sessions`
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<Json<ApiResponse<SessionCreated>>> {
    let created = state.sessions.create_session(request).await?;
    let message = if created.existing {
        "Active session already exists"
    } else {
        "Session created"
    };
    Ok(ok(message, created))
}

/// `GET /sessions/{id}`
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<ApiResponse<SessionView>>> {
    let view = state.sessions.get_session(&session_id).await?;
    let message = view.stage_message.clone();
    Ok(ok(message, view))
}

/// Caller identity and optional reason for `DELETE /sessions/{id}`.
#[derive(Debug, Deserialize)]
pub struct TerminateQuery {
    /// Caller; must own the session.
    #[serde(default)]
    pub student_id: String,
    /// Termination reason recorded on the session.
    pub reason: Option<String>,
}

/// `DELETE /sessions/{id}?student_id=...`
pub async fn terminate_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<TerminateQuery>,
) -> ApiResult<Json<ApiResponse<SessionView>>> {
    let view = state
        .sessions
        .terminate_session(&session_id, &query.student_id, query.reason.as_deref())
        .await?;
    Ok(ok("Session terminated", view))
}

/// Caller identity for heartbeat.
#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    /// Caller; must own the session.
    #[serde(default)]
    pub student_id: String,
}

/// `POST /sessions/{id}/heartbeat`
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<Json<ApiResponse<SessionView>>> {
    let view = state
        .sessions
        .heartbeat(&session_id, &request.student_id)
        .await?;
    Ok(ok("Heartbeat recorded", view))
}

/// `GET /students/{id}/sessions`
pub async fn list_student_sessions(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<String>,
) -> ApiResult<Json<ApiResponse<StudentSessions>>> {
    let listing = state.sessions.list_student_sessions(&student_id).await?;
    let message = format!("{} sessions", listing.total_sessions);
    Ok(ok(message, listing))
}

/// `POST /lab/create`
pub async fn create_lab(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateLabRequest>,
) -> ApiResult<Json<ApiResponse<LabCreated>>> {
    let created = state.labs.create(request).await?;
    let message = match (&created.session, created.existing) {
        (_, true) => "Active lab session already exists",
        (None, false) => "No active lab session",
        (Some(_), false) => "Lab session launching",
    };
    Ok(ok(message, created))
}

/// `GET /lab/status/{id}`
pub async fn lab_status(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<ApiResponse<LabSessionView>>> {
    let view = state.labs.status(&session_id).await?;
    let message = view.message.clone();
    Ok(ok(message, view))
}

/// Body of `POST /lab/terminate`.
#[derive(Debug, Deserialize)]
pub struct TerminateLabRequest {
    /// Lab session to end.
    #[serde(default)]
    pub session_id: String,
    /// Caller; must own the session.
    #[serde(default)]
    pub user_id: String,
}

/// `POST /lab/terminate`
pub async fn terminate_lab(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TerminateLabRequest>,
) -> ApiResult<Json<ApiResponse<LabTermination>>> {
    let result = state
        .labs
        .terminate(&request.session_id, &request.user_id)
        .await?;
    let message = if result.already_terminated {
        "Lab session already terminated"
    } else {
        "Lab session terminated"
    };
    Ok(ok(message, result))
}

/// Filters for `GET /templates`.
#[derive(Debug, Deserialize)]
pub struct TemplateQuery {
    /// Lab flavor filter.
    #[serde(rename = "type")]
    pub lab_type: Option<String>,
    /// Category filter.
    pub category: Option<String>,
}

/// `GET /templates?type=&category=`
pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TemplateQuery>,
) -> ApiResult<Json<ApiResponse<Vec<LabTemplate>>>> {
    let templates = state
        .labs
        .list_templates(query.lab_type.as_deref(), query.category.as_deref())
        .await?;
    let message = format!("{} templates", templates.len());
    Ok(ok(message, templates))
}
