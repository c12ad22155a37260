//! UI progress estimation for pooled sessions.
//!
//! [`estimate`] is a pure decision table over the session's current fields.
//! Progress never decreases along `pending → provisioning → ready → active`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::instance::{HealthChecks, InstanceState};
use crate::models::session::{ProvisioningStage, Session, SessionStatus};

/// UI-facing progress label.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Looking for a free pool instance.
    FindingInstance,
    /// Instance claimed, state not yet observed.
    InstanceClaimed,
    /// Instance booting.
    InstanceStarting,
    /// Instance running, health checks pending.
    WaitingHealth,
    /// Health checks passed, promotion imminent.
    HealthCheckPassed,
    /// Remote-desktop connection being created.
    CreatingConnection,
    /// Direct-access link being minted.
    GeneratingToken,
    /// Ready for the student.
    Ready,
    /// Instance winding down.
    Terminating,
    /// Session over.
    Terminated,
    /// Session failed.
    Error,
}

/// Estimated progress for one session snapshot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StageInfo {
    /// Progress label.
    pub stage: Stage,
    /// Percentage in `0..=100`.
    pub progress: u8,
    /// Human-readable status line.
    pub message: String,
    /// Rough seconds until ready.
    pub estimated_seconds: u32,
}

impl StageInfo {
    fn new(stage: Stage, progress: u8, message: impl Into<String>, estimated_seconds: u32) -> Self {
        Self {
            stage,
            progress,
            message: message.into(),
            estimated_seconds,
        }
    }
}

/// Derive the UI stage for `session`.
#[must_use]
pub fn estimate(session: &Session) -> StageInfo {
    match session.status {
        SessionStatus::Pending => {
            if session.instance_id.is_some() {
                StageInfo::new(Stage::InstanceClaimed, 18, "Lab instance reserved...", 45)
            } else {
                finding_instance(session)
            }
        }
        SessionStatus::Provisioning => provisioning(session),
        SessionStatus::Ready => ready(session),
        SessionStatus::Active => StageInfo::new(Stage::Ready, 100, "Session active", 0),
        SessionStatus::Terminating => {
            StageInfo::new(Stage::Terminating, 0, "Session is shutting down", 0)
        }
        SessionStatus::Terminated => StageInfo::new(Stage::Terminated, 0, "Session ended", 0),
        SessionStatus::Error => StageInfo::new(
            Stage::Error,
            0,
            session
                .error
                .clone()
                .unwrap_or_else(|| "Session failed".to_owned()),
            0,
        ),
    }
}

fn finding_instance(session: &Session) -> StageInfo {
    let message = if session.provisioning_stage == Some(ProvisioningStage::CapacityWarning) {
        "High demand, still looking for an available lab instance..."
    } else {
        "Finding an available lab instance..."
    };
    StageInfo::new(Stage::FindingInstance, 10, message, 55)
}

fn provisioning(session: &Session) -> StageInfo {
    if session.instance_id.is_none() {
        return finding_instance(session);
    }

    match session.instance_state {
        None => StageInfo::new(Stage::InstanceClaimed, 18, "Lab instance reserved...", 45),
        Some(InstanceState::Pending) => {
            StageInfo::new(Stage::InstanceStarting, 25, "Starting lab instance...", 40)
        }
        Some(InstanceState::Running) => health_stage(session.health_checks.unwrap_or_default()),
        Some(_) => StageInfo::new(
            Stage::InstanceStarting,
            25,
            "Lab instance is being prepared...",
            40,
        ),
    }
}

fn health_stage(health: HealthChecks) -> StageInfo {
    let passed = health.passed_checks();

    if health.all_passed() {
        return StageInfo::new(
            Stage::HealthCheckPassed,
            50,
            "Health checks passed, finalizing...",
            20,
        );
    }
    if passed == 0 || health.is_initializing() {
        return StageInfo::new(
            Stage::WaitingHealth,
            42,
            "Initializing security protocols...",
            25,
        );
    }

    // 1..TOTAL passed
    let progress = 42 + u8::try_from(passed * 3).unwrap_or(0);
    StageInfo::new(
        Stage::WaitingHealth,
        progress,
        format!(
            "Configuring network interfaces... ({passed}/{})",
            HealthChecks::TOTAL
        ),
        15,
    )
}

fn ready(session: &Session) -> StageInfo {
    let has_connection_id = session
        .connection_info
        .as_ref()
        .is_some_and(|info| info.connection_id.is_some());

    match (has_connection_id, session.direct_url.is_some()) {
        (_, true) => StageInfo::new(Stage::Ready, 100, "Lab environment ready", 0),
        (true, false) => StageInfo::new(
            Stage::GeneratingToken,
            94,
            "Generating secure access token...",
            3,
        ),
        (false, false) => StageInfo::new(
            Stage::CreatingConnection,
            62,
            "Creating secure RDP connection...",
            15,
        ),
    }
}

/// Session record enriched with stage fields and time remaining.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionView {
    /// The stored session.
    #[serde(flatten)]
    pub session: Session,
    /// Progress label.
    pub stage: Stage,
    /// Percentage in `0..=100`.
    pub progress: u8,
    /// Human-readable status line.
    pub stage_message: String,
    /// Rough seconds until ready.
    pub estimated_seconds: u32,
    /// Seconds until expiry, floored at zero.
    pub time_remaining: i64,
}

impl SessionView {
    /// Enrich `session` as of `now`.
    #[must_use]
    pub fn at(session: Session, now: DateTime<Utc>) -> Self {
        let info = estimate(&session);
        let time_remaining = session.time_remaining_at(now);
        Self {
            session,
            stage: info.stage,
            progress: info.progress,
            stage_message: info.message,
            estimated_seconds: info.estimated_seconds,
            time_remaining,
        }
    }

    /// Enrich `session` against the current wall clock.
    #[must_use]
    pub fn now(session: Session) -> Self {
        Self::at(session, Utc::now())
    }
}
