//! Pooled session model and lifecycle helpers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::instance::{HealthChecks, InstanceState};

/// Lifecycle status for a pooled session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Request recorded, allocation not yet attempted.
    Pending,
    /// Waiting for an instance or for the instance to become healthy.
    Provisioning,
    /// Instance healthy; remote-desktop link being handed out.
    Ready,
    /// Student has connected.
    Active,
    /// Instance winding down.
    Terminating,
    /// Session over.
    Terminated,
    /// Session failed.
    Error,
}

impl SessionStatus {
    /// Statuses that still hold or await compute.
    pub const ACTIVE: [Self; 4] = [Self::Pending, Self::Provisioning, Self::Ready, Self::Active];

    /// No further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }

    /// Position along `pending → provisioning → ready → active`.
    fn forward_rank(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Provisioning => Some(1),
            Self::Ready => Some(2),
            Self::Active => Some(3),
            Self::Terminating | Self::Terminated | Self::Error => None,
        }
    }
}

/// Sub-stage marker recorded while `status` stays `provisioning`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStage {
    /// No pool instance could be claimed yet.
    WaitingForCapacity,
    /// Still no instance after the allocation warning threshold.
    CapacityWarning,
    /// Instance running, health checks not yet conclusive.
    WaitingHealthChecks,
}

/// Remote-desktop connection details handed to the student.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConnectionInfo {
    /// Gateway kind; always `guacamole` today.
    #[serde(rename = "type")]
    pub kind: String,
    /// Student-facing gateway URL.
    pub base_url: Option<String>,
    /// Provisioner connection identifier; absent until provisioning succeeds.
    pub connection_id: Option<String>,
    /// Target instance address.
    pub instance_ip: String,
    /// RDP port on the instance.
    pub rdp_port: u16,
    /// VNC port on the instance.
    pub vnc_port: u16,
    /// SSH port on the instance.
    pub ssh_port: u16,
}

/// One student's request for a pooled lab environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique record identifier; immutable.
    pub session_id: String,
    /// Owning student.
    pub student_id: String,
    /// Display name of the student.
    pub student_name: Option<String>,
    /// Course the session was started from.
    pub course_id: Option<String>,
    /// Lab/activity the session was started from.
    pub lab_id: Option<String>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Claimed pool instance; set at most once.
    pub instance_id: Option<String>,
    /// Private address of the claimed instance.
    pub instance_ip: Option<String>,
    /// Last lifecycle state reported by the compute backend.
    pub instance_state: Option<InstanceState>,
    /// Last health-check snapshot.
    pub health_checks: Option<HealthChecks>,
    /// Remote-desktop connection details.
    pub connection_info: Option<ConnectionInfo>,
    /// One-time direct-access link.
    pub direct_url: Option<String>,
    /// Transient sub-stage marker; not persisted.
    #[serde(default)]
    pub provisioning_stage: Option<ProvisioningStage>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last persisted change.
    pub updated_at: DateTime<Utc>,
    /// Absolute deadline.
    pub expires_at: DateTime<Utc>,
    /// Diagnostic message for `error` sessions.
    pub error: Option<String>,
    /// Why the session ended.
    pub termination_reason: Option<String>,
}

impl Session {
    /// Construct a new `provisioning` session expiring after `ttl`.
    #[must_use]
    pub fn new(student_id: String, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id: format!("sess-{}", Uuid::new_v4().simple()),
            student_id,
            student_name: None,
            course_id: None,
            lab_id: None,
            status: SessionStatus::Provisioning,
            instance_id: None,
            instance_ip: None,
            instance_state: None,
            health_checks: None,
            connection_info: None,
            direct_url: None,
            provisioning_stage: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            error: None,
            termination_reason: None,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// Staying in the same status is always allowed. Terminal statuses
    /// admit nothing else. Among the forward statuses only increasing moves
    /// are allowed; `terminating`, `terminated` and `error` are reachable
    /// from any non-terminal status, and `terminating` only moves on to a
    /// terminal status.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        if self.status == next {
            return true;
        }
        if self.status.is_terminal() {
            return false;
        }
        match (self.status.forward_rank(), next.forward_rank()) {
            (Some(current), Some(target)) => target > current,
            (_, None) => true,
            (None, Some(_)) => false,
        }
    }

    /// Apply `next` if the transition table permits it.
    ///
    /// Returns `true` when the status now equals `next`.
    pub fn advance_to(&mut self, next: SessionStatus) -> bool {
        if self.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Whether the session deadline has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Seconds until expiry, floored at zero.
    #[must_use]
    pub fn time_remaining_at(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }

    /// Whether a remote-desktop connection still needs to be provisioned.
    #[must_use]
    pub fn needs_connection(&self) -> bool {
        let has_connection_id = self
            .connection_info
            .as_ref()
            .is_some_and(|info| info.connection_id.is_some());
        !has_connection_id && self.direct_url.is_none()
    }
}
