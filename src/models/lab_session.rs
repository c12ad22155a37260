//! Template-backed lab session model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::template::{LabTemplate, TemplateService};

/// Lifecycle status for a dedicated-instance lab session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LabSessionStatus {
    /// Accepted, not yet launched.
    Pending,
    /// Instance requested and booting.
    Launching,
    /// Instance running with both health checks passing.
    Running,
    /// Teardown requested.
    Terminating,
    /// Instance gone.
    Terminated,
    /// Launch or instance failure.
    Error,
}

impl LabSessionStatus {
    /// Statuses counted against the per-user limit.
    pub const ACTIVE: [Self; 3] = [Self::Pending, Self::Launching, Self::Running];

    /// Counted against the per-user limit.
    #[must_use]
    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    /// No further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }
}

/// A session backed by its own freshly launched instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LabSession {
    /// Unique record identifier.
    pub session_id: String,
    /// Owning user.
    pub user_id: String,
    /// Catalog template launched.
    pub template_id: String,
    /// Template display name at launch time.
    pub template_name: String,
    /// Course the lab was launched from.
    pub course_id: Option<String>,
    /// How the student reaches the target (e.g. `lynkbox`).
    pub connection_method: String,
    /// Lab flavor copied from the template.
    pub lab_type: String,
    /// Current lifecycle status.
    pub status: LabSessionStatus,
    /// Launched instance.
    pub instance_id: Option<String>,
    /// Instance shape launched.
    pub instance_type: Option<String>,
    /// Target private address once running.
    pub target_ip: Option<String>,
    /// Services exposed by the target.
    pub services: Vec<TemplateService>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last persisted change.
    pub updated_at: DateTime<Utc>,
    /// Absolute deadline.
    pub expires_at: DateTime<Utc>,
    /// Termination timestamp.
    pub terminated_at: Option<DateTime<Utc>>,
    /// Failure detail for `error` sessions.
    pub error: Option<String>,
}

impl LabSession {
    /// Construct a `launching` session for `template`.
    #[must_use]
    pub fn launching(
        user_id: String,
        template: &LabTemplate,
        course_id: Option<String>,
        connection_method: String,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: format!("lab-{}", &Uuid::new_v4().simple().to_string()[..12]),
            user_id,
            template_id: template.template_id.clone(),
            template_name: template.name.clone(),
            course_id,
            connection_method,
            lab_type: template.lab_type.clone(),
            status: LabSessionStatus::Launching,
            instance_id: None,
            instance_type: None,
            target_ip: None,
            services: template.services.clone(),
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            terminated_at: None,
            error: None,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// `terminated` is final. An `error` record may still be torn down to
    /// `terminated`.
    #[must_use]
    pub fn can_transition_to(&self, next: LabSessionStatus) -> bool {
        use LabSessionStatus::{Error, Launching, Pending, Running, Terminated, Terminating};

        if self.status == next {
            return true;
        }
        match self.status {
            Pending => matches!(next, Launching | Terminating | Terminated | Error),
            Launching => matches!(next, Running | Terminating | Terminated | Error),
            Running => matches!(next, Terminating | Terminated | Error),
            Terminating => matches!(next, Terminated | Error),
            Error => next == Terminated,
            Terminated => false,
        }
    }

    /// Apply `next` if permitted. Returns `true` when the status now equals `next`.
    pub fn advance_to(&mut self, next: LabSessionStatus) -> bool {
        if self.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Seconds until expiry, floored at zero.
    #[must_use]
    pub fn time_remaining_at(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}
