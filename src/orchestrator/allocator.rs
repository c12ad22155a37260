//! Pool allocator: matches a waiting session with an available instance.
//!
//! The `available → assigned` edge is a compare-and-swap on the stored pool
//! status. A lost race is not retried within the same call; the caller
//! re-polls.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::compute::ComputeBackend;
use crate::config::GlobalConfig;
use crate::models::instance::InstanceState;
use crate::models::pool::PoolStatus;
use crate::models::session::{ProvisioningStage, Session, SessionStatus};
use crate::persistence::db::Database;
use crate::persistence::pool_repo::PoolRepo;
use crate::Result;

use super::elapsed_since;

/// Message recorded when allocation exceeds the fatal threshold.
pub const CAPACITY_EXHAUSTED: &str =
    "Instance allocation timed out. The system may be at capacity, please try again later.";

/// Result of one claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The instance now belongs to the session.
    Claimed(String),
    /// The pool has no `available` entry.
    NoneAvailable,
    /// The candidate is not running at the compute backend.
    NotRunning(String),
    /// Another caller claimed the candidate first.
    Contended(String),
    /// The session already holds an instance.
    AlreadyAssigned,
}

impl ClaimOutcome {
    /// Whether the session holds an instance after this attempt.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed(_) | Self::AlreadyAssigned)
    }
}

/// Warning and fatal waiting thresholds for unassigned sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationPolicy {
    /// Soft warning threshold.
    pub warning: Duration,
    /// Hard failure threshold; always greater than `warning`.
    pub fatal: Duration,
}

impl AllocationPolicy {
    /// Thresholds from the `[pool]` configuration section.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            warning: config.allocation_warning(),
            fatal: config.allocation_fatal(),
        }
    }

    /// Apply the waiting-time policy to a session that is still unassigned.
    ///
    /// Past `fatal` the session moves to `error`; past `warning` it is only
    /// marked. Waiting time is measured from `created_at`.
    pub fn apply(&self, session: &mut Session, now: DateTime<Utc>) {
        let waited = elapsed_since(session.created_at, now);

        if waited > self.fatal {
            if session.advance_to(SessionStatus::Error) {
                session.error = Some(CAPACITY_EXHAUSTED.to_owned());
            }
            error!(
                session_id = %session.session_id,
                waited_seconds = waited.as_secs(),
                "instance allocation timed out"
            );
        } else if waited > self.warning {
            session.provisioning_stage = Some(ProvisioningStage::CapacityWarning);
            warn!(
                session_id = %session.session_id,
                waited_seconds = waited.as_secs(),
                "no pool instance available past warning threshold"
            );
        } else {
            session.provisioning_stage = Some(ProvisioningStage::WaitingForCapacity);
        }
    }
}

/// Claims pool instances for waiting sessions.
#[derive(Clone)]
pub struct PoolAllocator {
    pool: PoolRepo,
    compute: Arc<dyn ComputeBackend>,
}

impl PoolAllocator {
    /// Create an allocator over the shared store and compute backend.
    #[must_use]
    pub fn new(db: Arc<Database>, compute: Arc<dyn ComputeBackend>) -> Self {
        Self {
            pool: PoolRepo::new(db),
            compute,
        }
    }

    /// Attempt to claim one available instance for `session`.
    ///
    /// Takes the first available candidate, confirms it is running, then
    /// issues the conditional claim. On success the session's
    /// `instance_id` and `instance_ip` are set in place.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on store failure or `AppError::Backend` if the
    /// candidate cannot be described.
    pub async fn try_claim(&self, session: &mut Session, now: DateTime<Utc>) -> Result<ClaimOutcome> {
        if session.instance_id.is_some() {
            return Ok(ClaimOutcome::AlreadyAssigned);
        }

        let available = self.pool.list_by_status(PoolStatus::Available).await?;
        let Some(candidate) = available.into_iter().next() else {
            debug!(session_id = %session.session_id, "no available pool instances");
            return Ok(ClaimOutcome::NoneAvailable);
        };
        let instance_id = candidate.instance_id;

        let snapshot = match self.compute.describe(&instance_id).await? {
            Some(snapshot) if snapshot.state == InstanceState::Running => snapshot,
            other => {
                warn!(
                    %instance_id,
                    state = other.as_ref().map_or("missing", |s| s.state.as_str()),
                    "pool bookkeeping lists an instance that is not running"
                );
                return Ok(ClaimOutcome::NotRunning(instance_id));
            }
        };

        let claimed = self
            .pool
            .claim(&instance_id, &session.session_id, &session.student_id, now)
            .await?;
        if !claimed {
            debug!(session_id = %session.session_id, %instance_id, "claim lost to another session");
            return Ok(ClaimOutcome::Contended(instance_id));
        }

        session.instance_id = Some(instance_id.clone());
        session.instance_ip = snapshot.private_ip;
        session.instance_state = Some(snapshot.state);
        session.health_checks = Some(snapshot.health);

        info!(session_id = %session.session_id, %instance_id, "pool instance claimed");
        Ok(ClaimOutcome::Claimed(instance_id))
    }

    /// Return `instance_id` to the pool if `session_id` still holds it.
    ///
    /// Failures are logged and reported as `false`.
    pub async fn release(&self, instance_id: &str, session_id: &str) -> bool {
        match self.pool.release(instance_id, session_id).await {
            Ok(true) => {
                info!(instance_id, session_id, "pool instance released");
                true
            }
            Ok(false) => {
                debug!(instance_id, session_id, "pool instance not held by session");
                false
            }
            Err(err) => {
                warn!(instance_id, session_id, %err, "failed to release pool instance");
                false
            }
        }
    }
}
