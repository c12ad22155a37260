//! Pooled session lifecycle engine.
//!
//! A refresh combines the stored [`Session`] with live compute state and
//! decides what to persist. Rules are evaluated in a fixed order:
//!
//! 1. expiry pre-empts everything and yields `terminated`/`expired`;
//! 2. an unassigned session runs the [`PoolAllocator`] and its timeout policy;
//! 3. the instance is described and its lifecycle state mapped onto the
//!    session status;
//! 4. a `ready`/`active` session gets its remote-desktop connection, at most
//!    once.
//!
//! Collaborator failures never abort a refresh. Write-back happens only on a
//! meaningful change and is guarded on the status, instance and connection
//! read at the start, so a refresh can never resurrect a record another
//! writer already ended, reassign its instance or replace its connection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::compute::ComputeBackend;
use crate::config::GlobalConfig;
use crate::models::instance::{InstanceSnapshot, InstanceState};
use crate::models::session::{ConnectionInfo, ProvisioningStage, Session, SessionStatus};
use crate::persistence::db::Database;
use crate::persistence::session_repo::SessionRepo;
use crate::provisioner::{short_id, ConnectionProvisioner, Credentials};
use crate::Result;

use super::allocator::{AllocationPolicy, PoolAllocator};
use super::elapsed_since;

/// Termination reason recorded when the deadline passes.
pub const REASON_EXPIRED: &str = "expired";
/// Termination reason recorded when the backend reports the instance gone.
pub const REASON_INSTANCE_TERMINATED: &str = "instance_terminated";
/// Error recorded when the backend no longer knows the instance.
pub const INSTANCE_NOT_FOUND: &str = "Instance not found";

/// Advances pooled sessions against live compute and gateway state.
#[derive(Clone)]
pub struct LifecycleEngine {
    config: Arc<GlobalConfig>,
    sessions: SessionRepo,
    allocator: PoolAllocator,
    policy: AllocationPolicy,
    health_fallback: Duration,
    compute: Arc<dyn ComputeBackend>,
    provisioner: Arc<dyn ConnectionProvisioner>,
}

impl LifecycleEngine {
    /// Create an engine over the shared store and collaborators.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        db: Arc<Database>,
        compute: Arc<dyn ComputeBackend>,
        provisioner: Arc<dyn ConnectionProvisioner>,
    ) -> Self {
        Self {
            policy: AllocationPolicy::from_config(&config),
            health_fallback: config.health_fallback(),
            sessions: SessionRepo::new(Arc::clone(&db)),
            allocator: PoolAllocator::new(db, Arc::clone(&compute)),
            config,
            compute,
            provisioner,
        }
    }

    /// The allocator this engine claims instances with.
    #[must_use]
    pub fn allocator(&self) -> &PoolAllocator {
        &self.allocator
    }

    /// Refresh `session` against the current wall clock.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store fails. Collaborator failures are
    /// absorbed.
    pub async fn refresh(&self, session: Session) -> Result<Session> {
        self.refresh_at(session, Utc::now()).await
    }

    /// Refresh `session` as of `now`.
    ///
    /// Terminal sessions are returned unchanged without any remote call.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store fails.
    pub async fn refresh_at(&self, session: Session, now: DateTime<Utc>) -> Result<Session> {
        if session.status.is_terminal() {
            return Ok(session);
        }

        let span = info_span!("refresh_session", session_id = %session.session_id);
        async move {
            let before = session.clone();
            let mut current = session;

            if current.is_expired_at(now) {
                current.advance_to(SessionStatus::Terminated);
                current.termination_reason = Some(REASON_EXPIRED.to_owned());
                info!(session_id = %current.session_id, "session expired");
            } else {
                self.advance(&mut current, now).await;
            }

            let claimed = match (&before.instance_id, &current.instance_id) {
                (None, Some(instance_id)) => Some(instance_id.clone()),
                _ => None,
            };
            let stored = match self.persist(&before, current, now).await {
                Ok(stored) => stored,
                Err(err) => {
                    if let Some(instance_id) = claimed.as_deref() {
                        self.allocator.release(instance_id, &before.session_id).await;
                    }
                    return Err(err);
                }
            };

            if stored.termination_reason.as_deref() == Some(REASON_EXPIRED)
                && before.status != stored.status
            {
                if let Some(instance_id) = stored.instance_id.as_deref() {
                    self.allocator.release(instance_id, &stored.session_id).await;
                }
            }

            Ok(stored)
        }
        .instrument(span)
        .await
    }

    /// Allocation, live instance mapping and connection provisioning. Never fails.
    async fn advance(&self, session: &mut Session, now: DateTime<Utc>) {
        // ── Allocation ───────────────────────────────────────
        if session.instance_id.is_none() {
            if !matches!(session.status, SessionStatus::Pending | SessionStatus::Provisioning) {
                if session.instance_ip.is_some() {
                    self.ensure_connection(session).await;
                }
                return;
            }

            session.advance_to(SessionStatus::Provisioning);
            match self.allocator.try_claim(session, now).await {
                Ok(outcome) if outcome.is_claimed() => {}
                Ok(outcome) => {
                    debug!(session_id = %session.session_id, ?outcome, "session still unassigned");
                    self.policy.apply(session, now);
                    return;
                }
                Err(err) => {
                    warn!(session_id = %session.session_id, %err, "claim attempt failed");
                    self.policy.apply(session, now);
                    return;
                }
            }
        }

        let Some(instance_id) = session.instance_id.clone() else {
            return;
        };

        // ── Live instance query ──────────────────────────────
        let snapshot = match self.compute.describe(&instance_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                if session.advance_to(SessionStatus::Error) {
                    session.error = Some(INSTANCE_NOT_FOUND.to_owned());
                }
                warn!(session_id = %session.session_id, %instance_id, "instance not found");
                return;
            }
            Err(err) => {
                warn!(session_id = %session.session_id, %instance_id, %err, "describe failed, retrying next poll");
                return;
            }
        };

        self.apply_snapshot(session, snapshot, now).await;
    }

    async fn apply_snapshot(&self, session: &mut Session, snapshot: InstanceSnapshot, now: DateTime<Utc>) {
        session.instance_state = Some(snapshot.state);
        session.health_checks = Some(snapshot.health);
        if let Some(ip) = snapshot.private_ip {
            session.instance_ip = Some(ip);
        }

        match snapshot.state {
            InstanceState::Running => {
                if matches!(session.status, SessionStatus::Pending | SessionStatus::Provisioning) {
                    self.evaluate_readiness(session, now);
                }
                if matches!(session.status, SessionStatus::Ready | SessionStatus::Active)
                    && session.instance_ip.is_some()
                {
                    self.ensure_connection(session).await;
                }
            }
            InstanceState::Pending => {
                session.advance_to(SessionStatus::Provisioning);
            }
            InstanceState::Stopping | InstanceState::ShuttingDown => {
                session.advance_to(SessionStatus::Terminating);
            }
            InstanceState::Stopped | InstanceState::Terminated => {
                if session.advance_to(SessionStatus::Terminated) {
                    session
                        .termination_reason
                        .get_or_insert_with(|| REASON_INSTANCE_TERMINATED.to_owned());
                }
            }
            InstanceState::Unknown => {
                debug!(session_id = %session.session_id, "unrecognized instance state, no change");
            }
        }
    }

    /// Promote a running instance to `ready` on passing health checks or
    /// once the fallback window has elapsed.
    fn evaluate_readiness(&self, session: &mut Session, now: DateTime<Utc>) {
        let health = session.health_checks.unwrap_or_default();
        let waited = elapsed_since(session.created_at, now);

        if health.all_passed() {
            session.advance_to(SessionStatus::Ready);
            info!(
                session_id = %session.session_id,
                promotion = "health_checks",
                "session ready"
            );
        } else if waited > self.health_fallback {
            session.advance_to(SessionStatus::Ready);
            warn!(
                session_id = %session.session_id,
                promotion = "fallback",
                passed_checks = health.passed_checks(),
                waited_seconds = waited.as_secs(),
                "session ready without passing health checks"
            );
        } else {
            session.advance_to(SessionStatus::Provisioning);
            session.provisioning_stage = Some(ProvisioningStage::WaitingHealthChecks);
            debug!(
                session_id = %session.session_id,
                passed_checks = health.passed_checks(),
                "waiting on health checks"
            );
        }
    }

    /// Create the gateway connection and direct link, each at most once.
    ///
    /// Failures leave the missing fields absent so the next refresh retries.
    async fn ensure_connection(&self, session: &mut Session) {
        let Some(ip) = session.instance_ip.clone() else {
            return;
        };

        if session.needs_connection() {
            self.adopt_stored_connection(session).await;
        }

        if session.needs_connection() {
            let name = format!("attackbox-{}", short_id(&session.session_id));
            let credentials = Credentials {
                username: self.config.guacamole.rdp_username.clone(),
                password: self.config.guacamole.rdp_password.clone(),
            };

            match self.provisioner.create_connection(&name, &ip, &credentials).await {
                Ok(connection_id) => {
                    info!(session_id = %session.session_id, %connection_id, "connection provisioned");
                    session.connection_info = Some(self.connection_info(&ip, Some(connection_id)));
                }
                Err(err) => {
                    error!(session_id = %session.session_id, %err, "connection provisioning failed");
                    if session.connection_info.is_none() {
                        session.connection_info = Some(self.connection_info(&ip, None));
                    }
                    return;
                }
            }
        }

        let connection_id = session
            .connection_info
            .as_ref()
            .and_then(|info| info.connection_id.clone());
        if let (Some(connection_id), None) = (connection_id, session.direct_url.as_ref()) {
            match self
                .provisioner
                .mint_direct_link(&session.session_id, &connection_id, &session.student_id)
                .await
            {
                Ok(url) => session.direct_url = Some(url),
                Err(err) => {
                    warn!(session_id = %session.session_id, %err, "direct link not minted, retrying next poll");
                }
            }
        }
    }

    /// Take over a connection an overlapping refresh already stored.
    async fn adopt_stored_connection(&self, session: &mut Session) {
        match self.sessions.get_by_id(&session.session_id).await {
            Ok(stored) if !stored.needs_connection() => {
                debug!(session_id = %session.session_id, "connection already stored, reusing it");
                session.connection_info = stored.connection_info;
                session.direct_url = stored.direct_url;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(session_id = %session.session_id, %err, "could not re-read session before provisioning");
            }
        }
    }

    fn connection_info(&self, ip: &str, connection_id: Option<String>) -> ConnectionInfo {
        let guacamole = &self.config.guacamole;
        ConnectionInfo {
            kind: "guacamole".into(),
            base_url: Some(self.provisioner.public_url()),
            connection_id,
            instance_ip: ip.to_owned(),
            rdp_port: guacamole.rdp_port,
            vnc_port: guacamole.vnc_port,
            ssh_port: guacamole.ssh_port,
        }
    }

    /// Write `after` back if it differs meaningfully from `before`.
    ///
    /// The write is guarded on the status, instance and connection id read at
    /// the start of the refresh. On a lost race the stored record wins and is
    /// returned; a claim made during this refresh is handed back to the pool.
    async fn persist(&self, before: &Session, mut after: Session, now: DateTime<Utc>) -> Result<Session> {
        let changed = before.status != after.status
            || before.instance_id != after.instance_id
            || before.connection_info != after.connection_info
            || before.direct_url != after.direct_url
            || before.error != after.error
            || before.termination_reason != after.termination_reason;
        if !changed {
            return Ok(after);
        }

        after.updated_at = now;
        if self.sessions.write_refresh(&after, before).await? {
            if before.status != after.status {
                info!(
                    session_id = %after.session_id,
                    from = ?before.status,
                    to = ?after.status,
                    "session status changed"
                );
            }
            return Ok(after);
        }

        warn!(session_id = %after.session_id, "session changed concurrently, keeping stored record");
        if before.instance_id.is_none() {
            if let Some(instance_id) = after.instance_id.as_deref() {
                self.allocator.release(instance_id, &after.session_id).await;
            }
        }
        self.sessions.get_by_id(&after.session_id).await
    }
}
