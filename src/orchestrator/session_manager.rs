//! Pooled session operations: create, read, heartbeat, terminate, list.
//!
//! Every read goes through the [`LifecycleEngine`] so callers always see
//! fresh status. Ownership is checked before any mutation on behalf of a
//! student.

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use crate::compute::ComputeBackend;
use crate::config::GlobalConfig;
use crate::models::session::{Session, SessionStatus};
use crate::persistence::db::Database;
use crate::persistence::session_repo::SessionRepo;
use crate::provisioner::ConnectionProvisioner;
use crate::{AppError, Result};

use super::lifecycle::LifecycleEngine;
use super::stage::SessionView;

/// Termination reason used when the caller gives none.
pub const REASON_USER_REQUESTED: &str = "user_requested";

/// Input for [`SessionManager::create_session`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSessionRequest {
    /// Owning student.
    #[serde(default)]
    pub student_id: String,
    /// Display name.
    pub student_name: Option<String>,
    /// Originating course.
    pub course_id: Option<String>,
    /// Originating lab/activity.
    pub lab_id: Option<String>,
}

/// Result of [`SessionManager::create_session`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionCreated {
    /// `true` when an already-active session was returned instead.
    pub existing: bool,
    /// The (possibly refreshed) session.
    pub session: SessionView,
}

/// Result of [`SessionManager::list_student_sessions`].
#[derive(Debug, Clone, Serialize)]
pub struct StudentSessions {
    /// Student the listing belongs to.
    pub student_id: String,
    /// Sessions still holding or awaiting compute.
    pub active_sessions: Vec<SessionView>,
    /// Most recent sessions, newest first, capped at the history limit.
    pub sessions: Vec<SessionView>,
    /// Total sessions ever recorded for the student.
    pub total_sessions: usize,
}

/// High-level pooled session operations.
#[derive(Clone)]
pub struct SessionManager {
    config: Arc<GlobalConfig>,
    sessions: SessionRepo,
    lifecycle: LifecycleEngine,
}

impl SessionManager {
    /// Wire the manager to the store and collaborators.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        db: Arc<Database>,
        compute: Arc<dyn ComputeBackend>,
        provisioner: Arc<dyn ConnectionProvisioner>,
    ) -> Self {
        Self {
            sessions: SessionRepo::new(Arc::clone(&db)),
            lifecycle: LifecycleEngine::new(Arc::clone(&config), db, compute, provisioner),
            config,
        }
    }

    /// The lifecycle engine backing every read.
    #[must_use]
    pub fn lifecycle(&self) -> &LifecycleEngine {
        &self.lifecycle
    }

    /// Start a pooled session, or return the student's active one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an empty student id, or
    /// `AppError::Db` if the store fails.
    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<SessionCreated> {
        let student_id = request.student_id.trim().to_owned();
        if student_id.is_empty() {
            return Err(AppError::Validation("student_id is required".into()));
        }

        let span = info_span!("create_session", student_id = %student_id);
        async move {
            if let Some(existing) = self.sessions.find_active_for_student(&student_id).await? {
                let refreshed = self.lifecycle.refresh(existing).await?;
                if !refreshed.status.is_terminal() {
                    info!(session_id = %refreshed.session_id, "returning existing session");
                    return Ok(SessionCreated {
                        existing: true,
                        session: SessionView::now(refreshed),
                    });
                }
            }

            let ttl = Duration::hours(i64::from(self.config.sessions.ttl_hours));
            let mut session = Session::new(student_id, ttl);
            session.student_name = request.student_name;
            session.course_id = request.course_id;
            session.lab_id = request.lab_id;

            let created = self.sessions.create(&session).await?;
            info!(session_id = %created.session_id, "session created");

            let refreshed = self.lifecycle.refresh(created).await?;
            Ok(SessionCreated {
                existing: false,
                session: SessionView::now(refreshed),
            })
        }
        .instrument(span)
        .await
    }

    /// Fetch and refresh one session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionView> {
        let stored = self.sessions.get_by_id(session_id).await?;
        let refreshed = self.lifecycle.refresh(stored).await?;
        Ok(SessionView::now(refreshed))
    }

    /// Record student activity; the first heartbeat on a `ready` session
    /// makes it `active`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Forbidden` on ownership mismatch and
    /// `AppError::Validation` if the session already ended.
    pub async fn heartbeat(&self, session_id: &str, caller: &str) -> Result<SessionView> {
        let stored = self.sessions.get_by_id(session_id).await?;
        ensure_owner(&stored, caller)?;

        let mut session = self.lifecycle.refresh(stored).await?;
        if session.status.is_terminal() {
            return Err(AppError::Validation(format!(
                "session {session_id} has already ended"
            )));
        }

        let expected = session.status;
        if expected == SessionStatus::Ready {
            session.advance_to(SessionStatus::Active);
        }
        session.updated_at = Utc::now();

        if !self.sessions.write_back(&session, expected).await? {
            warn!(session_id, "heartbeat raced with another update");
            session = self.sessions.get_by_id(session_id).await?;
        } else if expected != session.status {
            info!(session_id, "session active");
        }

        Ok(SessionView::now(session))
    }

    /// End a session on behalf of its owner and return its instance to the
    /// pool.
    ///
    /// Terminating an already-ended session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Forbidden` on ownership mismatch,
    /// `AppError::NotFound` for an unknown session, or `AppError::Db` if the
    /// record keeps changing underneath the write.
    pub async fn terminate_session(
        &self,
        session_id: &str,
        caller: &str,
        reason: Option<&str>,
    ) -> Result<SessionView> {
        let span = info_span!("terminate_session", session_id);
        async move {
            let mut session = self.sessions.get_by_id(session_id).await?;
            ensure_owner(&session, caller)?;

            // One retry after re-reading if a refresh wins the race.
            for _ in 0..2 {
                if session.status.is_terminal() {
                    return Ok(SessionView::now(session));
                }

                let expected = session.status;
                session.advance_to(SessionStatus::Terminated);
                session.termination_reason =
                    Some(reason.unwrap_or(REASON_USER_REQUESTED).to_owned());
                session.updated_at = Utc::now();

                if self.sessions.write_back(&session, expected).await? {
                    info!(session_id, reason = ?session.termination_reason, "session terminated");
                    if let Some(instance_id) = session.instance_id.as_deref() {
                        self.lifecycle
                            .allocator()
                            .release(instance_id, &session.session_id)
                            .await;
                    }
                    return Ok(SessionView::now(session));
                }

                session = self.sessions.get_by_id(session_id).await?;
            }

            Err(AppError::Db(format!(
                "session {session_id} changed concurrently during termination"
            )))
        }
        .instrument(span)
        .await
    }

    /// Refresh and list a student's sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store fails.
    pub async fn list_student_sessions(&self, student_id: &str) -> Result<StudentSessions> {
        let stored = self.sessions.list_by_student(student_id).await?;
        let total_sessions = stored.len();

        let refreshed = join_all(stored.into_iter().map(|s| self.lifecycle.refresh(s))).await;
        let mut sessions = refreshed.into_iter().collect::<Result<Vec<_>>>()?;
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let now = Utc::now();
        let active_sessions = sessions
            .iter()
            .filter(|s| SessionStatus::ACTIVE.contains(&s.status))
            .cloned()
            .map(|s| SessionView::at(s, now))
            .collect();

        sessions.truncate(self.config.sessions.history_limit);
        let sessions = sessions
            .into_iter()
            .map(|s| SessionView::at(s, now))
            .collect();

        Ok(StudentSessions {
            student_id: student_id.to_owned(),
            active_sessions,
            sessions,
            total_sessions,
        })
    }
}

fn ensure_owner(session: &Session, caller: &str) -> Result<()> {
    if session.student_id == caller {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "session {} does not belong to {caller}",
            session.session_id
        )))
    }
}
