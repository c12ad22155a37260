//! Session repository for `SQLite` persistence.

use std::sync::Arc;

use crate::models::instance::{HealthChecks, InstanceState};
use crate::models::session::{ConnectionInfo, Session, SessionStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::parse_timestamp;

const SELECT_COLUMNS: &str = "SELECT session_id, student_id, student_name, course_id, lab_id, \
     status, instance_id, instance_ip, instance_state, health_checks, connection_info, \
     direct_url, created_at, updated_at, expires_at, error, termination_reason FROM session";

/// Repository wrapper around `SQLite` for pooled session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    student_id: String,
    student_name: Option<String>,
    course_id: Option<String>,
    lab_id: Option<String>,
    status: String,
    instance_id: Option<String>,
    instance_ip: Option<String>,
    instance_state: Option<String>,
    health_checks: Option<String>,
    connection_info: Option<String>,
    direct_url: Option<String>,
    created_at: String,
    updated_at: String,
    expires_at: String,
    error: Option<String>,
    termination_reason: Option<String>,
}

impl SessionRow {
    /// Convert a database row into the domain model.
    fn into_session(self) -> Result<Session> {
        let health_checks = self
            .health_checks
            .as_deref()
            .map(serde_json::from_str::<HealthChecks>)
            .transpose()?;
        let connection_info = self
            .connection_info
            .as_deref()
            .map(serde_json::from_str::<ConnectionInfo>)
            .transpose()?;

        Ok(Session {
            session_id: self.session_id,
            student_id: self.student_id,
            student_name: self.student_name,
            course_id: self.course_id,
            lab_id: self.lab_id,
            status: parse_status(&self.status)?,
            instance_id: self.instance_id,
            instance_ip: self.instance_ip,
            instance_state: self.instance_state.as_deref().map(InstanceState::parse),
            health_checks,
            connection_info,
            direct_url: self.direct_url,
            provisioning_stage: None,
            created_at: parse_timestamp(&self.created_at, "created_at")?,
            updated_at: parse_timestamp(&self.updated_at, "updated_at")?,
            expires_at: parse_timestamp(&self.expires_at, "expires_at")?,
            error: self.error,
            termination_reason: self.termination_reason,
        })
    }
}

/// Parse a stored session status.
///
/// # Errors
///
/// Returns `AppError::Db` for values outside the closed status set.
pub fn parse_status(s: &str) -> Result<SessionStatus> {
    match s {
        "pending" => Ok(SessionStatus::Pending),
        "provisioning" => Ok(SessionStatus::Provisioning),
        "ready" => Ok(SessionStatus::Ready),
        "active" => Ok(SessionStatus::Active),
        "terminating" => Ok(SessionStatus::Terminating),
        "terminated" => Ok(SessionStatus::Terminated),
        "error" => Ok(SessionStatus::Error),
        other => Err(AppError::Db(format!("invalid session status: {other}"))),
    }
}

/// Storage representation of a session status.
#[must_use]
pub fn status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Pending => "pending",
        SessionStatus::Provisioning => "provisioning",
        SessionStatus::Ready => "ready",
        SessionStatus::Active => "active",
        SessionStatus::Terminating => "terminating",
        SessionStatus::Terminated => "terminated",
        SessionStatus::Error => "error",
    }
}

fn to_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(AppError::from)
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, session: &Session) -> Result<Session> {
        sqlx::query(
            "INSERT INTO session (session_id, student_id, student_name, course_id, lab_id,
                 status, instance_id, instance_ip, instance_state, health_checks,
                 connection_info, direct_url, created_at, updated_at, expires_at,
                 error, termination_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        )
        .bind(&session.session_id)
        .bind(&session.student_id)
        .bind(&session.student_name)
        .bind(&session.course_id)
        .bind(&session.lab_id)
        .bind(status_str(session.status))
        .bind(&session.instance_id)
        .bind(&session.instance_ip)
        .bind(session.instance_state.map(InstanceState::as_str))
        .bind(to_json(session.health_checks.as_ref())?)
        .bind(to_json(session.connection_info.as_ref())?)
        .bind(&session.direct_url)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .bind(session.expires_at.to_rfc3339())
        .bind(&session.error)
        .bind(&session.termination_reason)
        .execute(self.db.as_ref())
        .await?;

        Ok(session.clone())
    }

    /// Retrieve a session by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn get_by_id(&self, id: &str) -> Result<Session> {
        let query = format!("{SELECT_COLUMNS} WHERE session_id = ?1");
        let row: Option<SessionRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(SessionRow::into_session)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))
    }

    /// List all sessions owned by a student, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_student(&self, student_id: &str) -> Result<Vec<Session>> {
        let query = format!("{SELECT_COLUMNS} WHERE student_id = ?1 ORDER BY created_at DESC");
        let rows: Vec<SessionRow> = sqlx::query_as(&query)
            .bind(student_id)
            .fetch_all(self.db.as_ref())
            .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Most recent non-terminal session held by a student, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find_active_for_student(&self, student_id: &str) -> Result<Option<Session>> {
        let query = format!(
            "{SELECT_COLUMNS} WHERE student_id = ?1 \
             AND status IN ('pending','provisioning','ready','active') \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row: Option<SessionRow> = sqlx::query_as(&query)
            .bind(student_id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// List sessions in a given status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        let query = format!("{SELECT_COLUMNS} WHERE status = ?1 ORDER BY created_at ASC");
        let rows: Vec<SessionRow> = sqlx::query_as(&query)
            .bind(status_str(status))
            .fetch_all(self.db.as_ref())
            .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Persist every mutable field of `session`, but only if the stored
    /// status still equals `expected`.
    ///
    /// Returns `false` when another writer changed the status first; the
    /// stored record is left untouched in that case.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn write_back(&self, session: &Session, expected: SessionStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE session SET status = ?1, instance_id = ?2, instance_ip = ?3,
                 instance_state = ?4, health_checks = ?5, connection_info = ?6,
                 direct_url = ?7, updated_at = ?8, error = ?9, termination_reason = ?10
             WHERE session_id = ?11 AND status = ?12",
        )
        .bind(status_str(session.status))
        .bind(&session.instance_id)
        .bind(&session.instance_ip)
        .bind(session.instance_state.map(InstanceState::as_str))
        .bind(to_json(session.health_checks.as_ref())?)
        .bind(to_json(session.connection_info.as_ref())?)
        .bind(&session.direct_url)
        .bind(session.updated_at.to_rfc3339())
        .bind(&session.error)
        .bind(&session.termination_reason)
        .bind(&session.session_id)
        .bind(status_str(expected))
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Persist a refresh result computed from the snapshot `before`.
    ///
    /// Stricter than [`write_back`](Self::write_back): the stored status,
    /// instance assignment and gateway connection id must all still match
    /// `before`. Overlapping refreshes of the same record therefore cannot
    /// reassign the instance or replace a connection another refresh stored.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn write_refresh(&self, session: &Session, before: &Session) -> Result<bool> {
        let expected_connection = before
            .connection_info
            .as_ref()
            .and_then(|info| info.connection_id.clone());

        let result = sqlx::query(
            "UPDATE session SET status = ?1, instance_id = ?2, instance_ip = ?3,
                 instance_state = ?4, health_checks = ?5, connection_info = ?6,
                 direct_url = ?7, updated_at = ?8, error = ?9, termination_reason = ?10
             WHERE session_id = ?11 AND status = ?12 AND instance_id IS ?13
                 AND json_extract(connection_info, '$.connection_id') IS ?14",
        )
        .bind(status_str(session.status))
        .bind(&session.instance_id)
        .bind(&session.instance_ip)
        .bind(session.instance_state.map(InstanceState::as_str))
        .bind(to_json(session.health_checks.as_ref())?)
        .bind(to_json(session.connection_info.as_ref())?)
        .bind(&session.direct_url)
        .bind(session.updated_at.to_rfc3339())
        .bind(&session.error)
        .bind(&session.termination_reason)
        .bind(&session.session_id)
        .bind(status_str(before.status))
        .bind(&before.instance_id)
        .bind(expected_connection)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
