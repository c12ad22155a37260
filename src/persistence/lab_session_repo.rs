//! Lab session repository for `SQLite` persistence.

use std::sync::Arc;

use crate::models::lab_session::{LabSession, LabSessionStatus};
use crate::models::template::TemplateService;
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_optional_timestamp, parse_timestamp};

const SELECT_COLUMNS: &str = "SELECT session_id, user_id, template_id, template_name, \
     course_id, connection_method, lab_type, status, instance_id, instance_type, target_ip, \
     services, created_at, updated_at, expires_at, terminated_at, error FROM lab_session";

/// Outcome of [`LabSessionRepo::insert_guarded`].
#[derive(Debug, Clone)]
pub enum LabInsert {
    /// The record was stored.
    Inserted(LabSession),
    /// The user already holds an active session for the template.
    Existing(LabSession),
    /// The user is at the active-session limit.
    AtCapacity,
}

/// Repository for template-backed lab session records.
#[derive(Clone)]
pub struct LabSessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct LabSessionRow {
    session_id: String,
    user_id: String,
    template_id: String,
    template_name: String,
    course_id: Option<String>,
    connection_method: String,
    lab_type: String,
    status: String,
    instance_id: Option<String>,
    instance_type: Option<String>,
    target_ip: Option<String>,
    services: String,
    created_at: String,
    updated_at: String,
    expires_at: String,
    terminated_at: Option<String>,
    error: Option<String>,
}

impl LabSessionRow {
    fn into_lab_session(self) -> Result<LabSession> {
        let services: Vec<TemplateService> = serde_json::from_str(&self.services)?;

        Ok(LabSession {
            session_id: self.session_id,
            user_id: self.user_id,
            template_id: self.template_id,
            template_name: self.template_name,
            course_id: self.course_id,
            connection_method: self.connection_method,
            lab_type: self.lab_type,
            status: parse_status(&self.status)?,
            instance_id: self.instance_id,
            instance_type: self.instance_type,
            target_ip: self.target_ip,
            services,
            created_at: parse_timestamp(&self.created_at, "created_at")?,
            updated_at: parse_timestamp(&self.updated_at, "updated_at")?,
            expires_at: parse_timestamp(&self.expires_at, "expires_at")?,
            terminated_at: parse_optional_timestamp(
                self.terminated_at.as_deref(),
                "terminated_at",
            )?,
            error: self.error,
        })
    }
}

fn parse_status(s: &str) -> Result<LabSessionStatus> {
    match s {
        "pending" => Ok(LabSessionStatus::Pending),
        "launching" => Ok(LabSessionStatus::Launching),
        "running" => Ok(LabSessionStatus::Running),
        "terminating" => Ok(LabSessionStatus::Terminating),
        "terminated" => Ok(LabSessionStatus::Terminated),
        "error" => Ok(LabSessionStatus::Error),
        other => Err(AppError::Db(format!("invalid lab session status: {other}"))),
    }
}

fn status_str(status: LabSessionStatus) -> &'static str {
    match status {
        LabSessionStatus::Pending => "pending",
        LabSessionStatus::Launching => "launching",
        LabSessionStatus::Running => "running",
        LabSessionStatus::Terminating => "terminating",
        LabSessionStatus::Terminated => "terminated",
        LabSessionStatus::Error => "error",
    }
}

impl LabSessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new lab session record unless the user already holds an
    /// active session for the same template or `limit` active sessions.
    ///
    /// Both checks run inside the single `INSERT … SELECT` statement, and the
    /// partial unique index on `(user_id, template_id)` rejects a concurrent
    /// duplicate, so two racing creates can never both be recorded.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn insert_guarded(&self, session: &LabSession, limit: u32) -> Result<LabInsert> {
        let result = sqlx::query(
            "INSERT INTO lab_session (session_id, user_id, template_id, template_name,
                 course_id, connection_method, lab_type, status, instance_id, instance_type,
                 target_ip, services, created_at, updated_at, expires_at, terminated_at, error)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17
             WHERE (SELECT COUNT(*) FROM lab_session
                    WHERE user_id = ?2 AND status IN ('pending','launching','running')) < ?18",
        )
        .bind(&session.session_id)
        .bind(&session.user_id)
        .bind(&session.template_id)
        .bind(&session.template_name)
        .bind(&session.course_id)
        .bind(&session.connection_method)
        .bind(&session.lab_type)
        .bind(status_str(session.status))
        .bind(&session.instance_id)
        .bind(&session.instance_type)
        .bind(&session.target_ip)
        .bind(serde_json::to_string(&session.services)?)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .bind(session.expires_at.to_rfc3339())
        .bind(session.terminated_at.map(|ts| ts.to_rfc3339()))
        .bind(&session.error)
        .bind(i64::from(limit))
        .execute(self.db.as_ref())
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(LabInsert::Inserted(session.clone())),
            Ok(_) => Ok(self
                .find_active(&session.user_id, &session.template_id)
                .await?
                .map_or(LabInsert::AtCapacity, LabInsert::Existing)),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => self
                .find_active(&session.user_id, &session.template_id)
                .await?
                .map(LabInsert::Existing)
                .ok_or_else(|| {
                    AppError::Db(format!(
                        "active lab session for {} / {} vanished during insert",
                        session.user_id, session.template_id
                    ))
                }),
            Err(err) => Err(err.into()),
        }
    }

    /// The user's active session for `template_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find_active(&self, user_id: &str, template_id: &str) -> Result<Option<LabSession>> {
        let query = format!(
            "{SELECT_COLUMNS} WHERE user_id = ?1 AND template_id = ?2 \
             AND status IN ('pending','launching','running') LIMIT 1"
        );
        let row: Option<LabSessionRow> = sqlx::query_as(&query)
            .bind(user_id)
            .bind(template_id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(LabSessionRow::into_lab_session).transpose()
    }

    /// Retrieve a lab session by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn get_by_id(&self, id: &str) -> Result<LabSession> {
        let query = format!("{SELECT_COLUMNS} WHERE session_id = ?1");
        let row: Option<LabSessionRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(LabSessionRow::into_lab_session)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("lab session {id} not found")))
    }

    /// List the user's sessions that count against the concurrency limit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_active_by_user(&self, user_id: &str) -> Result<Vec<LabSession>> {
        let query = format!(
            "{SELECT_COLUMNS} WHERE user_id = ?1 \
             AND status IN ('pending','launching','running') \
             ORDER BY created_at ASC"
        );
        let rows: Vec<LabSessionRow> = sqlx::query_as(&query)
            .bind(user_id)
            .fetch_all(self.db.as_ref())
            .await?;

        rows.into_iter().map(LabSessionRow::into_lab_session).collect()
    }

    /// Persist the mutable fields of `session` if the stored status still
    /// equals `expected`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn save(&self, session: &LabSession, expected: LabSessionStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE lab_session SET status = ?1, instance_id = ?2, instance_type = ?3,
                 target_ip = ?4, updated_at = ?5, terminated_at = ?6, error = ?7
             WHERE session_id = ?8 AND status = ?9",
        )
        .bind(status_str(session.status))
        .bind(&session.instance_id)
        .bind(&session.instance_type)
        .bind(&session.target_ip)
        .bind(session.updated_at.to_rfc3339())
        .bind(session.terminated_at.map(|ts| ts.to_rfc3339()))
        .bind(&session.error)
        .bind(&session.session_id)
        .bind(status_str(expected))
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
