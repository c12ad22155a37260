//! Pool instance repository for `SQLite` persistence.
//!
//! The claim is a single conditional `UPDATE`: exactly one concurrent
//! caller can move a row from `available` to `assigned`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::pool::{PoolInstance, PoolStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::parse_optional_timestamp;

/// Repository for pool instance records.
#[derive(Clone)]
pub struct PoolRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct PoolRow {
    instance_id: String,
    status: String,
    session_id: Option<String>,
    student_id: Option<String>,
    assigned_at: Option<String>,
}

impl PoolRow {
    fn into_instance(self) -> Result<PoolInstance> {
        Ok(PoolInstance {
            instance_id: self.instance_id,
            status: parse_status(&self.status)?,
            session_id: self.session_id,
            student_id: self.student_id,
            assigned_at: parse_optional_timestamp(self.assigned_at.as_deref(), "assigned_at")?,
        })
    }
}

fn parse_status(s: &str) -> Result<PoolStatus> {
    match s {
        "available" => Ok(PoolStatus::Available),
        "assigned" => Ok(PoolStatus::Assigned),
        other => Err(AppError::Db(format!("invalid pool status: {other}"))),
    }
}

fn status_str(status: PoolStatus) -> &'static str {
    match status {
        PoolStatus::Available => "available",
        PoolStatus::Assigned => "assigned",
    }
}

impl PoolRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Register an instance in the pool.
    ///
    /// Returns `false` if the instance was already registered.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn register(&self, instance: &PoolInstance) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO pool_instance (instance_id, status, session_id, student_id, assigned_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(instance_id) DO NOTHING",
        )
        .bind(&instance.instance_id)
        .bind(status_str(instance.status))
        .bind(&instance.session_id)
        .bind(&instance.student_id)
        .bind(instance.assigned_at.map(|ts| ts.to_rfc3339()))
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Retrieve a pool instance by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the instance is not registered.
    pub async fn get(&self, instance_id: &str) -> Result<PoolInstance> {
        let row: Option<PoolRow> = sqlx::query_as(
            "SELECT instance_id, status, session_id, student_id, assigned_at
             FROM pool_instance WHERE instance_id = ?1",
        )
        .bind(instance_id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(PoolRow::into_instance)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("pool instance {instance_id} not found")))
    }

    /// List pool instances in `status`, ordered by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_status(&self, status: PoolStatus) -> Result<Vec<PoolInstance>> {
        let rows: Vec<PoolRow> = sqlx::query_as(
            "SELECT instance_id, status, session_id, student_id, assigned_at
             FROM pool_instance WHERE status = ?1 ORDER BY instance_id ASC",
        )
        .bind(status_str(status))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(PoolRow::into_instance).collect()
    }

    /// List every pool instance, ordered by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_all(&self) -> Result<Vec<PoolInstance>> {
        let rows: Vec<PoolRow> = sqlx::query_as(
            "SELECT instance_id, status, session_id, student_id, assigned_at
             FROM pool_instance ORDER BY instance_id ASC",
        )
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(PoolRow::into_instance).collect()
    }

    /// Atomically claim `instance_id` for a session.
    ///
    /// Succeeds only if the stored status is still `available`; returns
    /// `false` when another caller won the race.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn claim(
        &self,
        instance_id: &str,
        session_id: &str,
        student_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pool_instance
             SET status = 'assigned', session_id = ?1, student_id = ?2, assigned_at = ?3
             WHERE instance_id = ?4 AND status = 'available'",
        )
        .bind(session_id)
        .bind(student_id)
        .bind(now.to_rfc3339())
        .bind(instance_id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Return an instance to the pool if `session_id` still holds it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn release(&self, instance_id: &str, session_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pool_instance
             SET status = 'available', session_id = NULL, student_id = NULL, assigned_at = NULL
             WHERE instance_id = ?1 AND status = 'assigned' AND session_id = ?2",
        )
        .bind(instance_id)
        .bind(session_id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Return an instance to the pool regardless of holder (operator use).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn force_release(&self, instance_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pool_instance
             SET status = 'available', session_id = NULL, student_id = NULL, assigned_at = NULL
             WHERE instance_id = ?1",
        )
        .bind(instance_id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
