//! Persistence layer modules.

pub mod db;
pub mod lab_session_repo;
pub mod pool_repo;
pub mod schema;
pub mod session_repo;
pub mod template_repo;

use chrono::{DateTime, Utc};

use crate::{AppError, Result};

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Parse an RFC 3339 column value.
pub(crate) fn parse_timestamp(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}

/// Parse an optional RFC 3339 column value.
pub(crate) fn parse_optional_timestamp(
    raw: Option<&str>,
    column: &str,
) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_timestamp(s, column)).transpose()
}
