//! Pool instance model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Assignment status of a pool instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Free to be claimed.
    Available,
    /// Held by exactly one session.
    Assigned,
}

/// One reusable compute unit in the shared pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PoolInstance {
    /// Primary key; matches the compute backend identity.
    pub instance_id: String,
    /// Assignment status.
    pub status: PoolStatus,
    /// Holding session, when assigned.
    pub session_id: Option<String>,
    /// Holding student, when assigned.
    pub student_id: Option<String>,
    /// Claim timestamp.
    pub assigned_at: Option<DateTime<Utc>>,
}

impl PoolInstance {
    /// Construct an `available` pool entry.
    #[must_use]
    pub fn available(instance_id: String) -> Self {
        Self {
            instance_id,
            status: PoolStatus::Available,
            session_id: None,
            student_id: None,
            assigned_at: None,
        }
    }
}
