//! Session orchestration modules.
//!
//! Covers pool allocation, the pooled session lifecycle engine, UI stage
//! estimation, and the template-backed lab session engine.

pub mod allocator;
pub mod lab_manager;
pub mod lifecycle;
pub mod session_manager;
pub mod stage;

use chrono::{DateTime, Utc};

/// Wall-clock time elapsed between `start` and `now`, zero if negative.
pub(crate) fn elapsed_since(start: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (now - start).to_std().unwrap_or_default()
}
