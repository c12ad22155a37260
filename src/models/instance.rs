//! Compute instance lifecycle and health snapshot types.

use serde::{Deserialize, Serialize};

/// Lifecycle state reported by the compute backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Booting; not yet running.
    Pending,
    /// Running and addressable.
    Running,
    /// Stop requested.
    Stopping,
    /// Termination requested.
    ShuttingDown,
    /// Stopped.
    Stopped,
    /// Gone.
    Terminated,
    /// Any state this engine does not recognize.
    #[serde(other)]
    Unknown,
}

impl InstanceState {
    /// Stable wire/storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::ShuttingDown => "shutting-down",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::Unknown => "unknown",
        }
    }

    /// Parse the storage representation; unrecognized values map to `Unknown`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "shutting-down" => Self::ShuttingDown,
            "stopped" => Self::Stopped,
            "terminated" => Self::Terminated,
            _ => Self::Unknown,
        }
    }
}

/// Result of a single backend health check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Check passed.
    Ok,
    /// Check still running after boot.
    Initializing,
    /// Check failed.
    Impaired,
    /// No result available.
    #[default]
    #[serde(other)]
    Unknown,
}

/// System and instance health checks for one instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct HealthChecks {
    /// Host-level reachability check.
    pub system_status: CheckStatus,
    /// Guest-level reachability check.
    pub instance_status: CheckStatus,
}

impl HealthChecks {
    /// Number of check dimensions reported.
    pub const TOTAL: u32 = 2;

    /// Construct a snapshot where both dimensions passed.
    #[must_use]
    pub fn passing() -> Self {
        Self {
            system_status: CheckStatus::Ok,
            instance_status: CheckStatus::Ok,
        }
    }

    /// Construct a snapshot still initializing on both dimensions.
    #[must_use]
    pub fn initializing() -> Self {
        Self {
            system_status: CheckStatus::Initializing,
            instance_status: CheckStatus::Initializing,
        }
    }

    /// Number of dimensions currently passing.
    #[must_use]
    pub fn passed_checks(&self) -> u32 {
        u32::from(self.system_status == CheckStatus::Ok)
            + u32::from(self.instance_status == CheckStatus::Ok)
    }

    /// Both dimensions pass. A partial pass is not ready.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.passed_checks() == Self::TOTAL
    }

    /// Either dimension is still initializing.
    #[must_use]
    pub fn is_initializing(&self) -> bool {
        self.system_status == CheckStatus::Initializing
            || self.instance_status == CheckStatus::Initializing
    }
}

/// Point-in-time view of an instance as reported by the compute backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct InstanceSnapshot {
    /// Backend identity.
    pub instance_id: String,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Private network address, once assigned.
    #[serde(default)]
    pub private_ip: Option<String>,
    /// Health-check snapshot; meaningful only while running.
    #[serde(default)]
    pub health: HealthChecks,
}

impl InstanceSnapshot {
    /// Running with a known network address.
    #[must_use]
    pub fn is_addressable(&self) -> bool {
        self.state == InstanceState::Running
            && self.private_ip.as_deref().is_some_and(|ip| !ip.is_empty())
    }
}
