//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

const KEYRING_SERVICE: &str = "lab-orchestrator";

/// Pool allocation and readiness thresholds (seconds).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PoolConfig {
    /// Waiting time without an instance before a soft warning is logged.
    #[serde(default = "default_warning_seconds")]
    pub warning_seconds: u64,
    /// Waiting time without an instance before the session errors out.
    #[serde(default = "default_fatal_seconds")]
    pub fatal_seconds: u64,
    /// Running time after which a session is promoted without passing
    /// health checks.
    #[serde(default = "default_health_fallback_seconds")]
    pub health_fallback_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            warning_seconds: default_warning_seconds(),
            fatal_seconds: default_fatal_seconds(),
            health_fallback_seconds: default_health_fallback_seconds(),
        }
    }
}

fn default_warning_seconds() -> u64 {
    240
}

fn default_fatal_seconds() -> u64 {
    300
}

fn default_health_fallback_seconds() -> u64 {
    120
}

/// Pooled session settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Session lifetime from creation.
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u32,
    /// Number of historical sessions returned per student listing.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_ttl_hours() -> u32 {
    4
}

fn default_history_limit() -> usize {
    10
}

/// Template-backed lab session settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LabConfig {
    /// Lab session lifetime from creation.
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u32,
    /// Concurrent active lab sessions allowed per user.
    #[serde(default = "default_max_active_sessions")]
    pub max_active_sessions: u32,
    /// Instance shape used when a template does not name one.
    #[serde(default = "default_instance_type")]
    pub default_instance_type: String,
    /// Prefix applied to launched instance names.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            max_active_sessions: default_max_active_sessions(),
            default_instance_type: default_instance_type(),
            name_prefix: default_name_prefix(),
        }
    }
}

fn default_max_active_sessions() -> u32 {
    1
}

fn default_instance_type() -> String {
    "t3.micro".into()
}

fn default_name_prefix() -> String {
    "cyberlab-lab".into()
}

/// Compute control-plane connectivity.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ComputeConfig {
    /// Base URL of the compute control plane.
    pub api_url: String,
    /// Per-request timeout for control-plane calls.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout_seconds() -> u64 {
    10
}

/// Guacamole remote-desktop gateway settings.
///
/// Passwords are loaded at runtime via OS keychain or environment variables,
/// not from the TOML config file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GuacamoleConfig {
    /// URL the orchestrator uses for REST calls.
    pub api_url: String,
    /// Student-facing URL used in direct links; defaults to `api_url`.
    #[serde(default)]
    pub public_url: Option<String>,
    /// Administrative account used to create connections.
    #[serde(default = "default_admin_user")]
    pub admin_user: String,
    /// Guacamole data source holding connections and users.
    #[serde(default = "default_data_source")]
    pub data_source: String,
    /// Desktop login on the lab instances.
    #[serde(default = "default_rdp_username")]
    pub rdp_username: String,
    /// RDP port advertised in connection info.
    #[serde(default = "default_rdp_port")]
    pub rdp_port: u16,
    /// VNC port advertised in connection info.
    #[serde(default = "default_vnc_port")]
    pub vnc_port: u16,
    /// SSH port advertised in connection info.
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// Per-request timeout for gateway calls.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Administrative password (populated at runtime).
    #[serde(skip)]
    pub admin_password: String,
    /// Desktop password on the lab instances (populated at runtime).
    #[serde(skip)]
    pub rdp_password: String,
}

impl GuacamoleConfig {
    /// Student-facing base URL.
    #[must_use]
    pub fn public_base_url(&self) -> &str {
        self.public_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .unwrap_or(&self.api_url)
    }
}

fn default_admin_user() -> String {
    "guacadmin".into()
}

fn default_data_source() -> String {
    "postgresql".into()
}

fn default_rdp_username() -> String {
    "kali".into()
}

fn default_rdp_port() -> u16 {
    3389
}

fn default_vnc_port() -> u16 {
    5901
}

fn default_ssh_port() -> u16 {
    22
}

fn default_http_port() -> u16 {
    8080
}

fn default_http_bind() -> String {
    "127.0.0.1".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` database file holding all status records.
    pub db_path: PathBuf,
    /// HTTP listen port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// HTTP listen address.
    #[serde(default = "default_http_bind")]
    pub http_bind: String,
    /// Pool allocation thresholds.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Pooled session settings.
    #[serde(default)]
    pub sessions: SessionConfig,
    /// Lab session settings.
    #[serde(default)]
    pub labs: LabConfig,
    /// Compute control plane.
    pub compute: ComputeConfig,
    /// Remote-desktop gateway.
    pub guacamole: GuacamoleConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load Guacamole secrets from OS keychain with env-var fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither keychain nor env vars provide
    /// the required secrets.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.guacamole.admin_password =
            load_credential("guacamole_admin_password", "GUACAMOLE_ADMIN_PASS").await?;
        self.guacamole.rdp_password = load_credential("rdp_password", "RDP_PASSWORD").await?;
        Ok(())
    }

    /// Waiting time before the soft allocation warning.
    #[must_use]
    pub fn allocation_warning(&self) -> Duration {
        Duration::from_secs(self.pool.warning_seconds)
    }

    /// Waiting time before allocation is declared failed.
    #[must_use]
    pub fn allocation_fatal(&self) -> Duration {
        Duration::from_secs(self.pool.fatal_seconds)
    }

    /// Bounded wait before promoting a running instance without health checks.
    #[must_use]
    pub fn health_fallback(&self) -> Duration {
        Duration::from_secs(self.pool.health_fallback_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.pool.fatal_seconds <= self.pool.warning_seconds {
            return Err(AppError::Config(
                "pool.fatal_seconds must be greater than pool.warning_seconds".into(),
            ));
        }

        if self.sessions.ttl_hours == 0 || self.labs.ttl_hours == 0 {
            return Err(AppError::Config("ttl_hours must be greater than zero".into()));
        }

        if self.labs.max_active_sessions == 0 {
            return Err(AppError::Config(
                "labs.max_active_sessions must be greater than zero".into(),
            ));
        }

        if self.compute.request_timeout_seconds == 0 || self.guacamole.request_timeout_seconds == 0 {
            return Err(AppError::Config(
                "request_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.compute.api_url.trim().is_empty() {
            return Err(AppError::Config("compute.api_url must not be empty".into()));
        }

        if self.guacamole.api_url.trim().is_empty() {
            return Err(AppError::Config(
                "guacamole.api_url must not be empty".into(),
            ));
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key).map_err(|_| {
        AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}
