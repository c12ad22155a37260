//! Remote-desktop connection provisioning.
//!
//! Failures surface as [`AppError::Provisioner`](crate::AppError::Provisioner);
//! the lifecycle engine never lets them abort a refresh.

pub mod guacamole;

use crate::compute::BoxFuture;
use crate::Result;

/// Desktop login used by the gateway to reach the instance.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Desktop user.
    pub username: String,
    /// Desktop password.
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Creates named remote-desktop connections and one-time access links.
pub trait ConnectionProvisioner: Send + Sync {
    /// Create a connection to `target_address`, returning its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Provisioner`](crate::AppError::Provisioner) on failure.
    fn create_connection<'a>(
        &'a self,
        name: &'a str,
        target_address: &'a str,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<String>>;

    /// Mint a direct-access link to `connection_id` scoped to one session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Provisioner`](crate::AppError::Provisioner) on failure.
    fn mint_direct_link<'a>(
        &'a self,
        session_id: &'a str,
        connection_id: &'a str,
        subject: &'a str,
    ) -> BoxFuture<'a, Result<String>>;

    /// Student-facing gateway URL recorded in connection info.
    fn public_url(&self) -> String;
}

/// Trailing eight characters of a session id, used in gateway names.
#[must_use]
pub fn short_id(session_id: &str) -> &str {
    let start = session_id
        .char_indices()
        .rev()
        .nth(7)
        .map_or(0, |(idx, _)| idx);
    &session_id[start..]
}
