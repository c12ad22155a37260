//! Compute backend abstraction.
//!
//! The [`ComputeBackend`] trait is the only way the engines learn about
//! live instances. Every call is a remote round trip; failures surface as
//! [`AppError::Backend`](crate::AppError::Backend) and are absorbed by the
//! callers so the next poll can retry.

pub mod http;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::models::instance::InstanceSnapshot;
use crate::Result;

/// Boxed future returned by collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Parameters for launching a dedicated lab instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Machine image to boot.
    pub image_id: String,
    /// Instance shape.
    pub instance_type: String,
    /// Boot script.
    pub user_data: Option<String>,
    /// Display name tag.
    pub name: String,
    /// Additional key/value tags.
    pub tags: Vec<(String, String)>,
}

/// Identity of a freshly launched instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchedInstance {
    /// Backend identity.
    pub instance_id: String,
    /// Shape actually launched.
    pub instance_type: String,
}

/// Point-in-time instance state provider.
pub trait ComputeBackend: Send + Sync {
    /// Describe an instance. `Ok(None)` means the backend does not know it.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`](crate::AppError::Backend) if the call fails.
    fn describe<'a>(&'a self, instance_id: &'a str)
        -> BoxFuture<'a, Result<Option<InstanceSnapshot>>>;

    /// Launch a dedicated instance.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`](crate::AppError::Backend) if the launch is rejected.
    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> BoxFuture<'a, Result<LaunchedInstance>>;

    /// Request termination. `Ok(false)` means the backend did not confirm.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backend`](crate::AppError::Backend) if the call fails.
    fn terminate<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, Result<bool>>;
}
