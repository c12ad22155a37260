//! [`ComputeBackend`] over the compute control plane's JSON API.
//!
//! - `GET {api}/instances/{id}` returns an [`InstanceSnapshot`]; 404 means unknown.
//! - `POST {api}/instances` launches from a [`LaunchRequest`].
//! - `DELETE {api}/instances/{id}` requests termination.

use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, info};

use crate::config::ComputeConfig;
use crate::models::instance::InstanceSnapshot;
use crate::{AppError, Result};

use super::{BoxFuture, ComputeBackend, LaunchRequest, LaunchedInstance};

/// HTTP client for the compute control plane.
pub struct HttpComputeBackend {
    client: reqwest::Client,
    api_url: String,
}

impl HttpComputeBackend {
    /// Build a client with the configured per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(config: &ComputeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|err| AppError::Config(format!("failed to build compute client: {err}")))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_owned(),
        })
    }

    fn instance_url(&self, instance_id: &str) -> String {
        format!("{}/instances/{instance_id}", self.api_url)
    }
}

fn backend_err(context: &str, err: &reqwest::Error) -> AppError {
    AppError::Backend(format!("{context}: {err}"))
}

impl ComputeBackend for HttpComputeBackend {
    fn describe<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<InstanceSnapshot>>> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.instance_url(instance_id))
                .send()
                .await
                .map_err(|err| backend_err("describe request failed", &err))?;

            if response.status() == StatusCode::NOT_FOUND {
                debug!(instance_id, "compute backend reports instance unknown");
                return Ok(None);
            }

            let response = response
                .error_for_status()
                .map_err(|err| backend_err("describe rejected", &err))?;
            let snapshot = response
                .json::<InstanceSnapshot>()
                .await
                .map_err(|err| backend_err("describe response invalid", &err))?;
            Ok(Some(snapshot))
        })
    }

    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> BoxFuture<'a, Result<LaunchedInstance>> {
        Box::pin(async move {
            let launched = self
                .client
                .post(format!("{}/instances", self.api_url))
                .json(request)
                .send()
                .await
                .map_err(|err| backend_err("launch request failed", &err))?
                .error_for_status()
                .map_err(|err| backend_err("launch rejected", &err))?
                .json::<LaunchedInstance>()
                .await
                .map_err(|err| backend_err("launch response invalid", &err))?;

            info!(instance_id = %launched.instance_id, name = %request.name, "instance launched");
            Ok(launched)
        })
    }

    fn terminate<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let response = self
                .client
                .delete(self.instance_url(instance_id))
                .send()
                .await
                .map_err(|err| backend_err("terminate request failed", &err))?;

            Ok(response.status().is_success())
        })
    }
}
