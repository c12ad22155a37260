//! Apache Guacamole REST client.
//!
//! Connections are created with the administrative account. Direct links
//! use a throwaway per-session user holding `READ` on one connection, so
//! the link logs the student straight into that desktop.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compute::BoxFuture;
use crate::config::GuacamoleConfig;
use crate::{AppError, Result};

use super::{short_id, ConnectionProvisioner, Credentials};

/// Guacamole-backed [`ConnectionProvisioner`].
pub struct GuacamoleProvisioner {
    client: reqwest::Client,
    api_url: String,
    public_url: String,
    data_source: String,
    admin_user: String,
    admin_password: String,
    rdp_port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    auth_token: String,
    data_source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectionResponse {
    identifier: String,
}

fn provisioner_err(context: &str, err: &reqwest::Error) -> AppError {
    AppError::Provisioner(format!("{context}: {err}"))
}

impl GuacamoleProvisioner {
    /// Build a client from configuration (credentials must already be loaded).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(config: &GuacamoleConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|err| AppError::Config(format!("failed to build gateway client: {err}")))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_owned(),
            public_url: config.public_base_url().trim_end_matches('/').to_owned(),
            data_source: config.data_source.clone(),
            admin_user: config.admin_user.clone(),
            admin_password: config.admin_password.clone(),
            rdp_port: config.rdp_port,
        })
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<TokenResponse> {
        let mut form = HashMap::new();
        form.insert("username", username);
        form.insert("password", password);

        self.client
            .post(format!("{}/api/tokens", self.api_url))
            .form(&form)
            .send()
            .await
            .map_err(|err| provisioner_err("token request failed", &err))?
            .error_for_status()
            .map_err(|err| provisioner_err("authentication rejected", &err))?
            .json::<TokenResponse>()
            .await
            .map_err(|err| provisioner_err("token response invalid", &err))
    }

    fn data_url(&self, token: &TokenResponse, path: &str) -> String {
        let data_source = token.data_source.as_deref().unwrap_or(&self.data_source);
        format!(
            "{}/api/session/data/{data_source}/{path}?token={}",
            self.api_url, token.auth_token
        )
    }

    async fn upsert_user(&self, admin: &TokenResponse, username: &str, password: &str, subject: &str) -> Result<()> {
        let body = json!({
            "username": username,
            "password": password,
            "attributes": {
                "disabled": "",
                "expired": "",
                "guac-full-name": subject,
            },
        });

        let created = self
            .client
            .post(self.data_url(admin, "users"))
            .json(&body)
            .send()
            .await
            .map_err(|err| provisioner_err("user creation failed", &err))?;

        if created.status().is_success() {
            return Ok(());
        }

        // Existing user from an earlier attempt: reset its password instead.
        debug!(username, status = %created.status(), "session user exists, updating");
        self.client
            .put(self.data_url(admin, &format!("users/{username}")))
            .json(&body)
            .send()
            .await
            .map_err(|err| provisioner_err("user update failed", &err))?
            .error_for_status()
            .map_err(|err| provisioner_err("user update rejected", &err))?;
        Ok(())
    }

    fn client_url(&self, connection_id: &str, data_source: &str, token: &str) -> String {
        let identifier = STANDARD.encode(format!("{connection_id}\0c\0{data_source}"));
        format!("{}/#/client/{identifier}?token={token}", self.public_url)
    }
}

impl ConnectionProvisioner for GuacamoleProvisioner {
    fn create_connection<'a>(
        &'a self,
        name: &'a str,
        target_address: &'a str,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let admin = self.authenticate(&self.admin_user, &self.admin_password).await?;

            let body = json!({
                "parentIdentifier": "ROOT",
                "name": name,
                "protocol": "rdp",
                "parameters": {
                    "hostname": target_address,
                    "port": self.rdp_port.to_string(),
                    "username": credentials.username,
                    "password": credentials.password,
                    "security": "any",
                    "ignore-cert": "true",
                    "resize-method": "display-update",
                },
                "attributes": {
                    "max-connections": "",
                    "max-connections-per-user": "",
                },
            });

            let response = self
                .client
                .post(self.data_url(&admin, "connections"))
                .json(&body)
                .send()
                .await
                .map_err(|err| provisioner_err("connection request failed", &err))?;

            if response.status() == StatusCode::BAD_REQUEST {
                warn!(name, "gateway rejected connection definition");
            }

            let connection = response
                .error_for_status()
                .map_err(|err| provisioner_err("connection rejected", &err))?
                .json::<ConnectionResponse>()
                .await
                .map_err(|err| provisioner_err("connection response invalid", &err))?;

            info!(name, connection_id = %connection.identifier, "gateway connection created");
            Ok(connection.identifier)
        })
    }

    fn mint_direct_link<'a>(
        &'a self,
        session_id: &'a str,
        connection_id: &'a str,
        subject: &'a str,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let admin = self.authenticate(&self.admin_user, &self.admin_password).await?;
            let username = format!("session_{}", short_id(session_id));
            let password = Uuid::new_v4().simple().to_string();

            self.upsert_user(&admin, &username, &password, subject).await?;

            let patch = json!([{
                "op": "add",
                "path": format!("/connectionPermissions/{connection_id}"),
                "value": "READ",
            }]);
            self.client
                .patch(self.data_url(&admin, &format!("users/{username}/permissions")))
                .json(&patch)
                .send()
                .await
                .map_err(|err| provisioner_err("permission grant failed", &err))?
                .error_for_status()
                .map_err(|err| provisioner_err("permission grant rejected", &err))?;

            let user_token = self.authenticate(&username, &password).await?;
            let data_source = user_token
                .data_source
                .clone()
                .unwrap_or_else(|| self.data_source.clone());

            info!(session_id, username = %username, "direct link minted");
            Ok(self.client_url(connection_id, &data_source, &user_token.auth_token))
        })
    }

    fn public_url(&self) -> String {
        self.public_url.clone()
    }
}
