//! Template-backed lab session engine.
//!
//! Each lab session launches its own instance from a catalog template. The
//! record is persisted as `launching` before compute is requested, and a
//! failed launch is kept as an `error` record rather than dropped.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn, Instrument};

use crate::compute::{ComputeBackend, LaunchRequest};
use crate::config::GlobalConfig;
use crate::models::instance::InstanceState;
use crate::models::lab_session::{LabSession, LabSessionStatus};
use crate::models::template::LabTemplate;
use crate::persistence::db::Database;
use crate::persistence::lab_session_repo::{LabInsert, LabSessionRepo};
use crate::persistence::template_repo::TemplateRepo;
use crate::{AppError, Result};

use super::elapsed_since;

fn default_connection_method() -> String {
    "lynkbox".into()
}

/// Input for [`LabManager::create`].
#[derive(Debug, Clone, Deserialize)]
pub struct CreateLabRequest {
    /// Owning user.
    #[serde(default)]
    pub user_id: String,
    /// Catalog template to launch.
    #[serde(default)]
    pub template_id: String,
    /// Originating course.
    pub course_id: Option<String>,
    /// How the student reaches the target.
    #[serde(default = "default_connection_method")]
    pub connection_method: String,
    /// Only report an existing session; never launch.
    #[serde(default)]
    pub check_only: bool,
}

/// Lab session enriched with progress for polling clients.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LabSessionView {
    /// The stored lab session.
    #[serde(flatten)]
    pub session: LabSession,
    /// Percentage in `0..=100`.
    pub progress: u8,
    /// Human-readable status line.
    pub message: String,
    /// Seconds until expiry, floored at zero.
    pub time_remaining_seconds: i64,
}

impl LabSessionView {
    fn new(session: LabSession, progress: u8, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        let time_remaining_seconds = session.time_remaining_at(now);
        Self {
            session,
            progress,
            message: message.into(),
            time_remaining_seconds,
        }
    }

    fn settled(session: LabSession, now: DateTime<Utc>) -> Self {
        let message = match session.status {
            LabSessionStatus::Running => "Lab environment ready".to_owned(),
            LabSessionStatus::Error => session
                .error
                .clone()
                .unwrap_or_else(|| "Lab session failed".to_owned()),
            _ => "Lab session ended".to_owned(),
        };
        Self::new(session, 100, message, now)
    }
}

/// Result of [`LabManager::create`].
#[derive(Debug, Clone, Serialize)]
pub struct LabCreated {
    /// `true` when an already-active session for the template was found.
    pub existing: bool,
    /// The session; absent only for a `check_only` request with nothing active.
    pub session: Option<LabSessionView>,
}

/// Result of [`LabManager::terminate`].
#[derive(Debug, Clone, Serialize)]
pub struct LabTermination {
    /// Terminated session.
    pub session_id: String,
    /// Final status.
    pub status: LabSessionStatus,
    /// Whether the compute backend confirmed the instance teardown.
    pub instance_terminated: bool,
    /// The session had already been terminated before this call.
    pub already_terminated: bool,
}

/// Template-backed lab session operations.
#[derive(Clone)]
pub struct LabManager {
    config: Arc<GlobalConfig>,
    labs: LabSessionRepo,
    templates: TemplateRepo,
    compute: Arc<dyn ComputeBackend>,
}

impl LabManager {
    /// Wire the manager to the store and compute backend.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>, db: Arc<Database>, compute: Arc<dyn ComputeBackend>) -> Self {
        Self {
            config,
            labs: LabSessionRepo::new(Arc::clone(&db)),
            templates: TemplateRepo::new(db),
            compute,
        }
    }

    /// Active catalog templates, optionally filtered, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store fails.
    pub async fn list_templates(
        &self,
        lab_type: Option<&str>,
        category: Option<&str>,
    ) -> Result<Vec<LabTemplate>> {
        let mut templates = self.templates.list_active(lab_type).await?;
        if let Some(category) = category {
            templates.retain(|t| t.category == category);
        }
        Ok(templates)
    }

    /// Launch a lab from a template, or return the caller's active one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for missing identifiers,
    /// `AppError::NotFound` for a missing or inactive template, and
    /// `AppError::Capacity` when the per-user limit is reached. A failed
    /// launch is not an error: it yields an `error` record.
    pub async fn create(&self, request: CreateLabRequest) -> Result<LabCreated> {
        let user_id = request.user_id.trim().to_owned();
        let template_id = request.template_id.trim().to_owned();
        if user_id.is_empty() || template_id.is_empty() {
            return Err(AppError::Validation(
                "user_id and template_id are required".into(),
            ));
        }

        let span = info_span!("create_lab", user_id = %user_id, template_id = %template_id);
        async move {
            let template = self
                .templates
                .get(&template_id)
                .await?
                .filter(|t| t.active)
                .ok_or_else(|| AppError::NotFound(format!("template {template_id} not found")))?;

            let now = Utc::now();
            let active = self.labs.list_active_by_user(&user_id).await?;

            if let Some(existing) = active.iter().find(|s| s.template_id == template_id) {
                return Ok(Self::existing(existing.clone(), now));
            }

            if request.check_only {
                return Ok(LabCreated {
                    existing: false,
                    session: None,
                });
            }

            let limit = self.config.labs.max_active_sessions;
            if active.len() >= usize::try_from(limit).unwrap_or(usize::MAX) {
                return Err(capacity_error(limit));
            }

            let ttl = Duration::hours(i64::from(self.config.labs.ttl_hours));
            let session = LabSession::launching(
                user_id,
                &template,
                request.course_id,
                request.connection_method,
                ttl,
            );
            let session = match self.labs.insert_guarded(&session, limit).await? {
                LabInsert::Inserted(session) => session,
                LabInsert::Existing(existing) => return Ok(Self::existing(existing, Utc::now())),
                LabInsert::AtCapacity => return Err(capacity_error(limit)),
            };
            info!(session_id = %session.session_id, "lab session recorded");

            let session = self.launch(session, &template).await?;
            let view = if session.status == LabSessionStatus::Error {
                LabSessionView::settled(session, Utc::now())
            } else {
                LabSessionView::new(session, 20, "Launching lab instance...", Utc::now())
            };

            Ok(LabCreated {
                existing: false,
                session: Some(view),
            })
        }
        .instrument(span)
        .await
    }

    fn existing(session: LabSession, now: DateTime<Utc>) -> LabCreated {
        info!(session_id = %session.session_id, "returning existing lab session");
        let progress = if session.status == LabSessionStatus::Running {
            100
        } else {
            launch_progress(elapsed_since(session.created_at, now))
        };
        LabCreated {
            existing: true,
            session: Some(LabSessionView::new(
                session,
                progress,
                "Active lab session already exists",
                now,
            )),
        }
    }

    async fn launch(&self, mut session: LabSession, template: &LabTemplate) -> Result<LabSession> {
        let outcome = match template.image_id.clone() {
            Some(image_id) => {
                let request = LaunchRequest {
                    image_id,
                    instance_type: template
                        .instance_type
                        .clone()
                        .unwrap_or_else(|| self.config.labs.default_instance_type.clone()),
                    user_data: template.user_data.clone(),
                    name: format!("{}-{}", self.config.labs.name_prefix, session.session_id),
                    tags: vec![
                        ("SessionId".into(), session.session_id.clone()),
                        ("UserId".into(), session.user_id.clone()),
                        ("TemplateId".into(), session.template_id.clone()),
                        ("LabType".into(), session.lab_type.clone()),
                    ],
                };
                self.compute.launch(&request).await
            }
            None => Err(AppError::Validation(format!(
                "template {} has no machine image",
                template.template_id
            ))),
        };

        let expected = session.status;
        match outcome {
            Ok(launched) => {
                info!(session_id = %session.session_id, instance_id = %launched.instance_id, "lab instance launched");
                session.instance_id = Some(launched.instance_id);
                session.instance_type = Some(launched.instance_type);
            }
            Err(err) => {
                error!(session_id = %session.session_id, %err, "lab launch failed");
                session.advance_to(LabSessionStatus::Error);
                session.error = Some(format!("Failed to launch lab instance: {err}"));
            }
        }

        self.save(session, expected).await
    }

    /// Poll a lab session, promoting it to `running` only once the instance
    /// is addressable and both health checks pass.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub async fn status(&self, session_id: &str) -> Result<LabSessionView> {
        let mut session = self.labs.get_by_id(session_id).await?;
        let now = Utc::now();

        if session.status.is_terminal()
            || (session.status == LabSessionStatus::Running && session.target_ip.is_some())
        {
            return Ok(LabSessionView::settled(session, now));
        }

        let Some(instance_id) = session.instance_id.clone() else {
            return Ok(LabSessionView::new(session, 10, "Preparing lab environment...", now));
        };

        let snapshot = match self.compute.describe(&instance_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                let expected = session.status;
                if session.advance_to(LabSessionStatus::Error) {
                    session.error = Some("Instance not found".into());
                }
                let session = self.save(session, expected).await?;
                return Ok(LabSessionView::settled(session, now));
            }
            Err(err) => {
                warn!(session_id, %instance_id, %err, "describe failed, retrying next poll");
                return Ok(LabSessionView::new(session, 50, "Checking instance status...", now));
            }
        };

        let expected = session.status;
        match snapshot.state {
            InstanceState::Running => {
                let Some(ip) = snapshot.private_ip.filter(|ip| !ip.is_empty()) else {
                    return Ok(LabSessionView::new(
                        session,
                        85,
                        "Instance running, waiting for network...",
                        now,
                    ));
                };

                let ip_changed = session.target_ip.as_deref() != Some(ip.as_str());
                session.target_ip = Some(ip);

                if snapshot.health.all_passed() {
                    session.advance_to(LabSessionStatus::Running);
                    info!(session_id, %instance_id, "lab session running");
                    let session = self.save(session, expected).await?;
                    return Ok(LabSessionView::settled(session, now));
                }

                let passed = snapshot.health.passed_checks();
                let session = if ip_changed {
                    self.save(session, expected).await?
                } else {
                    session
                };
                Ok(LabSessionView::new(
                    session,
                    85,
                    format!("Running health checks... ({passed}/2)"),
                    now,
                ))
            }
            InstanceState::Pending => {
                session.advance_to(LabSessionStatus::Launching);
                let session = if session.status == expected {
                    session
                } else {
                    self.save(session, expected).await?
                };
                let progress = launch_progress(elapsed_since(session.created_at, now));
                Ok(LabSessionView::new(session, progress, "Launching lab instance...", now))
            }
            InstanceState::Stopping
            | InstanceState::ShuttingDown
            | InstanceState::Stopped
            | InstanceState::Terminated => {
                if session.advance_to(LabSessionStatus::Terminated) {
                    session.terminated_at.get_or_insert(now);
                }
                let session = self.save(session, expected).await?;
                Ok(LabSessionView::settled(session, now))
            }
            InstanceState::Unknown => Ok(LabSessionView::new(
                session,
                50,
                "Checking instance status...",
                now,
            )),
        }
    }

    /// Tear down a lab session's instance and mark the record terminated.
    ///
    /// Already-terminated sessions return without contacting the backend.
    /// A backend failure is logged but never keeps the record alive.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session or
    /// `AppError::Forbidden` on ownership mismatch.
    pub async fn terminate(&self, session_id: &str, user_id: &str) -> Result<LabTermination> {
        let span = info_span!("terminate_lab", session_id);
        async move {
            let mut session = self.labs.get_by_id(session_id).await?;
            if session.user_id != user_id {
                return Err(AppError::Forbidden(format!(
                    "lab session {session_id} does not belong to {user_id}"
                )));
            }

            if session.status == LabSessionStatus::Terminated {
                return Ok(LabTermination {
                    session_id: session.session_id,
                    status: session.status,
                    instance_terminated: false,
                    already_terminated: true,
                });
            }

            let instance_terminated = match session.instance_id.as_deref() {
                Some(instance_id) => match self.compute.terminate(instance_id).await {
                    Ok(true) => true,
                    Ok(false) => {
                        warn!(session_id, instance_id, "backend did not confirm termination");
                        false
                    }
                    Err(err) => {
                        warn!(session_id, instance_id, %err, "instance termination failed");
                        false
                    }
                },
                None => false,
            };

            // One retry after re-reading if a status poll wins the race.
            for _ in 0..2 {
                if session.status == LabSessionStatus::Terminated {
                    break;
                }
                let expected = session.status;
                let now = Utc::now();
                session.advance_to(LabSessionStatus::Terminated);
                session.terminated_at = Some(now);
                session.updated_at = now;
                if self.labs.save(&session, expected).await? {
                    break;
                }
                session = self.labs.get_by_id(session_id).await?;
            }

            info!(session_id, instance_terminated, "lab session terminated");
            Ok(LabTermination {
                session_id: session.session_id,
                status: session.status,
                instance_terminated,
                already_terminated: false,
            })
        }
        .instrument(span)
        .await
    }

    /// Persist with a status guard; on a lost race the stored record wins.
    async fn save(&self, mut session: LabSession, expected: LabSessionStatus) -> Result<LabSession> {
        session.updated_at = Utc::now();
        if self.labs.save(&session, expected).await? {
            Ok(session)
        } else {
            warn!(session_id = %session.session_id, "lab session changed concurrently");
            self.labs.get_by_id(&session.session_id).await
        }
    }
}

fn capacity_error(limit: u32) -> AppError {
    AppError::Capacity(format!("maximum of {limit} active lab sessions reached"))
}

/// Launch progress ramps from 20 to 90 over the first minute.
fn launch_progress(elapsed: std::time::Duration) -> u8 {
    let ramp = elapsed.as_secs().saturating_mul(70) / 60;
    u8::try_from(20 + ramp.min(70)).unwrap_or(90)
}
