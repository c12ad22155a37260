//! Read-only lab template catalog entry.

use serde::{Deserialize, Serialize};

/// A network service exposed by a lab target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateService {
    /// Listening port.
    pub port: u16,
    /// Transport protocol (`tcp`/`udp`).
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Human-readable service name.
    pub name: String,
}

fn default_protocol() -> String {
    "tcp".into()
}

/// Catalog entry describing how to launch a dedicated lab instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LabTemplate {
    /// Catalog key.
    pub template_id: String,
    /// Display name.
    pub name: String,
    /// Long-form description.
    #[serde(default)]
    pub description: String,
    /// Lab flavor (`vm` or `docker`).
    #[serde(default = "default_lab_type")]
    pub lab_type: String,
    /// Difficulty label.
    #[serde(default = "default_difficulty")]
    pub difficulty: String,
    /// Expected completion time.
    #[serde(default = "default_estimated_minutes")]
    pub estimated_minutes: u32,
    /// Machine image to boot.
    #[serde(default, alias = "ami_id")]
    pub image_id: Option<String>,
    /// Instance shape; falls back to the configured default.
    #[serde(default)]
    pub instance_type: Option<String>,
    /// Boot script passed to the instance.
    #[serde(default)]
    pub user_data: Option<String>,
    /// Services exposed by the target.
    #[serde(default)]
    pub services: Vec<TemplateService>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Catalog category.
    #[serde(default = "default_category")]
    pub category: String,
    /// Catalog thumbnail.
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    /// Inactive templates cannot be launched.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_lab_type() -> String {
    "vm".into()
}

fn default_difficulty() -> String {
    "beginner".into()
}

fn default_estimated_minutes() -> u32 {
    60
}

fn default_category() -> String {
    "general".into()
}

fn default_active() -> bool {
    true
}
