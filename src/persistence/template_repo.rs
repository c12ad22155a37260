//! Lab template catalog repository (read path plus operator seeding).

use std::sync::Arc;

use crate::models::template::{LabTemplate, TemplateService};
use crate::Result;

use super::db::Database;

const SELECT_COLUMNS: &str = "SELECT template_id, name, description, lab_type, difficulty, \
     estimated_minutes, image_id, instance_type, user_data, services, tags, category, \
     thumbnail_url, active FROM lab_template";

/// Repository for lab template records.
#[derive(Clone)]
pub struct TemplateRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct TemplateRow {
    template_id: String,
    name: String,
    description: String,
    lab_type: String,
    difficulty: String,
    estimated_minutes: i64,
    image_id: Option<String>,
    instance_type: Option<String>,
    user_data: Option<String>,
    services: String,
    tags: String,
    category: String,
    thumbnail_url: Option<String>,
    active: i64,
}

impl TemplateRow {
    fn into_template(self) -> Result<LabTemplate> {
        let services: Vec<TemplateService> = serde_json::from_str(&self.services)?;
        let tags: Vec<String> = serde_json::from_str(&self.tags)?;

        Ok(LabTemplate {
            template_id: self.template_id,
            name: self.name,
            description: self.description,
            lab_type: self.lab_type,
            difficulty: self.difficulty,
            estimated_minutes: u32::try_from(self.estimated_minutes).unwrap_or_default(),
            image_id: self.image_id,
            instance_type: self.instance_type,
            user_data: self.user_data,
            services,
            tags,
            category: self.category,
            thumbnail_url: self.thumbnail_url,
            active: self.active != 0,
        })
    }
}

impl TemplateRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace a template.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn upsert(&self, template: &LabTemplate) -> Result<()> {
        sqlx::query(
            "INSERT INTO lab_template (template_id, name, description, lab_type, difficulty,
                 estimated_minutes, image_id, instance_type, user_data, services, tags,
                 category, thumbnail_url, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(template_id) DO UPDATE SET
                 name = excluded.name, description = excluded.description,
                 lab_type = excluded.lab_type, difficulty = excluded.difficulty,
                 estimated_minutes = excluded.estimated_minutes, image_id = excluded.image_id,
                 instance_type = excluded.instance_type, user_data = excluded.user_data,
                 services = excluded.services, tags = excluded.tags,
                 category = excluded.category, thumbnail_url = excluded.thumbnail_url,
                 active = excluded.active",
        )
        .bind(&template.template_id)
        .bind(&template.name)
        .bind(&template.description)
        .bind(&template.lab_type)
        .bind(&template.difficulty)
        .bind(i64::from(template.estimated_minutes))
        .bind(&template.image_id)
        .bind(&template.instance_type)
        .bind(&template.user_data)
        .bind(serde_json::to_string(&template.services)?)
        .bind(serde_json::to_string(&template.tags)?)
        .bind(&template.category)
        .bind(&template.thumbnail_url)
        .bind(i64::from(template.active))
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Retrieve a template by identifier, active or not.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, template_id: &str) -> Result<Option<LabTemplate>> {
        let query = format!("{SELECT_COLUMNS} WHERE template_id = ?1");
        let row: Option<TemplateRow> = sqlx::query_as(&query)
            .bind(template_id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(TemplateRow::into_template).transpose()
    }

    /// List active templates, optionally filtered by lab type, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_active(&self, lab_type: Option<&str>) -> Result<Vec<LabTemplate>> {
        let rows: Vec<TemplateRow> = if let Some(kind) = lab_type {
            let query = format!("{SELECT_COLUMNS} WHERE active = 1 AND lab_type = ?1 ORDER BY name");
            sqlx::query_as(&query)
                .bind(kind)
                .fetch_all(self.db.as_ref())
                .await?
        } else {
            let query = format!("{SELECT_COLUMNS} WHERE active = 1 ORDER BY name");
            sqlx::query_as(&query).fetch_all(self.db.as_ref()).await?
        };

        rows.into_iter().map(TemplateRow::into_template).collect()
    }
}
