//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` and are safe to
//! re-run on every server startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session (
    session_id          TEXT PRIMARY KEY NOT NULL,
    student_id          TEXT NOT NULL,
    student_name        TEXT,
    course_id           TEXT,
    lab_id              TEXT,
    status              TEXT NOT NULL CHECK(status IN ('pending','provisioning','ready','active','terminating','terminated','error')),
    instance_id         TEXT,
    instance_ip         TEXT,
    instance_state      TEXT,
    health_checks       TEXT,
    connection_info     TEXT,
    direct_url          TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    expires_at          TEXT NOT NULL,
    error               TEXT,
    termination_reason  TEXT
);

CREATE TABLE IF NOT EXISTS pool_instance (
    instance_id     TEXT PRIMARY KEY NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('available','assigned')),
    session_id      TEXT,
    student_id      TEXT,
    assigned_at     TEXT
);

CREATE TABLE IF NOT EXISTS lab_session (
    session_id          TEXT PRIMARY KEY NOT NULL,
    user_id             TEXT NOT NULL,
    template_id         TEXT NOT NULL,
    template_name       TEXT NOT NULL,
    course_id           TEXT,
    connection_method   TEXT NOT NULL,
    lab_type            TEXT NOT NULL,
    status              TEXT NOT NULL CHECK(status IN ('pending','launching','running','terminating','terminated','error')),
    instance_id         TEXT,
    instance_type       TEXT,
    target_ip           TEXT,
    services            TEXT NOT NULL DEFAULT '[]',
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    expires_at          TEXT NOT NULL,
    terminated_at       TEXT,
    error               TEXT
);

CREATE TABLE IF NOT EXISTS lab_template (
    template_id         TEXT PRIMARY KEY NOT NULL,
    name                TEXT NOT NULL,
    description         TEXT NOT NULL DEFAULT '',
    lab_type            TEXT NOT NULL,
    difficulty          TEXT NOT NULL,
    estimated_minutes   INTEGER NOT NULL,
    image_id            TEXT,
    instance_type       TEXT,
    user_data           TEXT,
    services            TEXT NOT NULL DEFAULT '[]',
    tags                TEXT NOT NULL DEFAULT '[]',
    category            TEXT NOT NULL,
    thumbnail_url       TEXT,
    active              INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_session_student ON session(student_id);
CREATE INDEX IF NOT EXISTS idx_session_status ON session(status);
CREATE INDEX IF NOT EXISTS idx_pool_status ON pool_instance(status);
CREATE INDEX IF NOT EXISTS idx_lab_session_user ON lab_session(user_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_lab_session_active_template
    ON lab_session(user_id, template_id)
    WHERE status IN ('pending','launching','running');
CREATE INDEX IF NOT EXISTS idx_lab_template_type ON lab_template(lab_type);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
