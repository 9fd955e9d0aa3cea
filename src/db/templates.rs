// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Template persistence.
//!
//! Templates are soft-deprecated via the active flag; hard deletion is only
//! legal once no non-terminal session references the row, which the service
//! layer checks before calling [`delete`].

use super::DbPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TemplateRecord {
    pub id: String,
    pub name: String,
    pub image: String,
    pub runtime_type: String,
    pub default_cpu: String,
    pub default_memory: String,
    pub default_disk: String,
    pub default_timeout_sec: i32,
    pub preinstalled_packages: JsonValue,
    pub run_as_user: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TemplateRecord {
    pub fn preinstalled_names(&self) -> Vec<String> {
        self.preinstalled_packages
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| crate::security::package_base_name(s).to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct NewTemplate<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub image: &'a str,
    pub runtime_type: &'a str,
    pub default_cpu: &'a str,
    pub default_memory: &'a str,
    pub default_disk: &'a str,
    pub default_timeout_sec: i32,
    pub preinstalled_packages: &'a JsonValue,
}

pub async fn create(pool: &DbPool, t: NewTemplate<'_>) -> Result<TemplateRecord, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO templates
            (id, name, image, runtime_type, default_cpu, default_memory,
             default_disk, default_timeout_sec, preinstalled_packages)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(t.id)
    .bind(t.name)
    .bind(t.image)
    .bind(t.runtime_type)
    .bind(t.default_cpu)
    .bind(t.default_memory)
    .bind(t.default_disk)
    .bind(t.default_timeout_sec)
    .bind(t.preinstalled_packages)
    .execute(pool)
    .await?;

    debug!("Created template {} ({})", t.id, t.name);
    get_required(pool, t.id).await
}

pub async fn get_by_id(pool: &DbPool, id: &str) -> Result<Option<TemplateRecord>, sqlx::Error> {
    sqlx::query_as::<_, TemplateRecord>("SELECT * FROM templates WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_required(pool: &DbPool, id: &str) -> Result<TemplateRecord, sqlx::Error> {
    sqlx::query_as::<_, TemplateRecord>("SELECT * FROM templates WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
}

pub async fn get_by_name(pool: &DbPool, name: &str) -> Result<Option<TemplateRecord>, sqlx::Error> {
    sqlx::query_as::<_, TemplateRecord>("SELECT * FROM templates WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
}

pub async fn list(pool: &DbPool, active_only: bool) -> Result<Vec<TemplateRecord>, sqlx::Error> {
    sqlx::query_as::<_, TemplateRecord>(
        "SELECT * FROM templates WHERE (? = FALSE OR active = TRUE) ORDER BY name",
    )
    .bind(active_only)
    .fetch_all(pool)
    .await
}

pub struct TemplateUpdate<'a> {
    pub image: Option<&'a str>,
    pub default_cpu: Option<&'a str>,
    pub default_memory: Option<&'a str>,
    pub default_disk: Option<&'a str>,
    pub default_timeout_sec: Option<i32>,
    pub preinstalled_packages: Option<&'a JsonValue>,
    pub active: Option<bool>,
}

pub async fn update(
    pool: &DbPool,
    id: &str,
    u: TemplateUpdate<'_>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE templates
        SET image = COALESCE(?, image),
            default_cpu = COALESCE(?, default_cpu),
            default_memory = COALESCE(?, default_memory),
            default_disk = COALESCE(?, default_disk),
            default_timeout_sec = COALESCE(?, default_timeout_sec),
            preinstalled_packages = COALESCE(?, preinstalled_packages),
            active = COALESCE(?, active)
        WHERE id = ?
        "#,
    )
    .bind(u.image)
    .bind(u.default_cpu)
    .bind(u.default_memory)
    .bind(u.default_disk)
    .bind(u.default_timeout_sec)
    .bind(u.preinstalled_packages)
    .bind(u.active)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete(pool: &DbPool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM templates WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}
