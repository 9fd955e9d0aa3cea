// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Artifact persistence. Append-only: rows are inserted by the artifacts
//! callback and never updated.

use super::DbPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ArtifactRecord {
    pub id: String,
    pub execution_id: String,
    pub artifact_type: String,
    pub path: String,
    pub object_path: String,
    pub size_bytes: i64,
    pub mime_type: Option<String>,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct NewArtifact<'a> {
    pub id: &'a str,
    pub execution_id: &'a str,
    pub artifact_type: &'a str,
    pub path: &'a str,
    pub object_path: &'a str,
    pub size_bytes: i64,
    pub mime_type: Option<&'a str>,
    pub checksum: Option<&'a str>,
}

pub async fn append(pool: &DbPool, a: NewArtifact<'_>) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO artifacts
            (id, execution_id, artifact_type, path, object_path, size_bytes, mime_type, checksum)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(a.id)
    .bind(a.execution_id)
    .bind(a.artifact_type)
    .bind(a.path)
    .bind(a.object_path)
    .bind(a.size_bytes)
    .bind(a.mime_type)
    .bind(a.checksum)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_for_execution(
    pool: &DbPool,
    execution_id: &str,
) -> Result<Vec<ArtifactRecord>, sqlx::Error> {
    sqlx::query_as::<_, ArtifactRecord>(
        "SELECT * FROM artifacts WHERE execution_id = ? ORDER BY created_at ASC",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await
}
