// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! NOXRUN Database Layer
//!
//! MariaDB-backed persistent storage: the relational store is the single
//! source of truth for sessions, executions, containers, templates, nodes
//! and artifacts. Repositories are modules of free async functions over the
//! shared pool; status transitions guard themselves (version CAS for
//! sessions, status-guarded updates for executions).

pub mod artifacts;
pub mod cleanup;
pub mod containers;
pub mod executions;
pub mod nodes;
pub mod sessions;
pub mod templates;

use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;

/// Database connection pool
pub type DbPool = MySqlPool;

pub async fn init_pool(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    info!("Connecting to MariaDB...");
    let pool = MySqlPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(&config.url)
        .await?;

    info!("MariaDB connection pool established");
    Ok(pool)
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    info!("Running database migrations...");
    let migrations = [
        include_str!("../../migrations/001_initial.sql"),
        include_str!("../../migrations/002_default_templates.sql"),
    ];
    for migration_sql in migrations {
        sqlx::raw_sql(migration_sql).execute(pool).await?;
    }
    info!("Database migrations completed successfully");
    Ok(())
}

/// Liveness probe for the health rollup.
pub async fn ping(pool: &DbPool) -> bool {
    sqlx::query("SELECT 1").fetch_one(pool).await.is_ok()
}
