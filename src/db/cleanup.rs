// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Retention cleanup for terminal rows.
//!
//! Executions, containers and artifacts ride along via ON DELETE CASCADE, so
//! one sweep over sessions is enough. Batched so a long backlog cannot hold
//! locks for seconds.

use super::DbPool;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

const BATCH_SIZE: i64 = 500;

/// Delete terminal sessions older than the cutoff. Returns rows removed.
pub async fn purge_terminal_sessions(
    pool: &DbPool,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let mut total = 0u64;
    loop {
        let result = sqlx::query(
            r#"
            DELETE FROM sessions
            WHERE status IN ('completed', 'failed', 'timeout', 'terminated')
              AND terminated_at IS NOT NULL
              AND terminated_at < ?
            LIMIT ?
            "#,
        )
        .bind(cutoff)
        .bind(BATCH_SIZE)
        .execute(pool)
        .await?;

        let n = result.rows_affected();
        total += n;
        if n < BATCH_SIZE as u64 {
            break;
        }
    }

    if total > 0 {
        info!("Retention cleanup removed {} terminal sessions", total);
    } else {
        debug!("Retention cleanup found nothing to remove");
    }
    Ok(total)
}

/// Orphaned execution retries whose session disappeared mid-cascade cannot
/// exist (FK), but stray node rows marked offline long ago can.
pub async fn purge_offline_nodes(
    pool: &DbPool,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM runtime_nodes
        WHERE status = 'offline'
          AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?)
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn run_all(pool: &DbPool, retention_days: u64) -> Result<(), sqlx::Error> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    purge_terminal_sessions(pool, cutoff).await?;
    purge_offline_nodes(pool, cutoff).await?;
    Ok(())
}
