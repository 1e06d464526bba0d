//! Schema migrations for the fingerprint cache.
//!
//! Version history:
//! - v1: `file_fingerprints`, keyed by absolute path. Records carried no
//!   owning configuration, so the same file watched by two configurations
//!   shared one record.
//! - v2: `fingerprints`, keyed by source identifier with the owning
//!   configuration id. v1 rows cannot be attributed to a configuration and
//!   are dropped; affected sources are processed once more on the next run.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;

pub const SCHEMA_VERSION: i64 = 2;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Bring an open database up to [`SCHEMA_VERSION`]. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    let version: Option<String> =
        sqlx::query_scalar("SELECT value FROM schema_meta WHERE key = 'schema_version'")
            .fetch_optional(&mut *tx)
            .await?;
    let version = version.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);

    if version >= SCHEMA_VERSION {
        tx.commit().await?;
        return Ok(());
    }

    let legacy_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='file_fingerprints'",
    )
    .fetch_one(&mut *tx)
    .await?;

    if legacy_exists {
        let legacy_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_fingerprints")
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query("DROP TABLE file_fingerprints")
            .execute(&mut *tx)
            .await?;
        warn!(
            legacy_rows,
            "dropped path-keyed fingerprint records; affected notes will be imported again"
        );
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fingerprints (
            source_id TEXT PRIMARY KEY,
            digest TEXT NOT NULL,
            size INTEGER NOT NULL,
            mtime_ms INTEGER NOT NULL,
            processed_at TEXT NOT NULL,
            output_folder TEXT NOT NULL,
            config_id TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_fingerprints_config ON fingerprints(config_id)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(SCHEMA_VERSION.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    info!(from = version, to = SCHEMA_VERSION, "fingerprint cache schema migrated");
    Ok(())
}
