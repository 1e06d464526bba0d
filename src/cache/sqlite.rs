//! SQLite-backed [`FingerprintStore`] implementation.
//!
//! Each `put` is a single upsert, committed before it returns, so a crash
//! between jobs never loses an earlier job's record.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::FingerprintRecord;

use super::{FingerprintStore, ResetScope};

pub struct SqliteFingerprintStore {
    pool: SqlitePool,
}

impl SqliteFingerprintStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured cache database and migrate it.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_record(row: &SqliteRow) -> Result<FingerprintRecord> {
    let size: i64 = row.try_get("size")?;
    let output_folder: String = row.try_get("output_folder")?;
    Ok(FingerprintRecord {
        source_id: row.try_get("source_id")?,
        digest: row.try_get("digest")?,
        size: size.max(0) as u64,
        mtime_ms: row.try_get("mtime_ms")?,
        processed_at: row.try_get("processed_at")?,
        output_folder: PathBuf::from(output_folder),
        config_id: row.try_get("config_id")?,
    })
}

#[async_trait]
impl FingerprintStore for SqliteFingerprintStore {
    async fn get(&self, source_id: &str) -> Result<Option<FingerprintRecord>> {
        let row = sqlx::query(
            r#"
            SELECT source_id, digest, size, mtime_ms, processed_at, output_folder, config_id
            FROM fingerprints WHERE source_id = ?
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn put(&self, record: &FingerprintRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fingerprints (source_id, digest, size, mtime_ms, processed_at, output_folder, config_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                digest = excluded.digest,
                size = excluded.size,
                mtime_ms = excluded.mtime_ms,
                processed_at = excluded.processed_at,
                output_folder = excluded.output_folder,
                config_id = excluded.config_id
            "#,
        )
        .bind(&record.source_id)
        .bind(&record.digest)
        .bind(record.size as i64)
        .bind(record.mtime_ms)
        .bind(&record.processed_at)
        .bind(record.output_folder.to_string_lossy().to_string())
        .bind(&record.config_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<FingerprintRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT source_id, digest, size, mtime_ms, processed_at, output_folder, config_id
            FROM fingerprints ORDER BY source_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn reset(&self, scope: &ResetScope) -> Result<u64> {
        let removed = match scope {
            ResetScope::All => {
                sqlx::query("DELETE FROM fingerprints")
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            }
            ResetScope::Source(config_id) => {
                sqlx::query("DELETE FROM fingerprints WHERE config_id = ?")
                    .bind(config_id)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            }
            ResetScope::Orphans(_) => {
                let records = self.list().await?;
                let mut tx = self.pool.begin().await?;
                let mut removed = 0;
                for record in records {
                    if scope.matches(&record) {
                        removed += sqlx::query("DELETE FROM fingerprints WHERE source_id = ?")
                            .bind(&record.source_id)
                            .execute(&mut *tx)
                            .await?
                            .rows_affected();
                    }
                }
                tx.commit().await?;
                removed
            }
        };
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(source_id: &str, config_id: &str, digest: &str) -> FingerprintRecord {
        FingerprintRecord {
            source_id: source_id.into(),
            digest: digest.into(),
            size: 100,
            mtime_ms: 1_700_000_000_000,
            processed_at: "2024-05-01T10:00:00Z".into(),
            output_folder: PathBuf::from("/vault/Ink2MD/notes/a"),
            config_id: config_id.into(),
        }
    }

    async fn open_store(tmp: &TempDir) -> SqliteFingerprintStore {
        let pool = db::connect_path(&tmp.path().join("cache.sqlite"))
            .await
            .unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        SqliteFingerprintStore::new(pool)
    }

    #[tokio::test]
    async fn put_replaces_whole_record() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        store.put(&record("s1", "notes", "aaa")).await.unwrap();
        let mut updated = record("s1", "notes", "bbb");
        updated.size = 7;
        store.put(&updated).await.unwrap();

        assert_eq!(store.get("s1").await.unwrap(), Some(updated));
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open_store(&tmp).await;
            store.put(&record("s1", "notes", "aaa")).await.unwrap();
            store.close().await;
        }
        let store = open_store(&tmp).await;
        assert_eq!(store.get("s1").await.unwrap().unwrap().digest, "aaa");
    }

    #[tokio::test]
    async fn reset_scopes() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        store.put(&record("s1", "notes", "a")).await.unwrap();
        store.put(&record("s2", "journal", "b")).await.unwrap();
        store.put(&record("s3", "deleted", "c")).await.unwrap();

        let removed = store
            .reset(&ResetScope::Orphans(vec!["notes".into(), "journal".into()]))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let removed = store
            .reset(&ResetScope::Source("journal".into()))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("s1").await.unwrap().is_some());

        assert_eq!(store.reset(&ResetScope::All).await.unwrap(), 1);
        assert!(store.list().await.unwrap().is_empty());
    }
}
