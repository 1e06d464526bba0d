//! Fingerprint record storage.
//!
//! The [`FingerprintStore`] trait is the cache the freshness evaluator reads
//! and the importer's "remember" step writes. Records are keyed by source
//! identifier; identifiers already encode the owning configuration, so two
//! configurations watching the same file never share a record.
//!
//! Backends:
//! - [`SqliteFingerprintStore`]: durable store used by the CLI.
//! - [`MemoryFingerprintStore`]: in-process store for tests.
//!
//! Every `put` replaces the whole record. Records whose configuration no
//! longer exists are orphans: they are never matched against a live source
//! and can be removed with [`ResetScope::Orphans`].

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::FingerprintRecord;

pub use memory::MemoryFingerprintStore;
pub use sqlite::SqliteFingerprintStore;

/// Which records a cache reset removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetScope {
    All,
    /// Records produced by one source configuration.
    Source(String),
    /// Records whose configuration id is not in the given list.
    Orphans(Vec<String>),
}

impl ResetScope {
    pub fn matches(&self, record: &FingerprintRecord) -> bool {
        match self {
            ResetScope::All => true,
            ResetScope::Source(config_id) => &record.config_id == config_id,
            ResetScope::Orphans(known) => !known.iter().any(|id| id == &record.config_id),
        }
    }
}

#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Look up the record for a source identifier.
    async fn get(&self, source_id: &str) -> Result<Option<FingerprintRecord>>;

    /// Insert or replace the record for `record.source_id`.
    async fn put(&self, record: &FingerprintRecord) -> Result<()>;

    /// All records, ordered by source identifier.
    async fn list(&self) -> Result<Vec<FingerprintRecord>>;

    /// Remove the records selected by `scope`. Returns how many were removed.
    async fn reset(&self, scope: &ResetScope) -> Result<u64>;
}
