//! In-memory [`FingerprintStore`] implementation for tests.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::FingerprintRecord;

use super::{FingerprintStore, ResetScope};

#[derive(Default)]
pub struct MemoryFingerprintStore {
    records: RwLock<BTreeMap<String, FingerprintRecord>>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. with a record from a previous run.
    pub fn with_records(records: impl IntoIterator<Item = FingerprintRecord>) -> Self {
        let map = records
            .into_iter()
            .map(|r| (r.source_id.clone(), r))
            .collect();
        Self {
            records: RwLock::new(map),
        }
    }
}

fn poisoned() -> anyhow::Error {
    anyhow!("fingerprint store lock poisoned")
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn get(&self, source_id: &str) -> Result<Option<FingerprintRecord>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(source_id).cloned())
    }

    async fn put(&self, record: &FingerprintRecord) -> Result<()> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        records.insert(record.source_id.clone(), record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FingerprintRecord>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.values().cloned().collect())
    }

    async fn reset(&self, scope: &ResetScope) -> Result<u64> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let before = records.len();
        records.retain(|_, r| !scope.matches(r));
        Ok((before - records.len()) as u64)
    }
}
