//! Decides whether a source needs to be (re)processed.
//!
//! Checks run cheapest first and each one can end the evaluation:
//!
//! 1. `stat` the file; failure means "process" (conversion will report it).
//! 2. Cached record with identical size and mtime: fresh, no hashing.
//! 3. Hash the content; failure means "process".
//! 4. Cached digest equals the new digest: the file was touched, not
//!    changed. The cached size and mtime are rewritten and the source is fresh.
//! 5. Otherwise process, handing back the new fingerprint and the folder the
//!    previous import wrote to.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::cache::FingerprintStore;
use crate::fingerprint::{stat_file, ContentHasher};
use crate::models::{ContentFingerprint, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshReason {
    /// Size and mtime match the cached record.
    Unchanged,
    /// Metadata changed but the digest did not; the record was refreshed.
    Repaired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Fresh(FreshReason),
    Stale {
        fingerprint: Option<ContentFingerprint>,
        previous_output_folder: Option<PathBuf>,
    },
}

impl Freshness {
    pub fn must_process(&self) -> bool {
        matches!(self, Freshness::Stale { .. })
    }
}

pub struct FreshnessEvaluator<'a> {
    store: &'a dyn FingerprintStore,
    hasher: &'a dyn ContentHasher,
}

impl<'a> FreshnessEvaluator<'a> {
    pub fn new(store: &'a dyn FingerprintStore, hasher: &'a dyn ContentHasher) -> Self {
        Self { store, hasher }
    }

    pub async fn evaluate(&self, source: &Source) -> Freshness {
        let stat = match stat_file(&source.path).await {
            Ok(stat) => stat,
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "stat failed; source will be processed");
                return Freshness::Stale {
                    fingerprint: None,
                    previous_output_folder: None,
                };
            }
        };

        let cached = match self.store.get(&source.id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "fingerprint lookup failed");
                None
            }
        };

        if let Some(record) = &cached {
            if record.size == stat.size && record.mtime_ms == stat.mtime_ms {
                debug!(source_id = %source.id, "unchanged since last import");
                return Freshness::Fresh(FreshReason::Unchanged);
            }
        }

        let previous_output_folder = cached.as_ref().map(|r| r.output_folder.clone());

        let digest = match self.hasher.digest(&source.path).await {
            Ok(digest) => digest,
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "hashing failed; source will be processed");
                return Freshness::Stale {
                    fingerprint: None,
                    previous_output_folder,
                };
            }
        };

        if let Some(mut record) = cached {
            if record.digest == digest {
                record.size = stat.size;
                record.mtime_ms = stat.mtime_ms;
                if let Err(e) = self.store.put(&record).await {
                    warn!(source_id = %source.id, error = %e, "could not refresh fingerprint metadata");
                }
                debug!(source_id = %source.id, "content unchanged; refreshed cached metadata");
                return Freshness::Fresh(FreshReason::Repaired);
            }
        }

        Freshness::Stale {
            fingerprint: Some(ContentFingerprint {
                digest,
                size: stat.size,
                mtime_ms: stat.mtime_ms,
            }),
            previous_output_folder,
        }
    }
}
