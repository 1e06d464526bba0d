//! Content fingerprinting.
//!
//! A fingerprint is the SHA-256 digest of a file's bytes plus its size and
//! modification time. Hashing runs on the blocking pool and reads the file
//! in 1 MiB chunks, so large PDFs do not have to fit in memory.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::FingerprintError;
use crate::models::ContentFingerprint;

const READ_CHUNK: usize = 1024 * 1024;

/// Size and modification time observed by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mtime_ms: i64,
}

pub async fn stat_file(path: &Path) -> Result<FileStat, FingerprintError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|source| FingerprintError::Stat {
            path: path.to_path_buf(),
            source,
        })?;
    let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(FileStat {
        size: metadata.len(),
        mtime_ms,
    })
}

/// Computes a stable content digest for a file.
#[async_trait]
pub trait ContentHasher: Send + Sync {
    /// Hex-encoded digest of the file's bytes.
    async fn digest(&self, path: &Path) -> Result<String, FingerprintError>;
}

/// SHA-256 content hasher.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

#[async_trait]
impl ContentHasher for Sha256Hasher {
    async fn digest(&self, path: &Path) -> Result<String, FingerprintError> {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || hash_file(&owned))
            .await
            .map_err(|e| FingerprintError::Hash {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
    }
}

fn hash_file(path: &PathBuf) -> Result<String, FingerprintError> {
    let read_err = |source| FingerprintError::Read {
        path: path.clone(),
        source,
    };
    let mut file = std::fs::File::open(path).map_err(read_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf).map_err(read_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Full fingerprint of a file: stat first, then hash.
pub async fn fingerprint_file(
    hasher: &dyn ContentHasher,
    path: &Path,
) -> Result<ContentFingerprint, FingerprintError> {
    let stat = stat_file(path).await?;
    let digest = hasher.digest(path).await?;
    Ok(ContentFingerprint {
        digest,
        size: stat.size,
        mtime_ms: stat.mtime_ms,
    })
}

/// Digest of an in-memory buffer, same encoding as [`Sha256Hasher`].
pub fn digest_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
