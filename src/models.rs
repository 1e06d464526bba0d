//! Core data models used throughout ink2md.
//!
//! These types describe the sources, jobs, converted pages, and fingerprint
//! records that flow through the import pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{GenerationPreset, SourceConfig};

/// Declared input format of a discovered file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Image,
    Pdf,
    Notebook,
}

impl SourceFormat {
    /// Detect the format from a file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" | "jpg" | "jpeg" | "webp" | "gif" | "bmp" | "tif" | "tiff" => {
                Some(SourceFormat::Image)
            }
            "pdf" => Some(SourceFormat::Pdf),
            "note" | "notebook" | "rmdoc" => Some(SourceFormat::Notebook),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Image => "image",
            SourceFormat::Pdf => "pdf",
            SourceFormat::Notebook => "notebook",
        }
    }
}

/// One discovered candidate file for import.
///
/// Recreated on every discovery pass and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// Stable identifier derived from the owning configuration id and the path.
    pub id: String,
    pub format: SourceFormat,
    /// Absolute path of the file.
    pub path: PathBuf,
    /// File name without extension (`a` for `notes/a.pdf`).
    pub basename: String,
    /// Watch directory the file was discovered under.
    pub root: PathBuf,
    /// Path relative to `root`, used to mirror subfolders in the output tree.
    pub relative_path: PathBuf,
}

impl Source {
    /// Directory part of [`relative_path`](Self::relative_path); empty for top-level files.
    pub fn relative_folder(&self) -> PathBuf {
        self.relative_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default()
    }
}

/// A source paired with its configuration and resolved preset for one run.
#[derive(Debug, Clone)]
pub struct ImportJob {
    pub source: Source,
    pub config: Arc<SourceConfig>,
    pub preset: Arc<GenerationPreset>,
}

/// One rasterized page of a converted note.
#[derive(Debug, Clone)]
pub struct Page {
    /// 1-based page number.
    pub number: u32,
    /// File name the page is written under inside the note folder.
    pub file_name: String,
    pub width: u32,
    pub height: u32,
    /// Encoded PNG bytes.
    pub png: Vec<u8>,
}

/// Output of the conversion step: the source plus its ordered pages.
#[derive(Debug, Clone)]
pub struct ConvertedNote {
    pub source: Source,
    pub pages: Vec<Page>,
}

/// Freshly observed fingerprint of a file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFingerprint {
    pub digest: String,
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub mtime_ms: i64,
}

/// Cached fingerprint of a processed source, keyed by source identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub source_id: String,
    pub digest: String,
    pub size: u64,
    pub mtime_ms: i64,
    /// ISO-8601 time the source was last processed.
    pub processed_at: String,
    pub output_folder: PathBuf,
    /// Identifier of the source configuration that produced this record.
    pub config_id: String,
}

impl FingerprintRecord {
    pub fn from_fingerprint(
        source_id: &str,
        config_id: &str,
        fingerprint: &ContentFingerprint,
        output_folder: PathBuf,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            digest: fingerprint.digest.clone(),
            size: fingerprint.size,
            mtime_ms: fingerprint.mtime_ms,
            processed_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            output_folder,
            config_id: config_id.to_string(),
        }
    }
}
