//! Error types for ink2md.
//!
//! Component seams return typed errors so callers can tell recoverable
//! conditions (a file that cannot be read, a flaky provider) from the
//! outcomes that change control flow (cancellation, a run already active).

use std::path::PathBuf;

use thiserror::Error;

/// Failure while fingerprinting a file.
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("cannot stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("hashing {path} failed: {reason}")]
    Hash { path: PathBuf, reason: String },
}

/// Failure reported by a Markdown generation provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The cancellation token fired while the provider was working.
    #[error("generation cancelled")]
    Cancelled,

    #[error("provider '{0}' requires a credential")]
    MissingCredential(String),

    #[error("preset misconfigured: {0}")]
    Misconfigured(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("provider returned an empty response")]
    EmptyResponse,

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("cannot prepare page image: {0}")]
    Image(String),

    /// The fragment sink (usually the note file) refused a write.
    #[error("writing streamed text failed: {0}")]
    Sink(#[from] std::io::Error),
}

impl ProviderError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }
}

/// Why a source configuration was excluded from a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigIssue {
    #[error("source '{source_name}': unsupported source type '{kind}'")]
    UnsupportedKind { source_name: String, kind: String },

    #[error("source '{source_name}': no watch directories configured")]
    NoDirectories { source_name: String },

    #[error("source '{source_name}': no generation preset linked")]
    NoPreset { source_name: String },

    #[error("source '{source_name}': preset '{preset}' does not exist")]
    UnknownPreset { source_name: String, preset: String },

    #[error("source '{source_name}': preset '{preset}' has no model configured")]
    IncompletePreset { source_name: String, preset: String },

    #[error("source '{source_name}': preset '{preset}' requires a {provider} credential")]
    MissingCredential {
        source_name: String,
        preset: String,
        provider: String,
    },
}

/// Failure that prevents an import run from starting.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("an import is already running")]
    AlreadyRunning,
}
