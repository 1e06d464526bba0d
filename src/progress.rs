//! Import progress reporting.
//!
//! Reports observable progress during `ink2md import` so users see which
//! configuration is being scanned, which note is being worked on, and how
//! many are left. Progress is emitted on **stderr** so stdout remains
//! parseable for scripts.

use std::io::Write;

/// A single progress event for an import run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportProgressEvent {
    /// Jobs are being collected (discovery running, total unknown).
    Scanning,
    /// Job `n` of `total` started.
    Processing { source: String, n: u64, total: u64 },
    /// Job `n` of `total` needed no work.
    Skipped { source: String, n: u64, total: u64 },
    /// A note was written.
    Written { note: String },
    /// Cancellation observed; no further jobs start.
    Cancelling,
}

/// Reports import progress. Implementations write to stderr (human or JSON).
pub trait ImportProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the import executor.
    fn report(&self, event: ImportProgressEvent);
}

/// Human-friendly progress on stderr: "import  1,234 / 5,000  notes/a.pdf".
pub struct StderrProgress;

impl ImportProgressReporter for StderrProgress {
    fn report(&self, event: ImportProgressEvent) {
        let line = match &event {
            ImportProgressEvent::Scanning => "import  scanning sources...\n".to_string(),
            ImportProgressEvent::Processing { source, n, total } => format!(
                "import  {} / {}  {}\n",
                format_number(*n),
                format_number(*total),
                source
            ),
            ImportProgressEvent::Skipped { source, n, total } => format!(
                "import  {} / {}  {} (unchanged)\n",
                format_number(*n),
                format_number(*total),
                source
            ),
            ImportProgressEvent::Written { note } => format!("import  wrote {}\n", note),
            ImportProgressEvent::Cancelling => "import  cancelling...\n".to_string(),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ImportProgressReporter for JsonProgress {
    fn report(&self, event: ImportProgressEvent) {
        let obj = match &event {
            ImportProgressEvent::Scanning => serde_json::json!({
                "event": "progress",
                "phase": "scanning"
            }),
            ImportProgressEvent::Processing { source, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "processing",
                "source": source,
                "n": n,
                "total": total
            }),
            ImportProgressEvent::Skipped { source, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "skipped",
                "source": source,
                "n": n,
                "total": total
            }),
            ImportProgressEvent::Written { note } => serde_json::json!({
                "event": "written",
                "note": note
            }),
            ImportProgressEvent::Cancelling => serde_json::json!({
                "event": "progress",
                "phase": "cancelling"
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ImportProgressReporter for NoProgress {
    fn report(&self, _event: ImportProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ImportProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
