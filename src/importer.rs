//! Import executor.
//!
//! Drives one import run over the job queue:
//!
//! ```text
//! collect ─▶ for each job ─┬─ cancelled? ─▶ stop
//!                          ├─ fresh?     ─▶ next job
//!                          ├─ convert    ─▶ none: next job
//!                          ├─ cancelled? ─▶ stop (nothing written)
//!                          ├─ generate   ─▶ batch | stream
//!                          ├─ write attachments + note
//!                          └─ remember fingerprint, surface note
//! ```
//!
//! Jobs run strictly one after another. A job's files and its fingerprint
//! record are written before the next job starts, so a crash loses at most
//! the in-flight job. Per-job failures are logged and counted; only
//! cancellation ends the loop early.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cache::{FingerprintStore, ResetScope, SqliteFingerprintStore};
use crate::collector::collect_jobs;
use crate::config::{Config, GenerationMode};
use crate::controller::{ImportController, ImportPhase, RunGuard};
use crate::convert::{ConvertOptions, NoteConverter, RasterConverter};
use crate::discovery::{FsDiscovery, SourceDiscovery};
use crate::error::{ConfigIssue, ImportError, ProviderError};
use crate::fingerprint::{fingerprint_file, ContentHasher, Sha256Hasher};
use crate::freshness::{Freshness, FreshnessEvaluator};
use crate::models::{ContentFingerprint, ConvertedNote, FingerprintRecord, ImportJob};
use crate::output::{
    ensure_folder, note_path, render_gallery, render_header, render_note, resolve_folder,
    write_attachments, write_note, StreamingNoteWriter, GENERATION_FAILED_PLACEHOLDER,
};
use crate::progress::{ImportProgressEvent, ImportProgressReporter, NoProgress, ProgressMode};
use crate::provider::{HttpProviderFactory, MarkdownProvider, ProviderFactory};

/// Presents a written note to the user.
pub trait NoteSurface: Send + Sync {
    fn surface(&self, note: &Path);
}

/// Prints the note path to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSurface;

impl NoteSurface for StdoutSurface {
    fn surface(&self, note: &Path) {
        println!("  note: {}", note.display());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Every queued job was attempted.
    Completed,
    /// Cancellation stopped the run before the queue was exhausted.
    Cancelled,
    /// No job could be collected; the user has to fix the configuration.
    NothingToImport,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub outcome: ImportOutcome,
    /// Jobs in the queue.
    pub queued: usize,
    /// Jobs started before the run ended.
    pub attempted: usize,
    pub imported: usize,
    pub unchanged: usize,
    pub conversion_failures: usize,
    pub generation_failures: usize,
    pub write_failures: usize,
    pub notes: Vec<PathBuf>,
    pub issues: Vec<ConfigIssue>,
}

impl ImportSummary {
    fn new(outcome: ImportOutcome, queued: usize, issues: Vec<ConfigIssue>) -> Self {
        Self {
            outcome,
            queued,
            attempted: 0,
            imported: 0,
            unchanged: 0,
            conversion_failures: 0,
            generation_failures: 0,
            write_failures: 0,
            notes: Vec::new(),
            issues,
        }
    }

    /// Final status line for the controller.
    pub fn status_line(&self) -> String {
        match self.outcome {
            ImportOutcome::Completed => format!("imported {} notes", self.imported),
            ImportOutcome::Cancelled => "cancelled".to_string(),
            ImportOutcome::NothingToImport => "configuration required".to_string(),
        }
    }
}

enum JobOutcome {
    Unchanged,
    ConversionFailed,
    WriteFailed,
    Cancelled,
    Written {
        note: PathBuf,
        generation_failed: bool,
    },
}

/// Runs imports with injectable collaborators.
pub struct Importer {
    controller: Arc<ImportController>,
    store: Arc<dyn FingerprintStore>,
    discovery: Arc<dyn SourceDiscovery>,
    converter: Arc<dyn NoteConverter>,
    providers: Arc<dyn ProviderFactory>,
    hasher: Arc<dyn ContentHasher>,
    surface: Arc<dyn NoteSurface>,
    progress: Box<dyn ImportProgressReporter>,
}

impl Importer {
    /// Importer wired to the filesystem, the raster converter and the HTTP providers.
    pub fn new(store: Arc<dyn FingerprintStore>) -> Self {
        Self {
            controller: ImportController::new(),
            store,
            discovery: Arc::new(FsDiscovery),
            converter: Arc::new(RasterConverter),
            providers: Arc::new(HttpProviderFactory),
            hasher: Arc::new(Sha256Hasher),
            surface: Arc::new(StdoutSurface),
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_controller(mut self, controller: Arc<ImportController>) -> Self {
        self.controller = controller;
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn SourceDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn NoteConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_providers(mut self, providers: Arc<dyn ProviderFactory>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_surface(mut self, surface: Arc<dyn NoteSurface>) -> Self {
        self.surface = surface;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ImportProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn controller(&self) -> &Arc<ImportController> {
        &self.controller
    }

    pub fn request_cancel(&self) -> bool {
        self.controller.request_cancel()
    }

    pub fn status(&self) -> String {
        self.controller.status()
    }

    /// Run one import over `config`. Rejected while another run is active.
    pub async fn start_import(&self, config: &Config) -> Result<ImportSummary, ImportError> {
        let run = self.controller.begin()?;
        self.progress.report(ImportProgressEvent::Scanning);

        let queue = collect_jobs(config, self.discovery.as_ref()).await;
        if queue.is_empty() {
            let summary = ImportSummary::new(ImportOutcome::NothingToImport, 0, queue.issues);
            info!("no import jobs collected; configuration required");
            run.finish(ImportPhase::Idle, summary.status_line());
            return Ok(summary);
        }

        let total = queue.jobs.len();
        let mut summary = ImportSummary::new(ImportOutcome::Completed, total, queue.issues);
        let mut providers: HashMap<String, Option<Arc<dyn MarkdownProvider>>> = HashMap::new();

        for (index, job) in queue.jobs.iter().enumerate() {
            if run.is_cancelled() {
                break;
            }
            summary.attempted += 1;
            let n = (index + 1) as u64;
            let label = job.source.relative_path.display().to_string();
            self.progress.report(ImportProgressEvent::Processing {
                source: label.clone(),
                n,
                total: total as u64,
            });

            let provider = providers
                .entry(job.preset.id.clone())
                .or_insert_with(|| match self.providers.create(&job.preset) {
                    Ok(provider) => Some(provider),
                    Err(e) => {
                        warn!(preset = %job.preset.id, error = %e, "cannot create provider");
                        None
                    }
                })
                .clone();

            match self
                .run_job(&run, job, provider, config.import.open_after_import, (n, total))
                .await
            {
                JobOutcome::Unchanged => {
                    summary.unchanged += 1;
                    self.progress.report(ImportProgressEvent::Skipped {
                        source: label,
                        n,
                        total: total as u64,
                    });
                }
                JobOutcome::ConversionFailed => summary.conversion_failures += 1,
                JobOutcome::WriteFailed => summary.write_failures += 1,
                JobOutcome::Cancelled => break,
                JobOutcome::Written {
                    note,
                    generation_failed,
                } => {
                    if generation_failed {
                        summary.generation_failures += 1;
                    }
                    summary.imported += 1;
                    self.progress.report(ImportProgressEvent::Written {
                        note: note.display().to_string(),
                    });
                    summary.notes.push(note);
                }
            }
        }

        if run.is_cancelled() {
            summary.outcome = ImportOutcome::Cancelled;
            self.progress.report(ImportProgressEvent::Cancelling);
            info!(attempted = summary.attempted, imported = summary.imported, "import cancelled");
            run.finish(ImportPhase::Cancelled, summary.status_line());
        } else {
            info!(
                imported = summary.imported,
                unchanged = summary.unchanged,
                conversion_failures = summary.conversion_failures,
                generation_failures = summary.generation_failures,
                "import finished"
            );
            run.finish(ImportPhase::Idle, summary.status_line());
        }
        Ok(summary)
    }

    async fn run_job(
        &self,
        run: &RunGuard,
        job: &ImportJob,
        provider: Option<Arc<dyn MarkdownProvider>>,
        open_after_import: bool,
        (n, total): (u64, usize),
    ) -> JobOutcome {
        let source = &job.source;

        let evaluator = FreshnessEvaluator::new(self.store.as_ref(), self.hasher.as_ref());
        let (fingerprint, reuse_hint) = match evaluator.evaluate(source).await {
            Freshness::Fresh(reason) => {
                debug!(source_id = %source.id, ?reason, "source unchanged");
                return JobOutcome::Unchanged;
            }
            Freshness::Stale {
                fingerprint,
                previous_output_folder,
            } => (fingerprint, previous_output_folder),
        };
        if run.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        run.set_phase(
            ImportPhase::Converting,
            format!("converting {} ({}/{})", source.basename, n, total),
        );
        let options = ConvertOptions {
            max_width: job.config.attachment_max_width,
            dpi: job.config.pdf_dpi,
        };
        let Some(note) = self.converter.convert(source, options).await else {
            warn!(source_id = %source.id, path = %source.path.display(), "conversion failed; skipping");
            return JobOutcome::ConversionFailed;
        };
        if run.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        run.set_phase(
            ImportPhase::Generating,
            format!("generating {} ({}/{})", source.basename, n, total),
        );
        let processed_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let written = match job.preset.mode {
            GenerationMode::Batch => {
                self.generate_batch(run, job, provider, &note, reuse_hint.as_deref(), &processed_at)
                    .await
            }
            GenerationMode::Stream => {
                self.generate_streaming(run, job, provider, &note, reuse_hint.as_deref(), &processed_at)
                    .await
            }
        };
        let (note_file, folder, generation_failed) = match written {
            Ok(Some(written)) => written,
            Ok(None) => return JobOutcome::Cancelled,
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "writing note failed");
                return JobOutcome::WriteFailed;
            }
        };

        self.remember(job, fingerprint, &folder).await;
        if open_after_import {
            self.surface.surface(&note_file);
        }
        info!(source_id = %source.id, note = %note_file.display(), "imported note");

        JobOutcome::Written {
            note: note_file,
            generation_failed,
        }
    }

    /// Request the whole text, then write the note.
    ///
    /// The folder is resolved only after the provider answered, so a request
    /// aborted by cancellation leaves the output tree untouched. A completed
    /// request is persisted even if cancellation arrived meanwhile.
    async fn generate_batch(
        &self,
        run: &RunGuard,
        job: &ImportJob,
        provider: Option<Arc<dyn MarkdownProvider>>,
        note: &ConvertedNote,
        reuse_hint: Option<&Path>,
        processed_at: &str,
    ) -> std::io::Result<Option<(PathBuf, PathBuf, bool)>> {
        let source = &job.source;
        let generated = match provider {
            Some(provider) => {
                match provider
                    .generate_markdown(note, job.preset.image_max_width, run.token())
                    .await
                {
                    Ok(text) => Some(text),
                    Err(e) if e.is_cancelled() => return Ok(None),
                    Err(e) => {
                        warn!(source_id = %source.id, provider = provider.name(), error = %e, "generation failed");
                        None
                    }
                }
            }
            None => None,
        };
        let generation_failed = generated.is_none();
        let body = generated.as_deref().unwrap_or(GENERATION_FAILED_PLACEHOLDER);

        run.set_phase(ImportPhase::Writing, format!("writing {}", source.basename));
        let folder = ensure_folder(source, &job.config, reuse_hint).await?;
        let note_file = write_note(&folder, note, body, processed_at).await?;
        Ok(Some((note_file, folder, generation_failed)))
    }

    /// Stream fragments into the note file.
    ///
    /// A note left by an earlier import is only replaced once the stream
    /// completes; cancellation keeps it and its attachments as they were.
    async fn generate_streaming(
        &self,
        run: &RunGuard,
        job: &ImportJob,
        provider: Option<Arc<dyn MarkdownProvider>>,
        note: &ConvertedNote,
        reuse_hint: Option<&Path>,
        processed_at: &str,
    ) -> std::io::Result<Option<(PathBuf, PathBuf, bool)>> {
        let source = &job.source;
        let resolved = resolve_folder(source, &job.config, reuse_hint).await?;
        let folder = resolved.path;
        let mut writer = StreamingNoteWriter::create(
            note_path(&folder, source),
            &render_header(note, processed_at),
            resolved.created,
        )
        .await?;

        let (provider_name, streamed) = match provider {
            Some(provider) => (
                provider.name().to_string(),
                provider
                    .stream_markdown(note, job.preset.image_max_width, &mut writer, run.token())
                    .await,
            ),
            None => (
                job.preset.id.clone(),
                Err(ProviderError::Misconfigured("provider unavailable".to_string())),
            ),
        };

        run.set_phase(ImportPhase::Writing, format!("writing {}", source.basename));
        match streamed {
            Ok(()) => {
                write_attachments(&folder, note).await?;
                let note_file = writer.finish(&render_gallery(&note.pages)).await?;
                Ok(Some((note_file, folder, false)))
            }
            Err(e) if e.is_cancelled() => {
                debug!(source_id = %source.id, "stream cancelled; discarding partial note");
                writer.discard().await?;
                Ok(None)
            }
            Err(e) => {
                warn!(
                    source_id = %source.id,
                    provider = %provider_name,
                    fragments = writer.fragments(),
                    error = %e,
                    "streaming generation failed"
                );
                write_attachments(&folder, note).await?;
                let note_file = writer
                    .fail(&render_note(note, GENERATION_FAILED_PLACEHOLDER, processed_at))
                    .await?;
                Ok(Some((note_file, folder, true)))
            }
        }
    }

    /// Record the fingerprint and output folder of a processed source.
    async fn remember(
        &self,
        job: &ImportJob,
        fingerprint: Option<ContentFingerprint>,
        folder: &Path,
    ) {
        let source = &job.source;
        let fingerprint = match fingerprint {
            Some(fp) => fp,
            None => match fingerprint_file(self.hasher.as_ref(), &source.path).await {
                Ok(fp) => fp,
                Err(e) => {
                    warn!(source_id = %source.id, error = %e, "cannot fingerprint source; not cached");
                    return;
                }
            },
        };
        let record = FingerprintRecord::from_fingerprint(
            &source.id,
            &job.config.id,
            &fingerprint,
            folder.to_path_buf(),
        );
        if let Err(e) = self.store.put(&record).await {
            warn!(source_id = %source.id, error = %e, "failed to store fingerprint");
        }
    }
}

/// `ink2md import`: run one import against the SQLite cache.
///
/// Ctrl-C requests cancellation; the run then stops before the next job.
pub async fn run_import(config: &Config, progress: ProgressMode) -> Result<()> {
    let store = Arc::new(SqliteFingerprintStore::open(config).await?);
    let importer = Importer::new(store.clone()).with_progress(progress.reporter());

    let controller = Arc::clone(importer.controller());
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            controller.request_cancel();
        }
    });

    let summary = importer.start_import(config).await;
    interrupt.abort();
    let summary = summary?;

    println!("import");
    for issue in &summary.issues {
        println!("  skipped config: {}", issue);
    }
    if summary.outcome == ImportOutcome::NothingToImport {
        println!("  configuration required");
        store.close().await;
        return Ok(());
    }
    println!("  queued: {}", summary.queued);
    println!("  unchanged: {}", summary.unchanged);
    println!("  imported: {}", summary.imported);
    if summary.conversion_failures > 0 {
        println!("  conversion failures: {}", summary.conversion_failures);
    }
    if summary.generation_failures > 0 {
        println!("  generation failures: {}", summary.generation_failures);
    }
    if summary.write_failures > 0 {
        println!("  write failures: {}", summary.write_failures);
    }
    match summary.outcome {
        ImportOutcome::Cancelled => println!("cancelled"),
        _ => println!("ok"),
    }

    store.close().await;
    Ok(())
}

/// Drop cached fingerprints in `scope`. Returns the number of records removed.
pub async fn reset_fingerprint_cache(
    store: &dyn FingerprintStore,
    scope: &ResetScope,
) -> Result<u64> {
    let removed = store.reset(scope).await?;
    info!(?scope, removed, "fingerprint cache reset");
    Ok(removed)
}
