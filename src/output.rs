//! Output folders and note persistence.
//!
//! Every imported source gets its own folder under the configuration's
//! `output_root`, mirroring the source's subdirectory:
//!
//! ```text
//! scans/notes/a.pdf  ──▶  <output_root>/notes/a/a.md
//!                                        /a/a-p1.png
//!                                        /a/a-p2.png
//! ```
//!
//! Folder names are probed as `a`, `a-2`, `a-3`, ... under the keep-both
//! policy; under replace the first existing candidate is cleared and reused.
//!
//! Batch notes are written through a temporary sibling and renamed into
//! place. Streaming notes are written incrementally by [`StreamingNoteWriter`].

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::{ConflictPolicy, SourceConfig};
use crate::models::{ConvertedNote, Page, Source};
use crate::provider::FragmentSink;

/// Body written in place of generated Markdown when the provider fails.
pub const GENERATION_FAILED_PLACEHOLDER: &str =
    "> generation failed: the page images are preserved below.";

/// Output folder chosen for one note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFolder {
    pub path: PathBuf,
    /// `true` when this call created the directory; `false` for reused folders.
    pub created: bool,
}

/// Resolve (and create) the folder a note is written into.
///
/// A `reuse_hint` that still exists as a directory wins over probing; it is
/// cleared first when the policy is [`ConflictPolicy::Replace`].
pub async fn ensure_folder(
    source: &Source,
    config: &SourceConfig,
    reuse_hint: Option<&Path>,
) -> io::Result<PathBuf> {
    Ok(resolve_folder(source, config, reuse_hint).await?.path)
}

/// Like [`ensure_folder`], but also reports whether the folder is new.
pub async fn resolve_folder(
    source: &Source,
    config: &SourceConfig,
    reuse_hint: Option<&Path>,
) -> io::Result<OutputFolder> {
    if let Some(hint) = reuse_hint {
        if is_dir(hint).await {
            if config.conflict == ConflictPolicy::Replace {
                clear_folder(hint).await?;
            }
            debug!(source_id = %source.id, folder = %hint.display(), "reusing output folder");
            return Ok(OutputFolder {
                path: hint.to_path_buf(),
                created: false,
            });
        }
    }

    let base = config.output_root.join(source.relative_folder());
    fs::create_dir_all(&base).await?;

    let stem = folder_stem(source);
    let mut attempt: u32 = 1;
    loop {
        let candidate = if attempt == 1 {
            base.join(stem)
        } else {
            base.join(format!("{}-{}", stem, attempt))
        };

        if fs::symlink_metadata(&candidate).await.is_ok() {
            if config.conflict == ConflictPolicy::Replace && is_dir(&candidate).await {
                clear_folder(&candidate).await?;
                return Ok(OutputFolder {
                    path: candidate,
                    created: false,
                });
            }
            attempt += 1;
            continue;
        }

        match fs::create_dir(&candidate).await {
            Ok(()) => {
                return Ok(OutputFolder {
                    path: candidate,
                    created: true,
                })
            }
            // Lost a race with another writer; probe the next name.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

fn folder_stem(source: &Source) -> &str {
    if source.basename.is_empty() {
        "note"
    } else {
        &source.basename
    }
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

/// Empty `path` and recreate it as an empty directory.
///
/// Falls back to deleting entries one by one when the bulk removal fails.
pub async fn clear_folder(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || clear_folder_blocking(&path))
        .await
        .map_err(io::Error::other)?
}

fn clear_folder_blocking(path: &Path) -> io::Result<()> {
    if let Err(e) = std::fs::remove_dir_all(path) {
        warn!(folder = %path.display(), error = %e, "bulk removal failed, deleting entries");
        remove_entries(path)?;
    }
    std::fs::create_dir_all(path)
}

fn remove_entries(dir: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            remove_entries(&path)?;
            std::fs::remove_dir(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Location of the Markdown file inside a note folder.
pub fn note_path(folder: &Path, source: &Source) -> PathBuf {
    folder.join(format!("{}.md", folder_stem(source)))
}

/// Front matter block, followed by a blank line.
pub fn render_header(note: &ConvertedNote, processed_at: &str) -> String {
    // JSON string literals are valid YAML scalars and escape any path.
    let source = serde_json::to_string(&note.source.path.to_string_lossy())
        .unwrap_or_else(|_| String::from("\"\""));
    format!(
        "---\nsource: {}\nprocessed: {}\npages: {}\n---\n\n",
        source,
        processed_at,
        note.pages.len()
    )
}

/// Image gallery linking each page attachment.
pub fn render_gallery(pages: &[Page]) -> String {
    let mut out = String::from("## Pages\n\n");
    for page in pages {
        out.push_str(&format!("![Page {}]({})\n", page.number, page.file_name));
    }
    out
}

/// Complete note: header, body, gallery.
pub fn render_note(note: &ConvertedNote, body: &str, processed_at: &str) -> String {
    format!(
        "{}{}\n\n{}",
        render_header(note, processed_at),
        body.trim_end(),
        render_gallery(&note.pages)
    )
}

/// Write `contents` to a temporary sibling, then rename it over `path`.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = hidden_sibling(path, "tmp");

    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    result
}

/// `.<name>.<uuid>.<ext>` next to `path`.
fn hidden_sibling(path: &Path, ext: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "note".to_string());
    path.with_file_name(format!(".{}.{}.{}", file_name, uuid::Uuid::new_v4(), ext))
}

/// Persist every page image of `note` into `folder`.
pub async fn write_attachments(folder: &Path, note: &ConvertedNote) -> io::Result<()> {
    for page in &note.pages {
        write_atomic(&folder.join(&page.file_name), &page.png).await?;
    }
    Ok(())
}

/// Write a complete batch note (attachments first, then the Markdown file).
pub async fn write_note(
    folder: &Path,
    note: &ConvertedNote,
    body: &str,
    processed_at: &str,
) -> io::Result<PathBuf> {
    write_attachments(folder, note).await?;
    let path = note_path(folder, &note.source);
    write_atomic(&path, render_note(note, body, processed_at).as_bytes()).await?;
    Ok(path)
}

/// Markdown file that grows as a provider streams fragments into it.
///
/// The header is on disk as soon as the writer exists, so the note can be
/// watched while it is generated. When a note from an earlier import already
/// sits at the target path, fragments go to a hidden `.partial` sibling
/// instead and the previous note stays untouched until
/// [`finish`](Self::finish) renames the sibling over it.
///
/// Exactly one of [`finish`](Self::finish), [`fail`](Self::fail) or
/// [`discard`](Self::discard) ends its life.
#[derive(Debug)]
pub struct StreamingNoteWriter {
    path: PathBuf,
    staging: Option<PathBuf>,
    file: fs::File,
    fragments: usize,
    owns_folder: bool,
}

impl StreamingNoteWriter {
    /// Start a note at `path`. `owns_folder` marks a folder created for this
    /// note, which [`discard`](Self::discard) may then remove when empty.
    pub async fn create(path: PathBuf, header: &str, owns_folder: bool) -> io::Result<Self> {
        let staging = if fs::symlink_metadata(&path).await.is_ok() {
            Some(hidden_sibling(&path, "partial"))
        } else {
            None
        };
        let mut file = fs::File::create(staging.as_deref().unwrap_or(&path)).await?;
        file.write_all(header.as_bytes()).await?;
        file.flush().await?;
        Ok(Self {
            path,
            staging,
            file,
            fragments: 0,
            owns_folder,
        })
    }

    /// Final location of the note.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File currently receiving fragments.
    pub fn writing_path(&self) -> &Path {
        self.staging.as_deref().unwrap_or(&self.path)
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// Append the gallery, sync, and move a staged note into place.
    pub async fn finish(mut self, gallery: &str) -> io::Result<PathBuf> {
        self.file.write_all(b"\n\n").await?;
        self.file.write_all(gallery.as_bytes()).await?;
        self.file.flush().await?;
        self.file.sync_all().await?;
        let Self {
            path,
            staging,
            file,
            ..
        } = self;
        drop(file);
        if let Some(staging) = staging {
            if let Err(e) = fs::rename(&staging, &path).await {
                let _ = fs::remove_file(&staging).await;
                return Err(e);
            }
        }
        Ok(path)
    }

    /// Replace the partial note with `contents` in one atomic step.
    pub async fn fail(self, contents: &str) -> io::Result<PathBuf> {
        let Self {
            path,
            staging,
            file,
            ..
        } = self;
        drop(file);
        if let Some(staging) = staging {
            remove_if_present(&staging).await?;
        }
        write_atomic(&path, contents.as_bytes()).await?;
        Ok(path)
    }

    /// Remove what this writer produced.
    ///
    /// A staged note only loses its `.partial` sibling; the previous note is
    /// left as it was. Otherwise the partial note is removed, along with its
    /// folder when the folder was created for it and is now empty.
    pub async fn discard(self) -> io::Result<()> {
        let Self {
            path,
            staging,
            file,
            owns_folder,
            ..
        } = self;
        drop(file);
        if let Some(staging) = staging {
            return remove_if_present(&staging).await;
        }
        remove_if_present(&path).await?;
        if owns_folder {
            if let Some(folder) = path.parent() {
                if is_empty_dir(folder).await {
                    let _ = fs::remove_dir(folder).await;
                }
            }
        }
        Ok(())
    }
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn is_empty_dir(path: &Path) -> bool {
    match fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

#[async_trait]
impl FragmentSink for StreamingNoteWriter {
    async fn push(&mut self, fragment: &str) -> io::Result<()> {
        self.file.write_all(fragment.as_bytes()).await?;
        self.file.flush().await?;
        self.fragments += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceFormat;
    use std::fs as stdfs;
    use tempfile::TempDir;

    fn source(rel: &str) -> Source {
        let rel = PathBuf::from(rel);
        Source {
            id: "notes:abc".into(),
            format: SourceFormat::Pdf,
            path: PathBuf::from("/scans").join(&rel),
            basename: rel.file_stem().unwrap().to_string_lossy().to_string(),
            root: PathBuf::from("/scans"),
            relative_path: rel,
        }
    }

    fn config(root: &Path, conflict: ConflictPolicy) -> SourceConfig {
        SourceConfig {
            id: "notes".into(),
            name: None,
            kind: "folder".into(),
            directories: vec![PathBuf::from("/scans")],
            recursive: true,
            formats: Default::default(),
            include_globs: vec![],
            exclude_globs: vec![],
            output_root: root.to_path_buf(),
            conflict,
            attachment_max_width: 2000,
            pdf_dpi: 150,
            preset: Some("p".into()),
        }
    }

    fn note(src: Source, pages: u32) -> ConvertedNote {
        ConvertedNote {
            pages: (1..=pages)
                .map(|n| Page {
                    number: n,
                    file_name: format!("{}-p{}.png", src.basename, n),
                    width: 1,
                    height: 1,
                    png: vec![n as u8],
                })
                .collect(),
            source: src,
        }
    }

    #[tokio::test]
    async fn mirrors_subfolders_and_keeps_both() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), ConflictPolicy::KeepBoth);
        let src = source("notes/a.pdf");

        let first = ensure_folder(&src, &cfg, None).await.unwrap();
        assert_eq!(first, tmp.path().join("notes/a"));
        stdfs::write(first.join("a.md"), "old").unwrap();

        let second = ensure_folder(&src, &cfg, None).await.unwrap();
        assert_eq!(second, tmp.path().join("notes/a-2"));
        assert!(first.join("a.md").exists());

        let third = ensure_folder(&src, &cfg, None).await.unwrap();
        assert_eq!(third, tmp.path().join("notes/a-3"));
    }

    #[tokio::test]
    async fn replace_clears_existing_candidate() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), ConflictPolicy::Replace);
        let src = source("a.pdf");

        let folder = ensure_folder(&src, &cfg, None).await.unwrap();
        stdfs::create_dir_all(folder.join("nested")).unwrap();
        stdfs::write(folder.join("nested/x.png"), "x").unwrap();

        let again = ensure_folder(&src, &cfg, None).await.unwrap();
        assert_eq!(again, folder);
        assert_eq!(stdfs::read_dir(&again).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn reuse_hint_is_cleared_under_replace() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), ConflictPolicy::Replace);
        let src = source("notes/a.pdf");

        // Folder recorded by an earlier run under a suffixed name.
        let recorded = tmp.path().join("notes/a-7");
        stdfs::create_dir_all(&recorded).unwrap();
        stdfs::write(recorded.join("a.md"), "old").unwrap();

        let folder = ensure_folder(&src, &cfg, Some(&recorded)).await.unwrap();
        assert_eq!(folder, recorded);
        assert!(!recorded.join("a.md").exists());
        assert!(!tmp.path().join("notes/a").exists());
        assert!(!tmp.path().join("notes/a-2").exists());
    }

    #[tokio::test]
    async fn reuse_hint_is_kept_intact_under_keep_both() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), ConflictPolicy::KeepBoth);
        let src = source("a.pdf");
        let recorded = tmp.path().join("a");
        stdfs::create_dir_all(&recorded).unwrap();
        stdfs::write(recorded.join("a-p1.png"), "x").unwrap();

        let folder = ensure_folder(&src, &cfg, Some(&recorded)).await.unwrap();
        assert_eq!(folder, recorded);
        assert!(recorded.join("a-p1.png").exists());
    }

    #[tokio::test]
    async fn vanished_hint_falls_back_to_probing() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), ConflictPolicy::Replace);
        let src = source("a.pdf");
        let gone = tmp.path().join("gone");

        let folder = ensure_folder(&src, &cfg, Some(&gone)).await.unwrap();
        assert_eq!(folder, tmp.path().join("a"));
        assert!(!gone.exists());
    }

    #[test]
    fn renders_header_body_and_gallery() {
        let n = note(source("notes/a.pdf"), 2);
        let text = render_note(&n, "# Title\n\n", "2026-01-01T00:00:00Z");
        assert!(text.starts_with("---\nsource: \"/scans/notes/a.pdf\"\n"));
        assert!(text.contains("pages: 2\n---\n\n# Title\n\n## Pages\n"));
        assert!(text.ends_with("![Page 1](a-p1.png)\n![Page 2](a-p2.png)\n"));
    }

    #[tokio::test]
    async fn write_note_persists_attachments_and_markdown() {
        let tmp = TempDir::new().unwrap();
        let n = note(source("a.pdf"), 2);
        let path = write_note(tmp.path(), &n, GENERATION_FAILED_PLACEHOLDER, "t")
            .await
            .unwrap();
        assert_eq!(path, tmp.path().join("a.md"));
        assert_eq!(stdfs::read(tmp.path().join("a-p2.png")).unwrap(), vec![2u8]);
        let text = stdfs::read_to_string(&path).unwrap();
        assert!(text.contains(GENERATION_FAILED_PLACEHOLDER));

        // No temporary files left behind.
        let names: Vec<_> = stdfs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
    }

    #[tokio::test]
    async fn streaming_writer_appends_then_finishes() {
        let tmp = TempDir::new().unwrap();
        let n = note(source("a.pdf"), 1);
        let path = note_path(tmp.path(), &n.source);
        let mut writer = StreamingNoteWriter::create(path.clone(), &render_header(&n, "t"), true)
            .await
            .unwrap();
        assert!(stdfs::read_to_string(&path).unwrap().starts_with("---\n"));

        writer.push("Hello ").await.unwrap();
        writer.push("world").await.unwrap();
        assert_eq!(writer.fragments(), 2);
        writer.finish(&render_gallery(&n.pages)).await.unwrap();

        let text = stdfs::read_to_string(&path).unwrap();
        assert!(text.contains("---\n\nHello world\n\n## Pages\n"));
    }

    #[tokio::test]
    async fn discarding_removes_note_and_empty_folder() {
        let tmp = TempDir::new().unwrap();
        let folder = tmp.path().join("a");
        stdfs::create_dir(&folder).unwrap();
        let n = note(source("a.pdf"), 1);
        let mut writer = StreamingNoteWriter::create(note_path(&folder, &n.source), "---\n", true)
            .await
            .unwrap();
        writer.push("partial").await.unwrap();
        writer.discard().await.unwrap();
        assert!(!folder.exists());
    }

    #[tokio::test]
    async fn discarding_keeps_folder_it_did_not_create() {
        let tmp = TempDir::new().unwrap();
        let n = note(source("a.pdf"), 1);
        let writer = StreamingNoteWriter::create(note_path(tmp.path(), &n.source), "---\n", false)
            .await
            .unwrap();
        writer.discard().await.unwrap();
        assert!(tmp.path().exists());
        assert!(!tmp.path().join("a.md").exists());
    }

    #[tokio::test]
    async fn existing_note_survives_discarded_stream() {
        let tmp = TempDir::new().unwrap();
        let n = note(source("a.pdf"), 1);
        let path = note_path(tmp.path(), &n.source);
        stdfs::write(&path, "previous import").unwrap();
        stdfs::write(tmp.path().join("a-p1.png"), "x").unwrap();

        let mut writer = StreamingNoteWriter::create(path.clone(), "---\n", false)
            .await
            .unwrap();
        assert_ne!(writer.writing_path(), path.as_path());
        writer.push("new text").await.unwrap();
        assert_eq!(stdfs::read_to_string(&path).unwrap(), "previous import");

        writer.discard().await.unwrap();
        assert_eq!(stdfs::read_to_string(&path).unwrap(), "previous import");
        let names: Vec<_> = stdfs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 2, "unexpected entries: {:?}", names);
        assert!(names.iter().all(|n| !n.ends_with(".partial")));
    }

    #[tokio::test]
    async fn finishing_staged_note_replaces_previous() {
        let tmp = TempDir::new().unwrap();
        let n = note(source("a.pdf"), 1);
        let path = note_path(tmp.path(), &n.source);
        stdfs::write(&path, "previous import").unwrap();

        let mut writer = StreamingNoteWriter::create(path.clone(), &render_header(&n, "t"), false)
            .await
            .unwrap();
        writer.push("fresh").await.unwrap();
        let staged = writer.writing_path().to_path_buf();
        let written = writer.finish(&render_gallery(&n.pages)).await.unwrap();

        assert_eq!(written, path);
        assert!(!staged.exists());
        let text = stdfs::read_to_string(&path).unwrap();
        assert!(text.contains("fresh"));
        assert!(!text.contains("previous import"));
    }

    #[tokio::test]
    async fn resolve_reports_created_folders_only() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), ConflictPolicy::Replace);
        let src = source("a.pdf");

        let first = resolve_folder(&src, &cfg, None).await.unwrap();
        assert!(first.created);
        let again = resolve_folder(&src, &cfg, None).await.unwrap();
        assert_eq!(again.path, first.path);
        assert!(!again.created);
        let hinted = resolve_folder(&src, &cfg, Some(&first.path)).await.unwrap();
        assert!(!hinted.created);
    }

    #[test]
    fn remove_entries_empties_nested_tree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("note");
        stdfs::create_dir_all(root.join("deep/deeper")).unwrap();
        stdfs::write(root.join("a.md"), "x").unwrap();
        stdfs::write(root.join("deep/a-p1.png"), "x").unwrap();
        stdfs::write(root.join("deep/deeper/a-p2.png"), "x").unwrap();

        remove_entries(&root).unwrap();

        assert!(root.is_dir());
        assert_eq!(stdfs::read_dir(&root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failing_rewrites_whole_note() {
        let tmp = TempDir::new().unwrap();
        let n = note(source("a.pdf"), 1);
        let path = note_path(tmp.path(), &n.source);
        let mut writer = StreamingNoteWriter::create(path.clone(), &render_header(&n, "t"), true)
            .await
            .unwrap();
        writer.push("half a sent").await.unwrap();
        writer
            .fail(&render_note(&n, GENERATION_FAILED_PLACEHOLDER, "t"))
            .await
            .unwrap();

        let text = stdfs::read_to_string(&path).unwrap();
        assert!(!text.contains("half a sent"));
        assert!(text.contains(GENERATION_FAILED_PLACEHOLDER));
        assert!(text.contains("![Page 1](a-p1.png)"));
    }
}
