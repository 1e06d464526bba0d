use anyhow::Result;
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::models::{Source, SourceFormat};

/// Enumerates the candidate files of one source configuration.
#[async_trait]
pub trait SourceDiscovery: Send + Sync {
    async fn discover(&self, config: &SourceConfig) -> Result<Vec<Source>>;
}

/// Walks the configured watch directories on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDiscovery;

#[async_trait]
impl SourceDiscovery for FsDiscovery {
    async fn discover(&self, config: &SourceConfig) -> Result<Vec<Source>> {
        let config = config.clone();
        tokio::task::spawn_blocking(move || scan_source_config(&config)).await?
    }
}

/// Identifier of a file under a given source configuration.
///
/// The configuration id is part of the hashed input, so the same physical
/// file watched by two configurations gets two identities.
pub fn source_identifier(config_id: &str, path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    format!("{}:{}", config_id, hex::encode(&digest[..16]))
}

pub fn scan_source_config(config: &SourceConfig) -> Result<Vec<Source>> {
    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec!["**/.*/**".to_string(), "**/.*".to_string()];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut sources = Vec::new();

    for dir in &config.directories {
        if !dir.is_dir() {
            warn!(config = %config.id, dir = %dir.display(), "watch directory does not exist");
            continue;
        }
        let root = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.clone());
        let mut found = Vec::new();

        let mut walker = WalkDir::new(&root);
        if !config.recursive {
            walker = walker.max_depth(1);
        }
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(config = %config.id, error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            // Apply exclude patterns
            if exclude_set.is_match(&rel_str) {
                continue;
            }

            // Apply include patterns (empty list means everything)
            if !config.include_globs.is_empty() && !include_set.is_match(&rel_str) {
                continue;
            }

            let Some(format) = path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(SourceFormat::from_extension)
            else {
                continue;
            };
            if !format_enabled(config, format) {
                continue;
            }

            found.push(path_to_source(config, &root, path, relative, format));
        }

        // Sort for deterministic ordering
        found.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        debug!(config = %config.id, dir = %root.display(), count = found.len(), "discovered sources");
        sources.extend(found);
    }

    Ok(sources)
}

fn format_enabled(config: &SourceConfig, format: SourceFormat) -> bool {
    match format {
        SourceFormat::Image => config.formats.image,
        SourceFormat::Pdf => config.formats.pdf,
        SourceFormat::Notebook => config.formats.notebook,
    }
}

fn path_to_source(
    config: &SourceConfig,
    root: &Path,
    path: &Path,
    relative: &Path,
    format: SourceFormat,
) -> Source {
    let basename = path
        .file_stem()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    Source {
        id: source_identifier(&config.id, path),
        format,
        path: path.to_path_buf(),
        basename,
        root: root.to_path_buf(),
        relative_path: PathBuf::from(relative),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConflictPolicy, FormatToggles};
    use std::fs;
    use tempfile::TempDir;

    fn folder_config(id: &str, dir: &Path) -> SourceConfig {
        SourceConfig {
            id: id.into(),
            name: None,
            kind: "folder".into(),
            directories: vec![dir.to_path_buf()],
            recursive: true,
            formats: FormatToggles::default(),
            include_globs: vec![],
            exclude_globs: vec![],
            output_root: PathBuf::from("/out"),
            conflict: ConflictPolicy::KeepBoth,
            attachment_max_width: 2000,
            pdf_dpi: 150,
            preset: Some("p".into()),
        }
    }

    fn fixture() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("notes/deep")).unwrap();
        fs::create_dir_all(root.join(".trash")).unwrap();
        fs::write(root.join("notes/a.pdf"), b"pdf").unwrap();
        fs::write(root.join("notes/deep/b.PNG"), b"png").unwrap();
        fs::write(root.join("c.rmdoc"), b"zip").unwrap();
        fs::write(root.join("readme.md"), b"text").unwrap();
        fs::write(root.join(".trash/old.pdf"), b"pdf").unwrap();
        tmp
    }

    #[test]
    fn discovers_supported_formats_recursively() {
        let tmp = fixture();
        let sources = scan_source_config(&folder_config("notes", tmp.path())).unwrap();
        let rels: Vec<_> = sources
            .iter()
            .map(|s| s.relative_path.to_string_lossy().to_string())
            .collect();
        assert_eq!(rels, vec!["c.rmdoc", "notes/a.pdf", "notes/deep/b.PNG"]);

        let pdf = &sources[1];
        assert_eq!(pdf.format, SourceFormat::Pdf);
        assert_eq!(pdf.basename, "a");
        assert_eq!(pdf.relative_folder(), PathBuf::from("notes"));
    }

    #[test]
    fn respects_depth_and_format_toggles() {
        let tmp = fixture();
        let mut config = folder_config("notes", tmp.path());
        config.recursive = false;
        config.formats.notebook = false;
        let sources = scan_source_config(&config).unwrap();
        assert!(sources.is_empty());

        config.recursive = true;
        config.include_globs = vec!["notes/**".into()];
        config.exclude_globs = vec!["**/deep/**".into()];
        let sources = scan_source_config(&config).unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].basename, "a");
    }

    #[test]
    fn same_path_under_two_configs_gets_distinct_ids() {
        let tmp = fixture();
        let a = scan_source_config(&folder_config("notes", tmp.path())).unwrap();
        let b = scan_source_config(&folder_config("journal", tmp.path())).unwrap();
        assert_eq!(a[1].path, b[1].path);
        assert_ne!(a[1].id, b[1].id);
        assert_eq!(a[1].id, source_identifier("notes", &a[1].path));
    }

    #[test]
    fn missing_directory_yields_no_sources() {
        let tmp = TempDir::new().unwrap();
        let config = folder_config("notes", &tmp.path().join("absent"));
        assert!(scan_source_config(&config).unwrap().is_empty());
    }
}
