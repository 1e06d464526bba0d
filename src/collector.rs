//! Builds the ordered job queue for one import run.
//!
//! Each source configuration is checked before discovery; a configuration
//! that cannot run contributes a [`ConfigIssue`] instead of jobs. Jobs keep
//! configuration order, then discovery order, and are processed as queued.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{Config, GenerationPreset, SourceConfig};
use crate::discovery::SourceDiscovery;
use crate::error::ConfigIssue;
use crate::models::ImportJob;

/// Only folder sources are implemented.
pub const SUPPORTED_SOURCE_KIND: &str = "folder";

#[derive(Debug, Default)]
pub struct JobQueue {
    pub jobs: Vec<ImportJob>,
    /// One entry per configuration that was excluded.
    pub issues: Vec<ConfigIssue>,
}

impl JobQueue {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Resolve the preset a configuration would run with, or the reason it cannot run.
pub fn check_source_config<'a>(
    config: &'a Config,
    source: &SourceConfig,
) -> Result<&'a GenerationPreset, ConfigIssue> {
    let source_name = source.display_name().to_string();

    if source.kind != SUPPORTED_SOURCE_KIND {
        return Err(ConfigIssue::UnsupportedKind {
            source_name,
            kind: source.kind.clone(),
        });
    }
    if source.directories.is_empty() {
        return Err(ConfigIssue::NoDirectories { source_name });
    }
    let Some(preset_id) = source.preset.as_deref().filter(|p| !p.trim().is_empty()) else {
        return Err(ConfigIssue::NoPreset { source_name });
    };
    let Some(preset) = config.preset(preset_id) else {
        return Err(ConfigIssue::UnknownPreset {
            source_name,
            preset: preset_id.to_string(),
        });
    };
    check_preset(preset, source_name)?;
    Ok(preset)
}

fn check_preset(preset: &GenerationPreset, source_name: String) -> Result<(), ConfigIssue> {
    if preset.model.as_deref().map_or(true, |m| m.trim().is_empty()) {
        return Err(ConfigIssue::IncompletePreset {
            source_name,
            preset: preset.id.clone(),
        });
    }
    if preset.provider.requires_credential() && preset.resolve_api_key().is_none() {
        return Err(ConfigIssue::MissingCredential {
            source_name,
            preset: preset.id.clone(),
            provider: preset.provider.as_str().to_string(),
        });
    }
    Ok(())
}

/// Collect import jobs for every runnable source configuration.
pub async fn collect_jobs(config: &Config, discovery: &dyn SourceDiscovery) -> JobQueue {
    let mut queue = JobQueue::default();

    for source_config in &config.sources {
        let preset = match check_source_config(config, source_config) {
            Ok(preset) => Arc::new(preset.clone()),
            Err(issue) => {
                warn!(config = %source_config.id, "{}", issue);
                queue.issues.push(issue);
                continue;
            }
        };

        let sources = match discovery.discover(source_config).await {
            Ok(sources) => sources,
            Err(e) => {
                warn!(config = %source_config.id, error = %e, "source discovery failed");
                continue;
            }
        };
        info!(config = %source_config.id, count = sources.len(), "collected sources");

        let shared = Arc::new(source_config.clone());
        queue
            .jobs
            .extend(sources.into_iter().map(|source| ImportJob {
                source,
                config: Arc::clone(&shared),
                preset: Arc::clone(&preset),
            }));
    }

    queue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, ImportConfig, ProviderKind};
    use crate::models::{Source, SourceFormat};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct FixedDiscovery;

    #[async_trait]
    impl SourceDiscovery for FixedDiscovery {
        async fn discover(&self, config: &SourceConfig) -> Result<Vec<Source>> {
            if config.id == "broken" {
                anyhow::bail!("disk on fire");
            }
            Ok(["x", "y"]
                .iter()
                .map(|name| Source {
                    id: format!("{}:{}", config.id, name),
                    format: SourceFormat::Image,
                    path: PathBuf::from(format!("/in/{}.png", name)),
                    basename: name.to_string(),
                    root: PathBuf::from("/in"),
                    relative_path: PathBuf::from(format!("{}.png", name)),
                })
                .collect())
        }
    }

    fn preset(id: &str, provider: ProviderKind) -> GenerationPreset {
        toml::from_str(&format!(
            "id = \"{}\"\nprovider = \"{}\"\nmodel = \"m\"\n",
            id,
            provider.as_str()
        ))
        .unwrap()
    }

    fn source(id: &str, preset: Option<&str>) -> SourceConfig {
        let mut text = format!("id = \"{}\"\ndirectories = [\"/in\"]\noutput_root = \"/out\"\n", id);
        if let Some(p) = preset {
            text.push_str(&format!("preset = \"{}\"\n", p));
        }
        toml::from_str(&text).unwrap()
    }

    fn config(sources: Vec<SourceConfig>) -> Config {
        let mut keyed = preset("gpt", ProviderKind::Openai);
        keyed.api_key = Some("sk-test".into());
        let mut unkeyed = preset("bare", ProviderKind::Openai);
        unkeyed.api_key_env = Some("INK2MD_TEST_UNSET_KEY".into());
        let mut modelless = preset("empty", ProviderKind::Ollama);
        modelless.model = None;
        Config {
            cache: CacheConfig {
                path: PathBuf::from(":memory:"),
            },
            import: ImportConfig::default(),
            presets: vec![keyed, unkeyed, modelless, preset("local", ProviderKind::Ollama)],
            sources,
        }
    }

    #[tokio::test]
    async fn keeps_config_then_discovery_order() {
        let cfg = config(vec![source("a", Some("local")), source("b", Some("gpt"))]);
        let queue = collect_jobs(&cfg, &FixedDiscovery).await;
        assert!(queue.issues.is_empty());
        let ids: Vec<_> = queue.jobs.iter().map(|j| j.source.id.as_str()).collect();
        assert_eq!(ids, vec!["a:x", "a:y", "b:x", "b:y"]);
        assert_eq!(queue.jobs[2].preset.id, "gpt");
        assert_eq!(queue.jobs[0].config.id, "a");
    }

    #[tokio::test]
    async fn reports_each_unrunnable_config_once() {
        let mut unsupported = source("remote", Some("local"));
        unsupported.kind = "dropbox".into();
        let mut empty = source("empty-dirs", Some("local"));
        empty.directories.clear();

        let cfg = config(vec![
            unsupported,
            empty,
            source("no-preset", None),
            source("ghost", Some("missing")),
            source("incomplete", Some("empty")),
            source("unkeyed", Some("bare")),
            source("ok", Some("local")),
        ]);
        let queue = collect_jobs(&cfg, &FixedDiscovery).await;

        assert_eq!(queue.jobs.len(), 2);
        assert!(queue.jobs.iter().all(|j| j.config.id == "ok"));
        assert_eq!(queue.issues.len(), 6);
        assert!(matches!(queue.issues[0], ConfigIssue::UnsupportedKind { .. }));
        assert!(matches!(queue.issues[1], ConfigIssue::NoDirectories { .. }));
        assert!(matches!(queue.issues[2], ConfigIssue::NoPreset { .. }));
        assert!(matches!(queue.issues[3], ConfigIssue::UnknownPreset { .. }));
        assert!(matches!(queue.issues[4], ConfigIssue::IncompletePreset { .. }));
        assert_eq!(
            queue.issues[5],
            ConfigIssue::MissingCredential {
                source_name: "unkeyed".into(),
                preset: "bare".into(),
                provider: "openai".into(),
            }
        );
    }

    #[tokio::test]
    async fn discovery_failure_skips_only_that_config() {
        let cfg = config(vec![source("broken", Some("local")), source("ok", Some("local"))]);
        let queue = collect_jobs(&cfg, &FixedDiscovery).await;
        assert_eq!(queue.jobs.len(), 2);
        assert!(queue.issues.is_empty());
    }
}
