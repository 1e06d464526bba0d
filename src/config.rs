use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Immutable configuration snapshot for one import run.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub cache: CacheConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub presets: Vec<GenerationPreset>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ImportConfig {
    /// Surface each written note once it is persisted.
    #[serde(default)]
    pub open_after_import: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Ollama,
}

impl ProviderKind {
    pub fn requires_credential(&self) -> bool {
        matches!(self, ProviderKind::Openai)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    #[default]
    Batch,
    Stream,
}

/// A named provider profile used to turn pages into Markdown.
#[derive(Debug, Deserialize, Clone)]
pub struct GenerationPreset {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub provider: ProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default = "default_image_max_width")]
    pub image_max_width: u32,
    #[serde(default)]
    pub mode: GenerationMode,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_prompt() -> String {
    "Transcribe the handwritten note in these page images into clean Markdown. \
     Preserve headings, lists, and emphasis. Return only the Markdown."
        .to_string()
}
fn default_image_max_width() -> u32 {
    1600
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}

impl GenerationPreset {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Name of the environment variable holding the credential, if any.
    pub fn credential_env(&self) -> Option<String> {
        match (&self.api_key_env, self.provider) {
            (Some(var), _) => Some(var.clone()),
            (None, ProviderKind::Openai) => Some("OPENAI_API_KEY".to_string()),
            (None, ProviderKind::Ollama) => None,
        }
    }

    /// Resolve the credential: inline `api_key` first, then the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        self.credential_env()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    Replace,
    #[default]
    KeepBoth,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct FormatToggles {
    #[serde(default = "default_true")]
    pub image: bool,
    #[serde(default = "default_true")]
    pub pdf: bool,
    #[serde(default = "default_true")]
    pub notebook: bool,
}

impl Default for FormatToggles {
    fn default() -> Self {
        Self {
            image: true,
            pdf: true,
            notebook: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A named group of watch directories feeding one generation preset.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub directories: Vec<PathBuf>,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default)]
    pub formats: FormatToggles,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    pub output_root: PathBuf,
    #[serde(default)]
    pub conflict: ConflictPolicy,
    #[serde(default = "default_attachment_max_width")]
    pub attachment_max_width: u32,
    #[serde(default = "default_pdf_dpi")]
    pub pdf_dpi: u32,
    #[serde(default)]
    pub preset: Option<String>,
}

fn default_kind() -> String {
    "folder".to_string()
}
fn default_attachment_max_width() -> u32 {
    2000
}
fn default_pdf_dpi() -> u32 {
    150
}

impl SourceConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl Config {
    pub fn preset(&self, id: &str) -> Option<&GenerationPreset> {
        self.presets.iter().find(|p| p.id == id)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Structural checks only. Incomplete sources are reported by the job collector.
pub fn validate(config: &Config) -> Result<()> {
    let mut preset_ids = HashSet::new();
    for preset in &config.presets {
        if preset.id.trim().is_empty() {
            bail!("presets[].id must not be empty");
        }
        if !preset_ids.insert(preset.id.as_str()) {
            bail!("duplicate preset id: '{}'", preset.id);
        }
        if preset.image_max_width == 0 {
            bail!("presets.{}.image_max_width must be > 0", preset.id);
        }
    }

    let mut source_ids = HashSet::new();
    for source in &config.sources {
        if source.id.trim().is_empty() {
            bail!("sources[].id must not be empty");
        }
        if !source_ids.insert(source.id.as_str()) {
            bail!("duplicate source id: '{}'", source.id);
        }
        if source.attachment_max_width == 0 {
            bail!("sources.{}.attachment_max_width must be > 0", source.id);
        }
        if source.pdf_dpi == 0 {
            bail!("sources.{}.pdf_dpi must be > 0", source.id);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[cache]
path = "./data/ink2md.sqlite"

[[presets]]
id = "gpt"
provider = "openai"
model = "gpt-4o-mini"
mode = "stream"

[[sources]]
id = "notes"
directories = ["/scans"]
output_root = "/vault/Ink2MD"
conflict = "replace"
preset = "gpt"
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        validate(&config).unwrap();

        let preset = config.preset("gpt").unwrap();
        assert_eq!(preset.mode, GenerationMode::Stream);
        assert_eq!(preset.image_max_width, 1600);
        assert_eq!(preset.credential_env().as_deref(), Some("OPENAI_API_KEY"));

        let source = &config.sources[0];
        assert_eq!(source.kind, "folder");
        assert!(source.recursive);
        assert!(source.formats.pdf);
        assert_eq!(source.conflict, ConflictPolicy::Replace);
        assert_eq!(source.pdf_dpi, 150);
        assert!(!config.import.open_after_import);
    }

    #[test]
    fn rejects_duplicate_source_ids() {
        let doubled = format!(
            "{}\n[[sources]]\nid = \"notes\"\noutput_root = \"/x\"\n",
            SAMPLE
        );
        let config: Config = toml::from_str(&doubled).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate source id"));
    }

    #[test]
    fn inline_key_wins_over_environment() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.presets[0].api_key = Some("sk-inline".into());
        assert_eq!(
            config.presets[0].resolve_api_key().as_deref(),
            Some("sk-inline")
        );
    }

    #[test]
    fn ollama_needs_no_credential() {
        assert!(!ProviderKind::Ollama.requires_credential());
        assert!(ProviderKind::Openai.requires_credential());
    }
}
