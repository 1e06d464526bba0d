//! # ink2md CLI
//!
//! The `ink2md` binary imports handwritten notes from watched folders and
//! writes one Markdown note (plus page images) per source file.
//!
//! ## Usage
//!
//! ```bash
//! ink2md --config ./config/ink2md.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ink2md init` | Create the fingerprint cache and run schema migrations |
//! | `ink2md sources` | List source configurations and their health |
//! | `ink2md import` | Import new and changed notes |
//! | `ink2md cache list` | Show cached fingerprints |
//! | `ink2md cache reset` | Forget cached fingerprints so sources are reimported |

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ink2md::progress::ProgressMode;
use ink2md::{cache_cmd, config, importer, migrate, sources};

/// ink2md: handwritten notes to Markdown.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ink2md.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ink2md",
    about = "Import handwritten notes and transcribe them to Markdown",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ink2md.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the fingerprint cache.
    ///
    /// Idempotent; safe to run repeatedly.
    Init,

    /// List source configurations, their presets, and whether they can run.
    Sources,

    /// Import new and changed notes from every runnable source.
    ///
    /// Unchanged files are skipped using the fingerprint cache. Press
    /// Ctrl-C to stop after the current note.
    Import {
        /// Progress output on stderr. Defaults to human on a TTY, otherwise off.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Inspect or reset the fingerprint cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cached fingerprints; records of removed sources are marked orphaned.
    List,

    /// Forget cached fingerprints so the affected files are imported again.
    Reset {
        /// Only reset records of this source configuration.
        #[arg(long)]
        source: Option<String>,

        /// Only reset records whose source configuration no longer exists.
        #[arg(long)]
        orphans: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Human,
    Json,
    Off,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Cache initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Import { progress } => {
            let mode = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);
            importer::run_import(&cfg, mode).await?;
        }
        Commands::Cache { action } => match action {
            CacheAction::List => {
                cache_cmd::run_cache_list(&cfg).await?;
            }
            CacheAction::Reset { source, orphans } => {
                cache_cmd::run_cache_reset(&cfg, source, orphans).await?;
            }
        },
    }

    Ok(())
}
