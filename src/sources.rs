use anyhow::Result;

use crate::collector::check_source_config;
use crate::config::Config;

/// One row of `ink2md sources`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceHealth {
    pub id: String,
    pub preset: String,
    pub status: String,
    pub healthy: bool,
    pub directories: usize,
    pub missing_directories: usize,
}

pub fn source_health(config: &Config) -> Vec<SourceHealth> {
    config
        .sources
        .iter()
        .map(|source| {
            let missing = source.directories.iter().filter(|d| !d.is_dir()).count();
            let (status, healthy) = match check_source_config(config, source) {
                Err(issue) => (issue.to_string(), false),
                Ok(_) if missing == source.directories.len() => {
                    ("NO WATCH DIRECTORY EXISTS".to_string(), false)
                }
                Ok(_) if missing > 0 => (format!("OK ({} missing)", missing), true),
                Ok(_) => ("OK".to_string(), true),
            };
            SourceHealth {
                id: source.id.clone(),
                preset: source.preset.clone().unwrap_or_else(|| "-".to_string()),
                status,
                healthy,
                directories: source.directories.len(),
                missing_directories: missing,
            }
        })
        .collect()
}

pub fn list_sources(config: &Config) -> Result<()> {
    let rows = source_health(config);
    if rows.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    println!(
        "{:<16} {:<12} {:<6} {:<8} STATUS",
        "SOURCE", "PRESET", "DIRS", "HEALTHY"
    );
    for row in rows {
        println!(
            "{:<16} {:<12} {:<6} {:<8} {}",
            row.id, row.preset, row.directories, row.healthy, row.status
        );
    }
    Ok(())
}
