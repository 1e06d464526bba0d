//! `ink2md cache` subcommands.

use anyhow::{bail, Result};

use crate::cache::{FingerprintStore, ResetScope, SqliteFingerprintStore};
use crate::config::Config;
use crate::importer::reset_fingerprint_cache;
use crate::models::FingerprintRecord;

/// Choose the reset scope from the CLI flags.
pub fn reset_scope(config: &Config, source: Option<String>, orphans: bool) -> Result<ResetScope> {
    match (source, orphans) {
        (Some(_), true) => bail!("--source and --orphans cannot be combined"),
        (Some(id), false) => Ok(ResetScope::Source(id)),
        (None, true) => Ok(ResetScope::Orphans(known_config_ids(config))),
        (None, false) => Ok(ResetScope::All),
    }
}

fn known_config_ids(config: &Config) -> Vec<String> {
    config.sources.iter().map(|s| s.id.clone()).collect()
}

pub async fn run_cache_reset(config: &Config, source: Option<String>, orphans: bool) -> Result<()> {
    let scope = reset_scope(config, source, orphans)?;
    let store = SqliteFingerprintStore::open(config).await?;
    let removed = reset_fingerprint_cache(&store, &scope).await?;

    println!("cache reset");
    match &scope {
        ResetScope::All => println!("  scope: all"),
        ResetScope::Source(id) => println!("  scope: source {}", id),
        ResetScope::Orphans(_) => println!("  scope: orphans"),
    }
    println!("  removed: {}", removed);
    println!("ok");

    store.close().await;
    Ok(())
}

pub async fn run_cache_list(config: &Config) -> Result<()> {
    let store = SqliteFingerprintStore::open(config).await?;
    let records = store.list().await?;
    let known = known_config_ids(config);

    if records.is_empty() {
        println!("No cached fingerprints.");
        store.close().await;
        return Ok(());
    }

    print!("{}", render_records(&records, &known));
    println!("total: {}", records.len());

    store.close().await;
    Ok(())
}

/// Table of records; `CONFIG` is the id accepted by `cache reset --source`.
fn render_records(records: &[FingerprintRecord], known: &[String]) -> String {
    let mut out = format!(
        "{:<16} {:<40} {:<14} {:<10} {:<22} OUTPUT\n",
        "CONFIG", "SOURCE ID", "DIGEST", "SIZE", "PROCESSED"
    );
    for record in records {
        let orphan = !known.contains(&record.config_id);
        let digest: String = record.digest.chars().take(12).collect();
        out.push_str(&format!(
            "{:<16} {:<40} {:<14} {:<10} {:<22} {}{}\n",
            record.config_id,
            record.source_id,
            digest,
            record.size,
            record.processed_at,
            record.output_folder.display(),
            if orphan { "  (orphaned)" } else { "" }
        ));
    }
    out
}
