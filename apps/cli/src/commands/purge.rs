//! Purge command implementation.

use std::path::Path;

use anyhow::Context;
use colored::Colorize;
use stratus_core::StratusConfig;

use super::open_engine;

/// Execute the purge command.
pub async fn execute(run_id: &str, store: &Path, config: StratusConfig) -> anyhow::Result<()> {
    let engine = open_engine(store, config);
    let removed = engine.purge(run_id).await.with_context(|| format!("Failed to purge run {}", run_id))?;
    println!("{} {} ({} checkpoints)", "Purged".green().bold(), run_id, removed);
    Ok(())
}
