//! Resume command implementation.

use std::path::Path;

use anyhow::Context;
use colored::Colorize;
use stratus_core::StratusConfig;

use super::open_engine;
use super::run::report;

/// Execute the resume command.
pub async fn execute(run_id: &str, store: &Path, config: StratusConfig, json: bool) -> anyhow::Result<()> {
    let engine = open_engine(store, config);
    engine.resume(run_id).await.with_context(|| format!("Failed to resume run {}", run_id))?;
    if !json {
        println!("{} {}", "Resumed run".bold(), run_id.cyan());
        println!();
    }

    let run = engine.wait(run_id).await.context("Run did not finish")?;
    report(&run, json)
}
