//! Runs command implementation.

use std::path::Path;

use anyhow::Context;
use colored::Colorize;
use stratus_core::StratusConfig;

use super::open_engine;
use crate::output::{print_json, status_label};

/// Execute the runs command.
pub async fn execute(store: &Path, config: StratusConfig, json: bool) -> anyhow::Result<()> {
    let engine = open_engine(store, config);
    let mut runs = engine.list_runs().await.context("Failed to list runs")?;
    runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    if json {
        return print_json(&runs);
    }

    if runs.is_empty() {
        println!("{}", "No runs found".yellow());
        println!("  {}", format!("Store: {}", store.display()).dimmed());
        return Ok(());
    }

    println!("{}", format!("Runs ({})", runs.len()).bold());
    for run in &runs {
        println!(
            "  {}  {:<24} {:<10} {}",
            run.run_id.cyan(),
            run.workflow,
            status_label(run.status),
            format!("{}/{} steps", run.settled_steps, run.total_steps).dimmed()
        );
    }
    Ok(())
}
