//! Status command implementation.

use std::path::Path;

use anyhow::Context;
use stratus_core::StratusConfig;

use super::open_engine;
use crate::output::{print_json, print_run};

/// Execute the status command.
pub async fn execute(run_id: &str, store: &Path, config: StratusConfig, json: bool) -> anyhow::Result<()> {
    let engine = open_engine(store, config);
    let run = engine.get_status(run_id).await.with_context(|| format!("Failed to load run {}", run_id))?;

    if json {
        print_json(&run)
    } else {
        print_run(&run);
        Ok(())
    }
}
