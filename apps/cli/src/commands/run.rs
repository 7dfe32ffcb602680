//! Run command implementation.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use colored::Colorize;
use serde_json::Value;
use stratus_core::{RunStatus, StratusConfig, WorkflowDefinition, WorkflowRun};

use super::open_engine;
use crate::output::{print_json, print_run};

/// Parses `KEY=VALUE` pairs. Values that are valid JSON keep their type;
/// anything else becomes a string.
pub fn parse_vars(vars: &[String]) -> anyhow::Result<BTreeMap<String, Value>> {
    vars.iter()
        .map(|pair| -> anyhow::Result<(String, Value)> {
            let (key, raw) = pair
                .split_once('=')
                .with_context(|| format!("Invalid variable '{}': expected KEY=VALUE", pair))?;
            let key = key.trim();
            if key.is_empty() {
                anyhow::bail!("Invalid variable '{}': empty key", pair);
            }
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Ok((key.to_string(), value))
        })
        .collect()
}

/// Execute the run command.
///
/// Starts the workflow, waits for it, and exits non-zero unless it completed.
pub async fn execute(
    file: &Path,
    vars: &[String],
    store: &Path,
    config: StratusConfig,
    json: bool,
) -> anyhow::Result<()> {
    let definition = WorkflowDefinition::load(file)
        .with_context(|| format!("Failed to load {}", file.display()))?;
    let variables = parse_vars(vars)?;

    let engine = open_engine(store, config);
    let run_id = engine
        .execute(definition, variables)
        .await
        .with_context(|| format!("Failed to start {}", file.display()))?;
    if !json {
        println!("{} {}", "Started run".bold(), run_id.cyan());
        println!();
    }

    let run = engine.wait(&run_id).await.context("Run did not finish")?;
    report(&run, json)
}

/// Prints a finished run and exits non-zero unless it completed.
pub fn report(run: &WorkflowRun, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(run)?;
    } else {
        print_run(run);
    }

    if run.status != RunStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}
