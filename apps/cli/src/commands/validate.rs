//! Definition validation command.

use std::path::Path;

use anyhow::Context;
use colored::Colorize;
use serde_json::json;
use stratus_core::WorkflowDefinition;

use crate::output::print_json;

/// Execute the validate command.
///
/// Every agent name is accepted; only the definition's own structure is checked.
pub fn execute(file: &Path, json: bool) -> anyhow::Result<()> {
    let definition = WorkflowDefinition::load(file)
        .with_context(|| format!("Failed to load {}", file.display()))?;
    let graph = definition
        .validate(&|_: &str| true)
        .with_context(|| format!("Invalid workflow '{}'", definition.name))?;
    let mut levels: Vec<Vec<String>> = Vec::new();
    for (step_id, level) in graph.execution_levels() {
        let level = level as usize;
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(step_id);
    }

    if json {
        return print_json(&json!({
            "valid": true,
            "workflow": definition.name,
            "steps": definition.steps.len(),
            "groups": definition.groups.len(),
            "levels": levels,
        }));
    }

    println!("{} {}", "✓".green().bold(), format!("'{}' is valid", definition.name).bold());
    println!("  Steps:  {}", definition.steps.len());
    println!("  Groups: {}", definition.groups.len());
    println!();
    println!("{}", "Execution levels:".bold());
    for (index, level) in levels.iter().enumerate() {
        println!("  {} {}", format!("{}.", index + 1).dimmed(), level.join(", "));
    }
    Ok(())
}
