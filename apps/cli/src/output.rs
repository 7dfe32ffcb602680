//! Terminal rendering shared by the commands.

use colored::{ColoredString, Colorize};
use serde::Serialize;
use stratus_core::{RunStatus, StepOutcome, WorkflowRun};

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn status_label(status: RunStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        RunStatus::Completed => label.green().bold(),
        RunStatus::Failed => label.red().bold(),
        RunStatus::Cancelled => label.yellow().bold(),
        RunStatus::Pending | RunStatus::Running => label.cyan().bold(),
    }
}

fn outcome_label(outcome: &StepOutcome) -> ColoredString {
    match outcome {
        StepOutcome::Succeeded { .. } => "✓".green().bold(),
        StepOutcome::Failed(_) => "✗".red().bold(),
        StepOutcome::Skipped { .. } => "-".dimmed(),
        StepOutcome::Indeterminate { .. } => "?".yellow().bold(),
    }
}

/// Prints a run with one line per step, in definition order.
pub fn print_run(run: &WorkflowRun) {
    println!("{} {}", "Run".bold(), run.run_id.cyan());
    println!("  Workflow: {}", run.definition.name);
    println!("  Status:   {}", status_label(run.status));
    println!("  Created:  {}", run.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string().dimmed());
    if let Some(finished) = run.finished_at {
        println!("  Finished: {}", finished.format("%Y-%m-%d %H:%M:%S UTC").to_string().dimmed());
    }
    println!();

    println!("{}", "Steps:".bold());
    for step in &run.definition.steps {
        let Some(outcome) = run.step_results.get(&step.step_id) else {
            println!("  {} {}", "·".dimmed(), step.step_id.dimmed());
            continue;
        };

        let attempts = outcome.attempts().len();
        println!(
            "  {} {} {}",
            outcome_label(outcome),
            step.step_id,
            format!("({}, {} attempt{})", outcome.label(), attempts, if attempts == 1 { "" } else { "s" })
                .dimmed()
        );
        match outcome {
            StepOutcome::Failed(record) => {
                println!("    {}: {}", record.classification.to_string().red(), record.message);
            }
            StepOutcome::Skipped { reason } | StepOutcome::Indeterminate { reason, .. } => {
                println!("    {}", reason.dimmed());
            }
            StepOutcome::Succeeded { .. } => {}
        }
    }
}
