//! Workflow run state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratus_abstraction::Clock;

use crate::failure::{AttemptRecord, FailureRecord};
use crate::state_machine::TransitionTable;
use crate::workflow::definition::WorkflowDefinition;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Accepted, not yet started.
    Pending,
    /// Steps are being dispatched.
    Running,
    /// Every step settled without failing the run.
    Completed,
    /// A step failure stopped the run.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl RunStatus {
    /// Returns true for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of one step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StepOutcome {
    /// The step produced an output.
    Succeeded {
        /// Step output.
        output: Value,
        /// Attempt history.
        attempts: Vec<AttemptRecord>,
    },
    /// The step failed terminally.
    Failed(FailureRecord),
    /// The step never ran because a dependency failed.
    Skipped {
        /// Why the step was skipped.
        reason: String,
    },
    /// A consensus group could not reach a decision.
    Indeterminate {
        /// Why no decision was reached.
        reason: String,
        /// Vote record.
        detail: Value,
        /// Attempt history.
        attempts: Vec<AttemptRecord>,
    },
}

impl StepOutcome {
    /// Returns true for `Succeeded`.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Attempts recorded for the step.
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::Succeeded { attempts, .. } | Self::Indeterminate { attempts, .. } => attempts,
            Self::Failed(record) => &record.attempts,
            Self::Skipped { .. } => &[],
        }
    }

    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Failed(_) => "failed",
            Self::Skipped { .. } => "skipped",
            Self::Indeterminate { .. } => "indeterminate",
        }
    }
}

/// Reference to a persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    /// Position in the run's checkpoint log.
    pub sequence: u64,
    /// Run status captured by the checkpoint.
    pub status: RunStatus,
    /// When the checkpoint was taken.
    pub taken_at: DateTime<Utc>,
}

/// One execution instance of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run ID.
    pub run_id: String,
    /// Definition being executed.
    pub definition: WorkflowDefinition,
    /// Current status.
    pub status: RunStatus,
    /// Steps that succeeded.
    pub completed_steps: BTreeSet<String>,
    /// Outcome of every settled step.
    pub step_results: BTreeMap<String, StepOutcome>,
    /// Free-form context carried between steps.
    pub variables: BTreeMap<String, Value>,
    /// Checkpoints taken so far, oldest first.
    pub checkpoints: Vec<CheckpointRef>,
    /// When the run was accepted.
    pub created_at: DateTime<Utc>,
    /// When the run first entered `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Creates a pending run.
    pub fn new(
        run_id: impl Into<String>,
        definition: WorkflowDefinition,
        variables: BTreeMap<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            definition,
            status: RunStatus::Pending,
            completed_steps: BTreeSet::new(),
            step_results: BTreeMap::new(),
            variables,
            checkpoints: Vec::new(),
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Returns true once every step has an outcome.
    pub fn all_steps_settled(&self) -> bool {
        self.definition.steps.iter().all(|s| self.step_results.contains_key(&s.step_id))
    }

    /// Returns true if any step failed or was indeterminate.
    pub fn has_failures(&self) -> bool {
        self.step_results
            .values()
            .any(|o| matches!(o, StepOutcome::Failed(_) | StepOutcome::Indeterminate { .. }))
    }

    /// Records a settled step.
    pub fn record(&mut self, step_id: &str, outcome: StepOutcome) {
        if let StepOutcome::Succeeded { output, .. } = &outcome {
            self.completed_steps.insert(step_id.to_string());
            let variable = self.definition.step(step_id).and_then(|s| s.output_variable.clone());
            if let Some(variable) = variable {
                self.variables.insert(variable, output.clone());
            }
        }
        self.step_results.insert(step_id.to_string(), outcome);
    }

    /// Latest checkpoint sequence, if any.
    pub fn last_sequence(&self) -> Option<u64> {
        self.checkpoints.last().map(|c| c.sequence)
    }
}

/// Status machine shared by every run.
///
/// Entry actions keep `status` and the run timestamps in step with the
/// machine. `Completed` is only reachable once every step has settled.
pub fn run_status_table(clock: Arc<dyn Clock>) -> Arc<TransitionTable<RunStatus, WorkflowRun>> {
    let started = Arc::clone(&clock);
    let finished = clock;
    let mut table = TransitionTable::<RunStatus, WorkflowRun>::new(RunStatus::Pending)
        .allow(RunStatus::Pending, RunStatus::Running)
        .allow(RunStatus::Pending, RunStatus::Cancelled)
        .allow(RunStatus::Pending, RunStatus::Failed)
        .allow_if(RunStatus::Running, RunStatus::Completed, WorkflowRun::all_steps_settled)
        .allow(RunStatus::Running, RunStatus::Failed)
        .allow(RunStatus::Running, RunStatus::Cancelled)
        .terminal(RunStatus::Completed)
        .terminal(RunStatus::Failed)
        .terminal(RunStatus::Cancelled)
        .on_enter(RunStatus::Running, move |_, run| {
            run.started_at.get_or_insert_with(|| started.now());
        });

    for status in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
        table = table.on_enter(status, |status, run| run.status = status);
    }
    for status in [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
        let clock = Arc::clone(&finished);
        table = table.on_enter(status, move |_, run| run.finished_at = Some(clock.now()));
    }
    table.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::{AttemptFailure, FailureClassification};
    use crate::state_machine::{StateMachine, TransitionError};
    use crate::workflow::definition::StepSpec;
    use stratus_abstraction::ManualClock;

    fn run() -> WorkflowRun {
        let definition = WorkflowDefinition::new("pair")
            .with_step(StepSpec::new("a", "agent").with_output_variable("greeting"))
            .with_step(StepSpec::new("b", "agent").depends_on(["a"]));
        WorkflowRun::new("run-1", definition, BTreeMap::new(), Utc::now())
    }

    fn success(output: Value) -> StepOutcome {
        StepOutcome::Succeeded { output, attempts: Vec::new() }
    }

    #[test]
    fn test_record_updates_completed_and_variables() {
        let mut run = run();
        run.record("a", success(Value::from("hello")));
        assert!(run.completed_steps.contains("a"));
        assert_eq!(run.variables["greeting"], Value::from("hello"));

        run.record(
            "b",
            StepOutcome::Failed(FailureRecord::new(
                "b",
                AttemptFailure { classification: FailureClassification::Logic, message: "bad".into() },
                Vec::new(),
                Utc::now(),
            )),
        );
        assert!(!run.completed_steps.contains("b"));
        assert!(run.all_steps_settled());
        assert!(run.has_failures());
    }

    #[test]
    fn test_status_table_guards_completion() {
        let clock = ManualClock::default();
        let table = run_status_table(Arc::new(clock.clone()));
        let mut machine = StateMachine::new(table);
        let mut run = run();

        machine.transition(RunStatus::Running, &mut run).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.started_at, Some(clock.now()));

        assert!(matches!(
            machine.transition(RunStatus::Completed, &mut run),
            Err(TransitionError::GuardRejected { .. })
        ));

        run.record("a", success(Value::Null));
        run.record("b", success(Value::Null));
        machine.transition(RunStatus::Completed, &mut run).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.finished_at.is_some());
        assert!(machine.transition(RunStatus::Running, &mut run).is_err());
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(StepOutcome::Skipped { reason: "upstream".into() }).unwrap();
        assert_eq!(json["status"], "skipped");
    }
}
