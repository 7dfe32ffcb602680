//! Workflow definitions, dependency graphs, runs, and the scheduler that
//! drives a run to completion.

pub mod definition;
pub mod graph;
pub mod run;
pub mod scheduler;

pub use definition::{CoordinationGroup, OnFailure, StepRetryConfig, StepSpec, WorkflowDefinition};
pub use graph::DependencyGraph;
pub use run::{CheckpointRef, RunStatus, StepOutcome, WorkflowRun, run_status_table};
pub use scheduler::{RunDriver, SchedulerConfig};
