//! Stratus Core - workflow orchestration for multi-agent systems.
//!
//! This crate drives workflows made of agent steps:
//! - Workflow definitions, validation, and dependency scheduling
//! - A guarded step executor (admission, idempotency, circuit breaking, retry)
//! - Sequential, parallel, and consensus coordination of agent groups
//! - Checkpointed runs that can be resumed, rolled back, and purged
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use stratus_core::{Engine, StepSpec, WorkflowDefinition};
//! # async fn demo(invoker: Arc<dyn stratus_abstraction::AgentInvoker>) -> stratus_core::Result<()> {
//! let engine = Engine::builder(invoker).build();
//! let definition = WorkflowDefinition::new("review")
//!     .with_step(StepSpec::new("draft", "writer"))
//!     .with_step(StepSpec::new("check", "critic").depends_on(["draft"]));
//!
//! let run_id = engine.execute(definition, BTreeMap::new()).await?;
//! let run = engine.wait(&run_id).await?;
//! println!("{} finished {}", run_id, run.status);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod executor;
pub mod failure;
pub mod lifecycle;
pub mod state_machine;
pub mod storage;
pub mod telemetry;
pub mod workflow;

pub use checkpoint::{Checkpoint, CheckpointLog, CheckpointWriter, RunHeader};
pub use config::{LogFormat, StratusConfig};
pub use coordinator::{
    ConsensusCoordinator, CoordinationOutcome, CoordinationReport, CoordinationStrategy,
    CoordinationTask, Coordinator, DecisionRule, ParallelCoordinator, ParallelPolicy,
    SequentialCoordinator,
};
pub use delivery::DeliveryInvoker;
pub use engine::{Engine, EngineBuilder, RunSummary};
pub use error::{ConfigError, EngineError, Result, ValidationError};
pub use executor::{ExecutionReport, StepExecutor, StepFailure, StepRequest};
pub use failure::{
    AttemptFailure, AttemptRecord, FailureClassification, FailureClassifier, FailureRecord,
    PatternClassifier, StepError,
};
pub use lifecycle::{AgentLifecycle, AgentState};
pub use state_machine::{StateMachine, TransitionError, TransitionTable};
pub use storage::{FileStore, InMemoryStore};
pub use telemetry::init_logging;
pub use workflow::{
    CheckpointRef, CoordinationGroup, DependencyGraph, OnFailure, RunStatus, StepOutcome,
    StepRetryConfig, StepSpec, WorkflowDefinition, WorkflowRun,
};
