// Error types for the workflow engine

use stratus_abstraction::StoreError;
use thiserror::Error;

use crate::workflow::RunStatus;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// A workflow definition that must not run.
///
/// Raised before any step is dispatched and never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The workflow has no steps
    #[error("workflow '{0}' has no steps")]
    EmptyWorkflow(String),

    /// Two steps share an ID
    #[error("duplicate step ID: {0}")]
    DuplicateStep(String),

    /// A step is malformed
    #[error("invalid step '{step_id}': {reason}")]
    InvalidStep {
        /// Offending step
        step_id: String,
        /// What is wrong with it
        reason: String,
    },

    /// A step depends on a step that does not exist
    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        /// Dependent step
        step_id: String,
        /// Missing dependency
        dependency: String,
    },

    /// The dependency graph has a cycle
    #[error("circular dependency detected: {0}")]
    CycleDetected(String),

    /// A step or group names an agent the invoker cannot reach
    #[error("step '{step_id}' targets unknown agent '{target}'")]
    UnknownTarget {
        /// Step referencing the agent
        step_id: String,
        /// Unknown agent
        target: String,
    },

    /// A step references a coordination group that does not exist
    #[error("step '{step_id}' references unknown coordination group '{group_id}'")]
    UnknownGroup {
        /// Step referencing the group
        step_id: String,
        /// Missing group
        group_id: String,
    },

    /// A coordination group is malformed
    #[error("invalid coordination group '{group_id}': {reason}")]
    InvalidGroup {
        /// Offending group
        group_id: String,
        /// What is wrong with it
        reason: String,
    },

    /// The definition file could not be read
    #[error("failed to read workflow definition: {0}")]
    Io(String),

    /// The definition could not be parsed
    #[error("failed to parse workflow definition: {0}")]
    Parse(String),
}

/// Errors raised by the orchestration engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The definition failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No run with this ID exists in memory or in the store
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// The requested status change is not allowed
    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Run ID
        run_id: String,
        /// Current status
        from: RunStatus,
        /// Requested status
        to: RunStatus,
    },

    /// The run cannot be resumed or rolled back right now
    #[error("run {run_id} cannot be resumed: {reason}")]
    NotResumable {
        /// Run ID
        run_id: String,
        /// Why not
        reason: String,
    },

    /// A driver is already executing the run
    #[error("run {0} is already active")]
    AlreadyActive(String),

    /// The run is still active and cannot be purged
    #[error("run {run_id} is {status}; only finished runs can be purged")]
    NotTerminal {
        /// Run ID
        run_id: String,
        /// Current status
        status: RunStatus,
    },

    /// No checkpoint with this sequence exists
    #[error("checkpoint {sequence} not found for run {run_id}")]
    CheckpointNotFound {
        /// Run ID
        run_id: String,
        /// Requested sequence
        sequence: u64,
    },

    /// The persistent store failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A persisted record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The run's driver task stopped unexpectedly
    #[error("run driver failed: {0}")]
    Driver(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// A value is out of range
    #[error("config validation error: {0}")]
    Validation(String),
}
