//! Collaborator abstraction layer for Stratus.
//!
//! This module defines the narrow interfaces the orchestration core consumes:
//! agent invocation, asynchronous message delivery, persistent storage and
//! time. Concrete implementations live outside the core.

pub mod clock;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use clock::{Clock, ManualClock, SystemClock};

/// Represents an error returned by an agent or the transport in front of it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentError {
    /// The agent did not answer in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The agent or its transport could not be reached.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The agent asked the caller to slow down.
    #[error("Throttled (rate limit): {0}")]
    Throttled(String),

    /// The agent rejected the payload as malformed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The caller is not allowed to use this agent.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The target is not known to the invoker.
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    /// The invocation was abandoned because the surrounding run was cancelled.
    #[error("Invocation cancelled")]
    Cancelled,

    /// Other unexpected errors.
    #[error("Agent error: {0}")]
    Other(String),
}

/// Context handed to an agent alongside its payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationContext {
    /// Run the invocation belongs to.
    pub run_id: String,
    /// Step (or coordination branch) being executed.
    pub step_id: String,
    /// One-based attempt number within the current retry tier.
    pub attempt: u32,
    /// Free-form run variables visible to the agent.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

impl InvocationContext {
    /// Creates a context for the first attempt of a step.
    #[must_use]
    pub fn new(run_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self { run_id: run_id.into(), step_id: step_id.into(), attempt: 1, variables: HashMap::new() }
    }

    /// Replaces the variables carried by the context.
    #[must_use]
    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }
}

/// Calls an agent synchronously from the caller's point of view.
///
/// Implementations must be `Send + Sync`; the engine shares one invoker
/// across every run and every concurrently executing step.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Invokes `target_id` with `payload`.
    ///
    /// # Errors
    /// Returns an `AgentError` when the agent fails or cannot be reached.
    async fn invoke(
        &self,
        target_id: &str,
        payload: &Value,
        context: &InvocationContext,
    ) -> Result<Value, AgentError>;

    /// Returns whether `target_id` names an agent this invoker can reach.
    ///
    /// Used during workflow validation. The default accepts every target.
    fn has_target(&self, _target_id: &str) -> bool {
        true
    }
}

/// Opaque handle for a message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryToken(pub String);

impl std::fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deliver-and-acknowledge transport for agents that answer asynchronously.
#[async_trait]
pub trait MessageDelivery: Send + Sync {
    /// Hands `payload` to the transport for `target_id`.
    async fn send(&self, target_id: &str, payload: &Value) -> Result<DeliveryToken, AgentError>;

    /// Waits at most `timeout` for the reply to a previously sent message.
    ///
    /// # Errors
    /// Returns `AgentError::Timeout` if no reply arrives in time.
    async fn await_result(
        &self,
        token: &DeliveryToken,
        timeout: Duration,
    ) -> Result<Value, AgentError>;
}

/// Errors raised by a persistent store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Nothing is stored under the requested key.
    #[error("Key not found: {namespace}/{key}")]
    NotFound {
        /// Namespace searched.
        namespace: String,
        /// Key searched.
        key: String,
    },

    /// The backing storage failed.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Returns true if this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Key/value persistence consumed for checkpoints and idempotency records.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Stores `value` under `namespace`/`key`, replacing any previous value.
    async fn save(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError>;

    /// Loads the value stored under `namespace`/`key`.
    ///
    /// # Errors
    /// Returns `StoreError::NotFound` if the key does not exist.
    async fn load(&self, namespace: &str, key: &str) -> Result<Value, StoreError>;

    /// Lists keys in `namespace` starting with `prefix`, in ascending order.
    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Removes `namespace`/`key`. Deleting a missing key is not an error.
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_error_messages_carry_keywords() {
        assert!(AgentError::Timeout("slow".into()).to_string().to_lowercase().contains("timeout"));
        assert!(
            AgentError::Throttled("busy".into()).to_string().to_lowercase().contains("rate limit")
        );
        assert!(
            AgentError::InvalidInput("bad".into()).to_string().to_lowercase().contains("invalid")
        );
    }

    #[test]
    fn test_store_error_not_found() {
        let err = StoreError::NotFound { namespace: "runs".into(), key: "r1".into() };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Key not found: runs/r1");
        assert!(!StoreError::Backend("disk".into()).is_not_found());
    }

    #[test]
    fn test_invocation_context_defaults_to_first_attempt() {
        let ctx = InvocationContext::new("run-1", "step-a");
        assert_eq!(ctx.attempt, 1);
        assert!(ctx.variables.is_empty());
    }
}
