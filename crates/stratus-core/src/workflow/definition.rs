//! Workflow definitions.
//!
//! A [`WorkflowDefinition`] is the immutable template a run executes: an
//! ordered list of steps, their dependencies, and the coordination groups
//! some steps delegate to. Definitions load from TOML or YAML.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratus_resilience::{Priority, RetryConfig};

use crate::coordinator::{CoordinationStrategy, DecisionRule, ParallelPolicy};
use crate::error::ValidationError;
use crate::workflow::graph::DependencyGraph;

/// What happens to the run when a step fails terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Stop dispatching and fail the run.
    #[default]
    FailRun,
    /// Skip the step's transitive dependents; unrelated branches continue.
    SkipDependents,
}

/// Per-step overrides for the escalated retry tier.
///
/// Unset fields fall back to the engine's configured escalated tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRetryConfig {
    /// Total escalated attempts, including the first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// First backoff delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_ms: Option<u64>,
    /// Backoff cap in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    /// Backoff multiplier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<f64>,
    /// Whether to jitter delays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
}

impl StepRetryConfig {
    /// Applies the overrides on top of `defaults`.
    pub fn resolve(&self, defaults: &RetryConfig) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            initial_delay: self
                .initial_delay_ms
                .map_or(defaults.initial_delay, std::time::Duration::from_millis),
            max_delay: self.max_delay_ms.map_or(defaults.max_delay, std::time::Duration::from_millis),
            base: self.base.unwrap_or(defaults.base),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}

/// One schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique step ID within the workflow.
    pub step_id: String,
    /// Agent to invoke. Ignored when the step runs a coordination group.
    #[serde(default)]
    pub target: String,
    /// Payload sent to the agent.
    #[serde(default)]
    pub payload: Value,
    /// Steps that must complete before this one starts.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Escalated retry overrides.
    #[serde(default)]
    pub retry: StepRetryConfig,
    /// Coordination group that executes this step instead of `target`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordination_group_id: Option<String>,
    /// Failure policy.
    #[serde(default)]
    pub on_failure: OnFailure,
    /// Key under which the step's result is cached for at-most-once execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Priority used by load shedding.
    #[serde(default)]
    pub priority: Priority,
    /// Run variable that receives the step's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
}

impl StepSpec {
    /// Creates a step invoking `target`.
    pub fn new(step_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            target: target.into(),
            payload: Value::Null,
            depends_on: BTreeSet::new(),
            retry: StepRetryConfig::default(),
            coordination_group_id: None,
            on_failure: OnFailure::default(),
            idempotency_key: None,
            priority: Priority::default(),
            output_variable: None,
        }
    }

    /// Creates a step executed by coordination group `group_id`.
    pub fn group(step_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        let mut step = Self::new(step_id, "");
        step.coordination_group_id = Some(group_id.into());
        step
    }

    /// Adds dependencies.
    #[must_use]
    pub fn depends_on<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(steps.into_iter().map(Into::into));
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn on_failure(mut self, policy: OnFailure) -> Self {
        self.on_failure = policy;
        self
    }

    /// Sets the escalated retry overrides.
    #[must_use]
    pub fn with_retry(mut self, retry: StepRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Stores the output in run variable `name`.
    #[must_use]
    pub fn with_output_variable(mut self, name: impl Into<String>) -> Self {
        self.output_variable = Some(name.into());
        self
    }

    /// Sets the load shedding priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A named set of agents executed together under one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationGroup {
    /// Group ID referenced by steps.
    pub group_id: String,
    /// Agents in the group, in invocation order for sequential groups.
    pub targets: Vec<String>,
    /// How the agents are coordinated.
    pub strategy: CoordinationStrategy,
    /// Consensus vote weights; unlisted targets weigh 1.0.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub weights: BTreeMap<String, f64>,
}

impl CoordinationGroup {
    /// Creates a group.
    pub fn new<I, S>(group_id: impl Into<String>, strategy: CoordinationStrategy, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            group_id: group_id.into(),
            targets: targets.into_iter().map(Into::into).collect(),
            strategy,
            weights: BTreeMap::new(),
        }
    }

    /// Sets a consensus weight.
    #[must_use]
    pub fn with_weight(mut self, target: impl Into<String>, weight: f64) -> Self {
        self.weights.insert(target.into(), weight);
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidGroup {
            group_id: self.group_id.clone(),
            reason,
        };

        if self.targets.is_empty() {
            return Err(invalid("group has no targets".to_string()));
        }
        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.is_empty() {
                return Err(invalid("empty target name".to_string()));
            }
            if !seen.insert(target.as_str()) {
                return Err(invalid(format!("target '{}' listed twice", target)));
            }
        }
        for (target, weight) in &self.weights {
            if !seen.contains(target.as_str()) {
                return Err(invalid(format!("weight given for non-member '{}'", target)));
            }
            if !weight.is_finite() || *weight <= 0.0 {
                return Err(invalid(format!("weight for '{}' must be positive", target)));
            }
        }

        match &self.strategy {
            CoordinationStrategy::Parallel { policy: ParallelPolicy::AtLeast(n) }
                if *n == 0 || *n > self.targets.len() =>
            {
                Err(invalid(format!("at_least({}) is outside 1..={}", n, self.targets.len())))
            }
            CoordinationStrategy::Consensus { rule: DecisionRule::WeightedQuorum(fraction), .. }
                if !(*fraction > 0.0 && *fraction <= 1.0) =>
            {
                Err(invalid(format!("quorum fraction {} is outside (0, 1]", fraction)))
            }
            CoordinationStrategy::Consensus { timeout_ms: Some(0), .. } => {
                Err(invalid("consensus timeout must be positive".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Immutable workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name.
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps in declaration order.
    pub steps: Vec<StepSpec>,
    /// Coordination groups referenced by steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<CoordinationGroup>,
}

impl WorkflowDefinition {
    /// Creates an empty definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), description: None, steps: Vec::new(), groups: Vec::new() }
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends a coordination group.
    #[must_use]
    pub fn with_group(mut self, group: CoordinationGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Looks up a step by ID.
    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Looks up a coordination group by ID.
    pub fn group(&self, group_id: &str) -> Option<&CoordinationGroup> {
        self.groups.iter().find(|g| g.group_id == group_id)
    }

    /// Parses a TOML definition.
    pub fn from_toml_str(content: &str) -> Result<Self, ValidationError> {
        toml::from_str(content).map_err(|e| ValidationError::Parse(e.to_string()))
    }

    /// Parses a YAML definition.
    pub fn from_yaml_str(content: &str) -> Result<Self, ValidationError> {
        serde_yaml::from_str(content).map_err(|e| ValidationError::Parse(e.to_string()))
    }

    /// Loads a definition file, choosing the format by extension
    /// (`.yaml`/`.yml` for YAML, anything else is read as TOML).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ValidationError::Io(format!("{}: {}", path.display(), e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    /// Validates the definition and builds its dependency graph.
    ///
    /// # Arguments
    /// * `has_target` - Reports whether an agent name is reachable
    ///
    /// # Errors
    /// Returns the first problem found: empty workflow, duplicate or malformed
    /// steps, malformed or unknown groups, unknown targets, unknown
    /// dependencies, or a dependency cycle.
    pub fn validate(
        &self,
        has_target: &dyn Fn(&str) -> bool,
    ) -> Result<DependencyGraph, ValidationError> {
        if self.steps.is_empty() {
            return Err(ValidationError::EmptyWorkflow(self.name.clone()));
        }

        let mut group_ids = HashSet::new();
        for group in &self.groups {
            if !group_ids.insert(group.group_id.as_str()) {
                return Err(ValidationError::InvalidGroup {
                    group_id: group.group_id.clone(),
                    reason: "duplicate group ID".to_string(),
                });
            }
            group.validate()?;
        }

        let mut step_ids = HashSet::new();
        for step in &self.steps {
            if step.step_id.is_empty() {
                return Err(ValidationError::InvalidStep {
                    step_id: step.step_id.clone(),
                    reason: "step ID is empty".to_string(),
                });
            }
            if !step_ids.insert(step.step_id.as_str()) {
                return Err(ValidationError::DuplicateStep(step.step_id.clone()));
            }

            let targets: Vec<&str> = match &step.coordination_group_id {
                Some(group_id) => self
                    .group(group_id)
                    .ok_or_else(|| ValidationError::UnknownGroup {
                        step_id: step.step_id.clone(),
                        group_id: group_id.clone(),
                    })?
                    .targets
                    .iter()
                    .map(String::as_str)
                    .collect(),
                None if step.target.is_empty() => {
                    return Err(ValidationError::InvalidStep {
                        step_id: step.step_id.clone(),
                        reason: "step has neither a target nor a coordination group".to_string(),
                    });
                }
                None => vec![step.target.as_str()],
            };
            if let Some(target) = targets.into_iter().find(|t| !has_target(t)) {
                return Err(ValidationError::UnknownTarget {
                    step_id: step.step_id.clone(),
                    target: target.to_string(),
                });
            }

            if step.retry.max_attempts == Some(0) {
                return Err(ValidationError::InvalidStep {
                    step_id: step.step_id.clone(),
                    reason: "retry.max_attempts must be at least 1".to_string(),
                });
            }
        }

        DependencyGraph::from_definition(self)
    }
}
