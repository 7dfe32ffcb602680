//! Multi-agent coordination.
//!
//! A step that names a coordination group runs every agent of the group
//! under one [`CoordinationStrategy`]:
//!
//! - **Sequential**: agents run in order; each one sees the previous output
//!   and the history so far. The first failure aborts the group.
//! - **Parallel**: agents run concurrently; a [`ParallelPolicy`] decides
//!   whether the group passed.
//! - **Consensus**: agents vote on the same proposal; a [`DecisionRule`]
//!   turns the votes into a decision or an indeterminate outcome.
//!
//! Members are executed through the [`StepExecutor`], so every guard applies
//! per agent. Agent lifecycles are tracked for the duration of the group.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use stratus_resilience::Priority;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::{ExecutionReport, StepExecutor, StepRequest};
use crate::failure::{AttemptFailure, AttemptRecord, FailureClassification};
use crate::lifecycle::AgentLifecycle;
use crate::workflow::CoordinationGroup;

/// How many members of a parallel group must succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelPolicy {
    /// Every member.
    #[default]
    All,
    /// At least one member.
    Any,
    /// More than half of the members.
    Majority,
    /// At least `n` members.
    AtLeast(usize),
}

impl ParallelPolicy {
    /// Successes needed out of `members`.
    pub fn required(self, members: usize) -> usize {
        match self {
            Self::All => members,
            Self::Any => 1,
            Self::Majority => members / 2 + 1,
            Self::AtLeast(n) => n,
        }
    }
}

impl fmt::Display for ParallelPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Any => write!(f, "any"),
            Self::Majority => write!(f, "majority"),
            Self::AtLeast(n) => write!(f, "at_least({})", n),
        }
    }
}

/// How consensus votes become a decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    /// Every member voted, and all votes agree.
    Unanimous,
    /// One vote was cast by more than half of the members.
    Majority,
    /// One vote carries at least this fraction of the group's total weight.
    WeightedQuorum(f64),
}

impl fmt::Display for DecisionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unanimous => write!(f, "unanimous"),
            Self::Majority => write!(f, "majority"),
            Self::WeightedQuorum(fraction) => write!(f, "weighted_quorum({})", fraction),
        }
    }
}

/// How a coordination group runs its agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationStrategy {
    /// One agent after another, output feeding forward.
    Sequential,
    /// All agents at once.
    Parallel {
        /// Pass/fail policy.
        #[serde(default)]
        policy: ParallelPolicy,
    },
    /// All agents vote on the same proposal.
    Consensus {
        /// Decision rule.
        rule: DecisionRule,
        /// Voting deadline in milliseconds; the engine default applies when unset.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

impl CoordinationStrategy {
    /// Builds the coordinator implementing this strategy.
    pub fn coordinator(&self, default_consensus_timeout: Duration) -> Box<dyn Coordinator> {
        match self {
            Self::Sequential => Box::new(SequentialCoordinator),
            Self::Parallel { policy } => Box::new(ParallelCoordinator { policy: *policy }),
            Self::Consensus { rule, timeout_ms } => Box::new(ConsensusCoordinator {
                rule: *rule,
                timeout: timeout_ms.map_or(default_consensus_timeout, Duration::from_millis),
            }),
        }
    }
}

/// One execution of a coordination group.
#[derive(Debug, Clone)]
pub struct CoordinationTask {
    /// Run ID.
    pub run_id: String,
    /// Step executed by the group.
    pub step_id: String,
    /// The group.
    pub group: CoordinationGroup,
    /// Step payload.
    pub payload: Value,
    /// Run variables.
    pub variables: HashMap<String, Value>,
    /// Step idempotency key; members use `{key}:{target}`.
    pub idempotency_key: Option<String>,
    /// Load shedding priority.
    pub priority: Priority,
    /// Escalated-tier attempt number.
    pub attempt: u32,
}

impl CoordinationTask {
    fn member_request(&self, target: &str, payload: Value) -> StepRequest {
        StepRequest {
            run_id: self.run_id.clone(),
            step_id: self.step_id.clone(),
            target: target.to_string(),
            payload,
            variables: self.variables.clone(),
            idempotency_key: self.idempotency_key.as_ref().map(|key| format!("{}:{}", key, target)),
            priority: self.priority,
            attempt: self.attempt,
        }
    }
}

/// Result of a coordination group.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinationOutcome {
    /// The group produced an output.
    Succeeded(Value),
    /// The group failed.
    Failed(AttemptFailure),
    /// Consensus was not reached.
    Indeterminate {
        /// Why no decision was reached.
        reason: String,
        /// Vote record.
        detail: Value,
    },
}

/// Outcome of a group plus every member attempt.
#[derive(Debug, Clone)]
pub struct CoordinationReport {
    /// Group outcome.
    pub outcome: CoordinationOutcome,
    /// Member attempts, in completion order.
    pub attempts: Vec<AttemptRecord>,
}

/// Common interface of the coordination strategies.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    /// Runs every member of `task.group`.
    async fn coordinate(
        &self,
        task: &CoordinationTask,
        executor: &StepExecutor,
        cancel: &CancellationToken,
    ) -> CoordinationReport;
}

/// Runs one member and tracks its lifecycle around the call.
async fn run_member(
    task: &CoordinationTask,
    target: &str,
    payload: Value,
    executor: &StepExecutor,
    lifecycle: &AgentLifecycle,
    cancel: &CancellationToken,
) -> ExecutionReport {
    if let Err(e) = lifecycle.start(target).await {
        debug!(agent_id = %target, error = %e, "Agent lifecycle not updated");
    }
    let report = executor.execute(task.member_request(target, payload), cancel).await;
    if let Err(e) = lifecycle.finish(target, report.result.is_ok()).await {
        debug!(agent_id = %target, error = %e, "Agent lifecycle not updated");
    }
    report
}

async fn agent_states(lifecycle: &AgentLifecycle) -> Value {
    json!(lifecycle.snapshot().await)
}

/// Group failure classification: environmental if any member failed for an
/// environmental reason, logic otherwise.
fn aggregate_classification<'a>(
    failures: impl IntoIterator<Item = &'a AttemptFailure>,
) -> FailureClassification {
    if failures.into_iter().any(|f| f.classification == FailureClassification::Environmental) {
        FailureClassification::Environmental
    } else {
        FailureClassification::Logic
    }
}

/// Runs targets one after another.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialCoordinator;

impl SequentialCoordinator {
    /// Input for a non-first member: the step payload plus `previous` and
    /// `history`. Non-object payloads are wrapped under `input`.
    fn chained_payload(payload: &Value, previous: &Value, history: &[Value]) -> Value {
        let mut object = match payload {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other.clone());
                map
            }
        };
        object.insert("previous".to_string(), previous.clone());
        object.insert("history".to_string(), Value::Array(history.to_vec()));
        Value::Object(object)
    }
}

#[async_trait]
impl Coordinator for SequentialCoordinator {
    fn name(&self) -> &'static str {
        "sequential"
    }

    async fn coordinate(
        &self,
        task: &CoordinationTask,
        executor: &StepExecutor,
        cancel: &CancellationToken,
    ) -> CoordinationReport {
        let lifecycle = AgentLifecycle::new(Arc::clone(executor.clock()));
        let mut attempts = Vec::with_capacity(task.group.targets.len());
        let mut history: Vec<Value> = Vec::new();
        let mut previous = Value::Null;

        for target in &task.group.targets {
            let payload = if history.is_empty() {
                task.payload.clone()
            } else {
                Self::chained_payload(&task.payload, &previous, &history)
            };

            let report = run_member(task, target, payload, executor, &lifecycle, cancel).await;
            attempts.push(report.attempt);
            match report.result {
                Ok(output) => {
                    history.push(json!({ "target": target, "output": output }));
                    previous = output;
                }
                Err(failure) => {
                    let mut failure = failure.to_attempt_failure();
                    failure.message = format!("'{}' failed: {}", target, failure.message);
                    return CoordinationReport { outcome: CoordinationOutcome::Failed(failure), attempts };
                }
            }
        }

        let output = json!({
            "output": previous,
            "history": history,
            "agent_states": agent_states(&lifecycle).await,
        });
        CoordinationReport { outcome: CoordinationOutcome::Succeeded(output), attempts }
    }
}

/// Runs targets concurrently.
#[derive(Debug, Clone, Copy)]
pub struct ParallelCoordinator {
    /// Pass/fail policy.
    pub policy: ParallelPolicy,
}

#[async_trait]
impl Coordinator for ParallelCoordinator {
    fn name(&self) -> &'static str {
        "parallel"
    }

    async fn coordinate(
        &self,
        task: &CoordinationTask,
        executor: &StepExecutor,
        cancel: &CancellationToken,
    ) -> CoordinationReport {
        let lifecycle = AgentLifecycle::new(Arc::clone(executor.clock()));
        let reports = join_all(task.group.targets.iter().map(|target| {
            run_member(task, target, task.payload.clone(), executor, &lifecycle, cancel)
        }))
        .await;

        let mut attempts = Vec::with_capacity(reports.len());
        let mut outcomes = Vec::with_capacity(reports.len());
        let mut failures = Vec::new();
        for (target, report) in task.group.targets.iter().zip(reports) {
            attempts.push(report.attempt);
            match report.result {
                Ok(output) => {
                    outcomes.push(json!({ "target": target, "status": "succeeded", "output": output }));
                }
                Err(failure) => {
                    let failure = failure.to_attempt_failure();
                    outcomes.push(json!({
                        "target": target,
                        "status": "failed",
                        "classification": failure.classification,
                        "error": failure.message,
                    }));
                    failures.push(failure);
                }
            }
        }

        let members = task.group.targets.len();
        let succeeded = members - failures.len();
        let required = self.policy.required(members);
        debug!(
            step_id = %task.step_id,
            succeeded = succeeded,
            required = required,
            policy = %self.policy,
            "Parallel group settled"
        );

        if succeeded >= required {
            let output = json!({
                "outcomes": outcomes,
                "succeeded": succeeded,
                "failed": failures.len(),
                "agent_states": agent_states(&lifecycle).await,
            });
            return CoordinationReport { outcome: CoordinationOutcome::Succeeded(output), attempts };
        }

        let first = failures.first().map(|f| f.message.as_str()).unwrap_or_default();
        let failure = AttemptFailure {
            classification: aggregate_classification(&failures),
            message: format!(
                "{} of {} members succeeded, policy {} requires {}: {}",
                succeeded, members, self.policy, required, first
            ),
        };
        CoordinationReport { outcome: CoordinationOutcome::Failed(failure), attempts }
    }
}

/// Collects votes and applies a decision rule.
#[derive(Debug, Clone, Copy)]
pub struct ConsensusCoordinator {
    /// Decision rule.
    pub rule: DecisionRule,
    /// Voting deadline.
    pub timeout: Duration,
}

/// Votes that serialize identically, with their voters.
struct Tally {
    vote: Value,
    voters: Vec<String>,
    weight: f64,
}

impl ConsensusCoordinator {
    /// Reads the vote out of an agent output.
    fn vote_of(output: Value) -> Value {
        match output {
            Value::Object(mut map) if map.contains_key("vote") => {
                map.remove("vote").unwrap_or(Value::Null)
            }
            other => other,
        }
    }

    /// Applies the rule to `votes` (target to vote). Returns the winning vote.
    pub fn decide(
        rule: DecisionRule,
        group: &CoordinationGroup,
        votes: &BTreeMap<String, Value>,
    ) -> Option<Value> {
        let weight_of = |target: &str| group.weights.get(target).copied().unwrap_or(1.0);

        let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
        for (target, vote) in votes {
            let tally = tallies.entry(vote.to_string()).or_insert_with(|| Tally {
                vote: vote.clone(),
                voters: Vec::new(),
                weight: 0.0,
            });
            tally.voters.push(target.clone());
            tally.weight += weight_of(target);
        }

        let members = group.targets.len();
        match rule {
            DecisionRule::Unanimous => {
                let mut tallies = tallies.into_values();
                match (tallies.next(), tallies.next()) {
                    (Some(tally), None) if tally.voters.len() == members => Some(tally.vote),
                    _ => None,
                }
            }
            DecisionRule::Majority => tallies
                .into_values()
                .find(|tally| tally.voters.len() * 2 > members)
                .map(|tally| tally.vote),
            DecisionRule::WeightedQuorum(fraction) => {
                let total: f64 = group.targets.iter().map(|t| weight_of(t)).sum();
                let needed = fraction * total;
                let mut qualifying: Vec<Tally> =
                    tallies.into_values().filter(|tally| tally.weight >= needed).collect();
                qualifying.sort_by(|a, b| b.weight.total_cmp(&a.weight));
                match qualifying.as_slice() {
                    [best] => Some(best.vote.clone()),
                    [best, second, ..] if best.weight > second.weight => Some(best.vote.clone()),
                    _ => None,
                }
            }
        }
    }
}

#[async_trait]
impl Coordinator for ConsensusCoordinator {
    fn name(&self) -> &'static str {
        "consensus"
    }

    async fn coordinate(
        &self,
        task: &CoordinationTask,
        executor: &StepExecutor,
        cancel: &CancellationToken,
    ) -> CoordinationReport {
        let lifecycle = AgentLifecycle::new(Arc::clone(executor.clock()));
        let mut pending: FuturesUnordered<_> = task
            .group
            .targets
            .iter()
            .map(|target| {
                let lifecycle = &lifecycle;
                async move {
                    let report =
                        run_member(task, target, task.payload.clone(), executor, lifecycle, cancel)
                            .await;
                    (target.clone(), report)
                }
            })
            .collect();

        let mut votes = BTreeMap::new();
        let mut failures: BTreeMap<String, AttemptFailure> = BTreeMap::new();
        let mut attempts = Vec::with_capacity(task.group.targets.len());
        let mut timed_out = false;

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some((target, report)) => {
                        attempts.push(report.attempt);
                        match report.result {
                            Ok(output) => {
                                votes.insert(target, Self::vote_of(output));
                            }
                            Err(failure) => {
                                failures.insert(target, failure.to_attempt_failure());
                            }
                        }
                    }
                    None => break,
                },
                () = &mut deadline => {
                    timed_out = true;
                    break;
                }
            }
        }
        drop(pending);

        let missing: Vec<&String> = task
            .group
            .targets
            .iter()
            .filter(|t| !votes.contains_key(*t) && !failures.contains_key(*t))
            .collect();
        if timed_out {
            warn!(
                step_id = %task.step_id,
                missing = missing.len(),
                timeout_ms = self.timeout.as_millis() as u64,
                "Consensus deadline passed"
            );
        }

        if votes.is_empty() && !failures.is_empty() && missing.is_empty() {
            let failure = AttemptFailure {
                classification: aggregate_classification(failures.values()),
                message: format!(
                    "every member failed: {}",
                    failures
                        .iter()
                        .map(|(target, f)| format!("{}: {}", target, f.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ),
            };
            return CoordinationReport { outcome: CoordinationOutcome::Failed(failure), attempts };
        }

        let decision = Self::decide(self.rule, &task.group, &votes);
        let mut record = json!({
            "rule": self.rule.to_string(),
            "votes": votes,
            "failures": failures,
            "missing": missing,
            "agent_states": agent_states(&lifecycle).await,
        });

        match decision {
            Some(decision) => {
                info!(step_id = %task.step_id, rule = %self.rule, "Consensus reached");
                if let Value::Object(map) = &mut record {
                    map.insert("decision".to_string(), decision);
                }
                CoordinationReport { outcome: CoordinationOutcome::Succeeded(record), attempts }
            }
            None => {
                let reason = if timed_out {
                    format!("no {} decision before the {}ms deadline", self.rule, self.timeout.as_millis())
                } else {
                    format!("no {} decision from {} votes", self.rule, votes.len())
                };
                warn!(step_id = %task.step_id, reason = %reason, "Consensus indeterminate");
                CoordinationReport {
                    outcome: CoordinationOutcome::Indeterminate { reason, detail: record },
                    attempts,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(rule: DecisionRule) -> CoordinationGroup {
        CoordinationGroup::new(
            "panel",
            CoordinationStrategy::Consensus { rule, timeout_ms: None },
            ["a", "b", "c"],
        )
    }

    fn votes(pairs: &[(&str, &str)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(t, v)| (t.to_string(), Value::from(*v))).collect()
    }

    #[test]
    fn test_majority_needs_more_than_half_of_members() {
        let g = group(DecisionRule::Majority);
        let two_of_three = votes(&[("a", "yes"), ("b", "yes"), ("c", "no")]);
        assert_eq!(
            ConsensusCoordinator::decide(DecisionRule::Majority, &g, &two_of_three),
            Some(Value::from("yes"))
        );

        let split = votes(&[("a", "x"), ("b", "y"), ("c", "z")]);
        assert_eq!(ConsensusCoordinator::decide(DecisionRule::Majority, &g, &split), None);

        let one_vote = votes(&[("a", "yes")]);
        assert_eq!(ConsensusCoordinator::decide(DecisionRule::Majority, &g, &one_vote), None);
    }

    #[test]
    fn test_unanimous_requires_every_member() {
        let g = group(DecisionRule::Unanimous);
        let partial = votes(&[("a", "yes"), ("b", "yes")]);
        assert_eq!(ConsensusCoordinator::decide(DecisionRule::Unanimous, &g, &partial), None);

        let all = votes(&[("a", "yes"), ("b", "yes"), ("c", "yes")]);
        assert_eq!(
            ConsensusCoordinator::decide(DecisionRule::Unanimous, &g, &all),
            Some(Value::from("yes"))
        );
    }

    #[test]
    fn test_weighted_quorum_uses_weights() {
        let rule = DecisionRule::WeightedQuorum(0.5);
        let g = group(rule).with_weight("c", 3.0);
        let outvoted = votes(&[("a", "yes"), ("b", "yes"), ("c", "no")]);
        assert_eq!(ConsensusCoordinator::decide(rule, &g, &outvoted), Some(Value::from("no")));

        let even = group(rule).with_weight("c", 2.0);
        assert_eq!(ConsensusCoordinator::decide(rule, &even, &outvoted), None);
    }

    #[test]
    fn test_vote_field_is_extracted() {
        assert_eq!(
            ConsensusCoordinator::vote_of(json!({"vote": "approve", "why": "fine"})),
            Value::from("approve")
        );
        assert_eq!(ConsensusCoordinator::vote_of(json!(42)), json!(42));
    }

    #[test]
    fn test_parallel_policy_requirements() {
        assert_eq!(ParallelPolicy::All.required(4), 4);
        assert_eq!(ParallelPolicy::Any.required(4), 1);
        assert_eq!(ParallelPolicy::Majority.required(4), 3);
        assert_eq!(ParallelPolicy::AtLeast(2).required(4), 2);
    }

    #[test]
    fn test_chained_payload_wraps_scalars() {
        let history = vec![json!({"target": "a", "output": 1})];
        let chained = SequentialCoordinator::chained_payload(&json!("draft"), &json!(1), &history);
        assert_eq!(chained["input"], "draft");
        assert_eq!(chained["previous"], 1);
        assert_eq!(chained["history"].as_array().unwrap().len(), 1);

        let merged = SequentialCoordinator::chained_payload(&json!({"k": true}), &json!(2), &history);
        assert_eq!(merged["k"], true);
        assert_eq!(merged["previous"], 2);
    }

    #[test]
    fn test_strategy_builds_matching_coordinator() {
        let default_timeout = Duration::from_secs(30);
        assert_eq!(CoordinationStrategy::Sequential.coordinator(default_timeout).name(), "sequential");
        assert_eq!(
            CoordinationStrategy::Parallel { policy: ParallelPolicy::Any }
                .coordinator(default_timeout)
                .name(),
            "parallel"
        );
        assert_eq!(
            CoordinationStrategy::Consensus { rule: DecisionRule::Majority, timeout_ms: Some(10) }
                .coordinator(default_timeout)
                .name(),
            "consensus"
        );
    }
}
