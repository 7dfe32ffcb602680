//! Dependency-graph scheduler.
//!
//! A [`RunDriver`] owns one run for as long as it executes. It dispatches
//! every ready step (all dependencies completed) up to `max_parallelism` at
//! once, commits each settled step as a checkpoint, and recomputes the ready
//! set. Environmental failures go through the escalated retry tier before a
//! step is declared failed.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use stratus_abstraction::Clock;
use stratus_resilience::{RetryConfig, RetryPolicy};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointWriter;
use crate::coordinator::{CoordinationOutcome, CoordinationTask};
use crate::error::{EngineError, Result};
use crate::executor::{StepExecutor, StepRequest};
use crate::failure::{AttemptFailure, AttemptRecord, FailureClassification, FailureRecord};
use crate::state_machine::{StateMachine, TransitionTable};
use crate::workflow::definition::{CoordinationGroup, OnFailure, StepSpec};
use crate::workflow::graph::DependencyGraph;
use crate::workflow::run::{RunStatus, StepOutcome, WorkflowRun};

/// Scheduler limits.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Steps of one run executing at once.
    pub max_parallelism: usize,
    /// Escalated retry tier; steps may override fields.
    pub escalated_retry: RetryConfig,
    /// Voting deadline for consensus groups that do not set one.
    pub consensus_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            escalated_retry: RetryConfig::escalated_tier(),
            consensus_timeout: Duration::from_secs(30),
        }
    }
}

/// What one escalated attempt produced.
enum Attempted {
    Output(Value),
    Indeterminate { reason: String, detail: Value },
}

/// A failed escalated attempt with its records.
struct AttemptError {
    failure: AttemptFailure,
    records: Vec<AttemptRecord>,
}

/// Everything a spawned step needs, detached from the driver.
struct StepJob {
    run_id: String,
    step: StepSpec,
    group: Option<CoordinationGroup>,
    variables: HashMap<String, Value>,
    executor: Arc<StepExecutor>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    consensus_timeout: Duration,
}

impl StepJob {
    /// Runs the step through the escalated tier.
    ///
    /// Returns `None` if cancellation interrupted it.
    async fn run(self, cancel: CancellationToken) -> Option<StepOutcome> {
        let policy = RetryPolicy::new(self.retry.clone(), Arc::clone(&self.clock));
        let report = policy
            .execute(
                |attempt| self.attempt(attempt, &cancel),
                |error: &AttemptError| error.failure.classification.is_retryable(),
                &cancel,
            )
            .await;

        let mut attempts: Vec<AttemptRecord> =
            report.failures.into_iter().flat_map(|error| error.records).collect();
        match report.result {
            Ok((Attempted::Output(output), records)) => {
                attempts.extend(records);
                Some(StepOutcome::Succeeded { output, attempts })
            }
            Ok((Attempted::Indeterminate { reason, detail }, records)) => {
                attempts.extend(records);
                Some(StepOutcome::Indeterminate { reason, detail, attempts })
            }
            Err(_) if report.cancelled || cancel.is_cancelled() => None,
            Err(error) => {
                attempts.extend(error.records);
                Some(StepOutcome::Failed(FailureRecord::new(
                    self.step.step_id.clone(),
                    error.failure,
                    attempts,
                    self.clock.now(),
                )))
            }
        }
    }

    async fn attempt(
        &self,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> std::result::Result<(Attempted, Vec<AttemptRecord>), AttemptError> {
        if attempt > 1 {
            debug!(
                run_id = %self.run_id,
                step_id = %self.step.step_id,
                attempt = attempt,
                "Escalated retry"
            );
        }

        match &self.group {
            None => {
                let request = StepRequest {
                    run_id: self.run_id.clone(),
                    step_id: self.step.step_id.clone(),
                    target: self.step.target.clone(),
                    payload: self.step.payload.clone(),
                    variables: self.variables.clone(),
                    idempotency_key: self.step.idempotency_key.clone(),
                    priority: self.step.priority,
                    attempt,
                };
                let report = self.executor.execute(request, cancel).await;
                match report.result {
                    Ok(output) => Ok((Attempted::Output(output), vec![report.attempt])),
                    Err(failure) => Err(AttemptError {
                        failure: failure.to_attempt_failure(),
                        records: vec![report.attempt],
                    }),
                }
            }
            Some(group) => {
                let task = CoordinationTask {
                    run_id: self.run_id.clone(),
                    step_id: self.step.step_id.clone(),
                    group: group.clone(),
                    payload: self.step.payload.clone(),
                    variables: self.variables.clone(),
                    idempotency_key: self.step.idempotency_key.clone(),
                    priority: self.step.priority,
                    attempt,
                };
                let coordinator = group.strategy.coordinator(self.consensus_timeout);
                let report = coordinator.coordinate(&task, &self.executor, cancel).await;
                match report.outcome {
                    CoordinationOutcome::Succeeded(output) => {
                        Ok((Attempted::Output(output), report.attempts))
                    }
                    CoordinationOutcome::Indeterminate { reason, detail } => {
                        Ok((Attempted::Indeterminate { reason, detail }, report.attempts))
                    }
                    CoordinationOutcome::Failed(failure) => {
                        Err(AttemptError { failure, records: report.attempts })
                    }
                }
            }
        }
    }
}

/// Turns a panic inside a step into a logic failure.
fn panicked(step_id: &str, payload: &(dyn std::any::Any + Send), clock: &dyn Clock) -> StepOutcome {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    StepOutcome::Failed(FailureRecord::new(
        step_id,
        AttemptFailure {
            classification: FailureClassification::Logic,
            message: format!("step panicked: {}", message),
        },
        Vec::new(),
        clock.now(),
    ))
}

/// Drives one run from its current status to a terminal one.
pub struct RunDriver {
    run: WorkflowRun,
    machine: StateMachine<RunStatus, WorkflowRun>,
    graph: DependencyGraph,
    writer: CheckpointWriter,
    executor: Arc<StepExecutor>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    publisher: watch::Sender<WorkflowRun>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RunDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunDriver")
            .field("run_id", &self.run.run_id)
            .field("status", &self.run.status)
            .field("writer", &self.writer)
            .finish_non_exhaustive()
    }
}

impl RunDriver {
    /// Creates a driver for `run`, picking up from its current status and
    /// settled steps.
    ///
    /// # Arguments
    /// * `run` - The run, fresh or replayed from its checkpoints
    /// * `table` - Run status transitions
    /// * `graph` - Validated dependency graph of the run's definition
    /// * `writer` - Checkpoint writer positioned after the run's last checkpoint
    /// * `publisher` - Receives a snapshot after every commit
    /// * `cancel` - Fires to cancel the run
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run: WorkflowRun,
        table: Arc<TransitionTable<RunStatus, WorkflowRun>>,
        graph: DependencyGraph,
        writer: CheckpointWriter,
        executor: Arc<StepExecutor>,
        config: SchedulerConfig,
        publisher: watch::Sender<WorkflowRun>,
        cancel: CancellationToken,
    ) -> Self {
        let machine = StateMachine::restore(table, run.status);
        let clock = Arc::clone(executor.clock());
        Self { run, machine, graph, writer, executor, clock, config, publisher, cancel }
    }

    /// Persists the run, then publishes it.
    async fn commit(&mut self) -> Result<()> {
        self.writer.append(&mut self.run).await?;
        self.publisher.send_replace(self.run.clone());
        Ok(())
    }

    fn transition(&mut self, to: RunStatus) -> Result<()> {
        let from = self.machine.state();
        self.machine.transition(to, &mut self.run).map_err(|e| {
            error!(run_id = %self.run.run_id, error = %e, "Rejected run transition");
            EngineError::InvalidTransition { run_id: self.run.run_id.clone(), from, to }
        })?;
        Ok(())
    }

    /// Whether a settled failure already stops dispatch.
    fn failed_fast(&self) -> bool {
        self.run.step_results.iter().any(|(step_id, outcome)| {
            !outcome.is_success()
                && !matches!(outcome, StepOutcome::Skipped { .. })
                && self.run.definition.step(step_id).is_some_and(|s| s.on_failure == OnFailure::FailRun)
        })
    }

    fn job(&self, step_id: &str) -> Option<StepJob> {
        let step = self.run.definition.step(step_id)?.clone();
        let group = step
            .coordination_group_id
            .as_deref()
            .and_then(|group_id| self.run.definition.group(group_id))
            .cloned();
        Some(StepJob {
            run_id: self.run.run_id.clone(),
            retry: step.retry.resolve(&self.config.escalated_retry),
            step,
            group,
            variables: self.run.variables.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            executor: Arc::clone(&self.executor),
            clock: Arc::clone(&self.clock),
            consensus_timeout: self.config.consensus_timeout,
        })
    }

    /// Records a settled step and applies its failure policy.
    ///
    /// Returns true if the run must stop dispatching.
    fn settle(&mut self, step_id: &str, outcome: StepOutcome) -> bool {
        let run_id = self.run.run_id.clone();
        match &outcome {
            StepOutcome::Succeeded { attempts, .. } => {
                info!(run_id = %run_id, step_id = %step_id, attempts = attempts.len(), "Step succeeded");
            }
            StepOutcome::Failed(record) => warn!(
                run_id = %run_id,
                step_id = %step_id,
                classification = %record.classification,
                attempts = record.attempt_count,
                error = %record.message,
                "Step failed"
            ),
            StepOutcome::Indeterminate { reason, .. } => {
                warn!(run_id = %run_id, step_id = %step_id, reason = %reason, "Step indeterminate");
            }
            StepOutcome::Skipped { .. } => {}
        }

        let succeeded = outcome.is_success();
        self.run.record(step_id, outcome);
        if succeeded {
            return false;
        }

        let policy = self.run.definition.step(step_id).map_or(OnFailure::FailRun, |s| s.on_failure);
        match policy {
            OnFailure::FailRun => true,
            OnFailure::SkipDependents => {
                for dependent in self.graph.transitive_dependents(step_id) {
                    if !self.run.step_results.contains_key(&dependent) {
                        debug!(run_id = %run_id, step_id = %dependent, "Skipping dependent");
                        self.run.record(
                            &dependent,
                            StepOutcome::Skipped {
                                reason: format!("dependency '{}' did not succeed", step_id),
                            },
                        );
                    }
                }
                false
            }
        }
    }

    /// Runs the scheduling loop to a terminal status.
    ///
    /// # Errors
    /// Returns an error if a checkpoint cannot be written. The run is then
    /// left `Running` in the log so it can be resumed.
    pub async fn drive(mut self) -> Result<WorkflowRun> {
        if self.run.status == RunStatus::Pending {
            if self.cancel.is_cancelled() {
                self.transition(RunStatus::Cancelled)?;
                self.commit().await?;
                return Ok(self.run);
            }
            self.transition(RunStatus::Running)?;
            self.commit().await?;
        }
        info!(
            run_id = %self.run.run_id,
            workflow = %self.run.definition.name,
            steps = self.run.definition.steps.len(),
            settled = self.run.step_results.len(),
            "Driving run"
        );

        let step_cancel = self.cancel.child_token();
        let max_parallelism = self.config.max_parallelism.max(1);
        let mut in_flight: JoinSet<(String, Option<StepOutcome>)> = JoinSet::new();
        let mut dispatched: HashSet<String> = HashSet::new();
        let mut halted = self.failed_fast();
        let mut cancelled = self.cancel.is_cancelled();

        loop {
            if !halted && !cancelled {
                let ready = self.graph.ready_steps(&self.run.completed_steps, &|step_id: &str| {
                    self.run.step_results.contains_key(step_id) || dispatched.contains(step_id)
                });
                for step_id in ready {
                    if in_flight.len() >= max_parallelism {
                        break;
                    }
                    let Some(job) = self.job(&step_id) else {
                        continue;
                    };
                    debug!(run_id = %self.run.run_id, step_id = %step_id, "Dispatching step");
                    dispatched.insert(step_id.clone());

                    let cancel = step_cancel.clone();
                    let clock = Arc::clone(&self.clock);
                    in_flight.spawn(async move {
                        let outcome = match AssertUnwindSafe(job.run(cancel)).catch_unwind().await {
                            Ok(outcome) => outcome,
                            Err(payload) => Some(panicked(&step_id, payload.as_ref(), clock.as_ref())),
                        };
                        (step_id, outcome)
                    });
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (step_id, outcome) =
                        joined.map_err(|e| EngineError::Driver(format!("step task failed: {}", e)))?;
                    dispatched.remove(&step_id);
                    match outcome {
                        Some(outcome) if !cancelled || outcome.is_success() => {
                            halted |= self.settle(&step_id, outcome);
                            self.commit().await?;
                        }
                        _ => debug!(run_id = %self.run.run_id, step_id = %step_id, "Dropping interrupted step"),
                    }
                }
                () = self.cancel.cancelled(), if !cancelled => {
                    info!(run_id = %self.run.run_id, in_flight = in_flight.len(), "Cancelling run");
                    cancelled = true;
                }
            }
        }

        let terminal = if cancelled {
            RunStatus::Cancelled
        } else if halted {
            RunStatus::Failed
        } else if self.machine.can_transition(RunStatus::Completed, &self.run) {
            RunStatus::Completed
        } else {
            warn!(run_id = %self.run.run_id, "Steps left unsettled with nothing in flight");
            RunStatus::Failed
        };
        self.transition(terminal)?;
        self.commit().await?;

        info!(
            run_id = %self.run.run_id,
            status = %terminal,
            completed = self.run.completed_steps.len(),
            "Run finished"
        );
        Ok(self.run)
    }
}
