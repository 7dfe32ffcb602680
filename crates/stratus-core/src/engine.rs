//! Workflow orchestration engine.
//!
//! The [`Engine`] accepts workflow definitions, validates them, and drives
//! each accepted run on its own task. Every status change and step commit is
//! appended to the run's checkpoint log before it becomes visible through
//! [`Engine::get_status`], so a run interrupted by a crash can be rebuilt from
//! the log and resumed where it stopped.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratus_abstraction::{AgentInvoker, Clock, PersistentStore, SystemClock};
use stratus_resilience::{CircuitBreakerRegistry, CircuitBreakerStats, IdempotencyManager};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointLog, CheckpointWriter, RunHeader};
use crate::config::StratusConfig;
use crate::error::{EngineError, Result, ValidationError};
use crate::executor::StepExecutor;
use crate::failure::FailureClassifier;
use crate::state_machine::{StateMachine, TransitionTable};
use crate::storage::InMemoryStore;
use crate::workflow::{
    DependencyGraph, RunDriver, RunStatus, SchedulerConfig, WorkflowDefinition, WorkflowRun,
    run_status_table,
};

type RunTable = Arc<Mutex<HashMap<String, ActiveRun>>>;

/// A run with a driver task. The driver removes its own entry once it stops.
struct ActiveRun {
    generation: u64,
    snapshot: watch::Receiver<WorkflowRun>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<WorkflowRun>>,
}

impl ActiveRun {
    /// The driver is still working; a published terminal snapshot counts as done.
    fn is_live(&self) -> bool {
        !self.handle.is_finished() && !self.snapshot.borrow().status.is_terminal()
    }
}

/// Drops the entry of `run_id` if it still belongs to driver `generation`.
fn evict(runs: &RunTable, run_id: &str, generation: u64) {
    let mut table = runs.lock().unwrap_or_else(PoisonError::into_inner);
    if table.get(run_id).is_some_and(|active| active.generation == generation) {
        table.remove(run_id);
        debug!(run_id = %run_id, "Released finished run");
    }
}

/// One line of [`Engine::list_runs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run ID.
    pub run_id: String,
    /// Workflow name.
    pub workflow: String,
    /// Current status.
    pub status: RunStatus,
    /// Steps with an outcome.
    pub settled_steps: usize,
    /// Steps in the definition.
    pub total_steps: usize,
    /// When the run was accepted.
    pub created_at: DateTime<Utc>,
    /// When the run finished, if it has.
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&WorkflowRun> for RunSummary {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            workflow: run.definition.name.clone(),
            status: run.status,
            settled_steps: run.step_results.len(),
            total_steps: run.definition.steps.len(),
            created_at: run.created_at,
            finished_at: run.finished_at,
        }
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    invoker: Arc<dyn AgentInvoker>,
    store: Option<Arc<dyn PersistentStore>>,
    clock: Option<Arc<dyn Clock>>,
    classifier: Option<Arc<dyn FailureClassifier>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    config: StratusConfig,
}

impl EngineBuilder {
    /// Persists checkpoints and idempotency records in `store`
    /// (in memory by default).
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Reads time through `clock` (system time by default).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Applies `config`.
    #[must_use]
    pub fn with_config(mut self, config: StratusConfig) -> Self {
        self.config = config;
        self
    }

    /// Classifies step failures with `classifier`.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Shares an existing breaker registry instead of building one from config.
    #[must_use]
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Builds the engine.
    pub fn build(self) -> Engine {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self.store.unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let breakers = self
            .breakers
            .unwrap_or_else(|| Arc::new(config.breaker.registry(Arc::clone(&clock))));

        let mut idempotency = IdempotencyManager::new(config.idempotency.ttl(), Arc::clone(&clock));
        if config.idempotency.persist {
            idempotency = idempotency.with_store(Arc::clone(&store));
        }

        let mut executor =
            StepExecutor::new(self.invoker, breakers, Arc::new(idempotency), Arc::clone(&clock))
                .with_retry(config.retry.base.to_config())
                .with_step_timeout(config.engine.step_timeout());
        if let Some(classifier) = self.classifier {
            executor = executor.with_classifier(classifier);
        }
        if let Some(limiter) = config.backpressure(Arc::clone(&clock)) {
            executor = executor.with_backpressure(Arc::new(limiter), config.engine.load_capacity);
        }

        let scheduler = SchedulerConfig {
            max_parallelism: config.engine.max_parallelism,
            escalated_retry: config.retry.escalated.to_config(),
            consensus_timeout: config.consensus.default_timeout(),
        };

        Engine {
            executor: Arc::new(executor),
            log: CheckpointLog::new(store),
            table: run_status_table(Arc::clone(&clock)),
            clock,
            scheduler,
            runs: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }
}

/// Accepts, drives, and recovers workflow runs.
pub struct Engine {
    executor: Arc<StepExecutor>,
    log: CheckpointLog,
    table: Arc<TransitionTable<RunStatus, WorkflowRun>>,
    clock: Arc<dyn Clock>,
    scheduler: SchedulerConfig,
    runs: RunTable,
    generation: AtomicU64,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("Engine")
            .field("executor", &self.executor)
            .field("scheduler", &self.scheduler)
            .field("runs", &runs)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Starts building an engine that calls agents through `invoker`.
    pub fn builder(invoker: Arc<dyn AgentInvoker>) -> EngineBuilder {
        EngineBuilder {
            invoker,
            store: None,
            clock: None,
            classifier: None,
            breakers: None,
            config: StratusConfig::default(),
        }
    }

    /// The step executor shared by every run.
    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.executor
    }

    /// Validates `definition` against the engine's agents.
    ///
    /// # Errors
    /// Returns the first structural problem found.
    pub fn validate(&self, definition: &WorkflowDefinition) -> std::result::Result<DependencyGraph, ValidationError> {
        definition.validate(&|target: &str| self.executor.has_target(target))
    }

    /// Accepts a run of `definition` and starts driving it.
    ///
    /// The run is validated and its first checkpoint is written before this
    /// returns; nothing is dispatched if validation fails.
    ///
    /// # Arguments
    /// * `definition` - Workflow to run
    /// * `variables` - Initial run variables
    ///
    /// # Returns
    /// The new run ID.
    pub async fn execute(
        &self,
        definition: WorkflowDefinition,
        variables: BTreeMap<String, Value>,
    ) -> Result<String> {
        let graph = self.validate(&definition).inspect_err(|e| {
            warn!(workflow = %definition.name, error = %e, "Rejected workflow definition");
        })?;

        let run_id = Uuid::new_v4().to_string();
        let now = self.clock.now();
        let mut run = WorkflowRun::new(run_id.clone(), definition, variables, now);
        self.log
            .save_header(&RunHeader {
                run_id: run_id.clone(),
                definition: run.definition.clone(),
                created_at: now,
            })
            .await?;

        let mut writer = self.writer(&run_id, 0);
        writer.append(&mut run).await?;

        info!(run_id = %run_id, workflow = %run.definition.name, "Run accepted");
        self.launch(run, graph, writer);
        Ok(run_id)
    }

    fn writer(&self, run_id: &str, next_sequence: u64) -> CheckpointWriter {
        CheckpointWriter::new(
            Arc::clone(self.log.store()),
            Arc::clone(&self.clock),
            run_id,
            next_sequence,
        )
    }

    fn launch(&self, run: WorkflowRun, graph: DependencyGraph, writer: CheckpointWriter) {
        let run_id = run.run_id.clone();
        let (publisher, snapshot) = watch::channel(run.clone());
        let cancel = CancellationToken::new();
        let driver = RunDriver::new(
            run,
            Arc::clone(&self.table),
            graph,
            writer,
            Arc::clone(&self.executor),
            self.scheduler.clone(),
            publisher,
            cancel.clone(),
        );

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let runs = Arc::clone(&self.runs);
        // Held until the entry is in, so a driver that finishes at once
        // still finds its own entry to evict.
        let mut table = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let task_run_id = run_id.clone();
        let handle = tokio::spawn(async move {
            let result = driver.drive().await;
            if let Err(e) = &result {
                error!(run_id = %task_run_id, error = %e, "Run driver stopped");
            }
            evict(&runs, &task_run_id, generation);
            result
        });
        table.insert(run_id, ActiveRun { generation, snapshot, cancel, handle });
    }

    fn is_live(&self, run_id: &str) -> bool {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .is_some_and(ActiveRun::is_live)
    }

    fn forget(&self, run_id: &str) {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner).remove(run_id);
    }

    /// Runs currently held in memory by a driver.
    pub fn active_runs(&self) -> usize {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Latest snapshot of a run.
    ///
    /// Served from memory while a driver holds the run, otherwise rebuilt
    /// from the checkpoint log.
    pub async fn get_status(&self, run_id: &str) -> Result<WorkflowRun> {
        let snapshot = self
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .map(|active| active.snapshot.borrow().clone());
        if let Some(run) = snapshot {
            return Ok(run);
        }

        self.log.replay(run_id).await?.ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    /// Cancels a run.
    ///
    /// A live run stops dispatching, its in-flight steps are cancelled, and
    /// it ends `Cancelled`. A run without a driver (left `Pending` or
    /// `Running` by a crash) is marked `Cancelled` directly.
    ///
    /// # Errors
    /// Returns `InvalidTransition` if the run already finished.
    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        let live_token = self
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .filter(|active| active.is_live())
            .map(|active| active.cancel.clone());
        if let Some(token) = live_token {
            info!(run_id = %run_id, "Cancellation requested");
            token.cancel();
            return Ok(());
        }

        let mut run = self.get_status(run_id).await?;
        let mut machine = StateMachine::restore(Arc::clone(&self.table), run.status);
        let from = run.status;
        machine.transition(RunStatus::Cancelled, &mut run).map_err(|_| {
            EngineError::InvalidTransition { run_id: run_id.to_string(), from, to: RunStatus::Cancelled }
        })?;

        let next = run.last_sequence().map_or(0, |s| s + 1);
        self.writer(run_id, next).append(&mut run).await?;
        self.forget(run_id);
        info!(run_id = %run_id, "Cancelled run without a driver");
        Ok(())
    }

    /// Resumes a run whose driver is gone.
    ///
    /// Only runs whose last checkpoint is `Running` can be resumed. Steps
    /// already settled in the log are not executed again.
    pub async fn resume(&self, run_id: &str) -> Result<()> {
        if self.is_live(run_id) {
            return Err(EngineError::AlreadyActive(run_id.to_string()));
        }

        let run = self.log.replay(run_id).await?.ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        if run.status != RunStatus::Running {
            return Err(EngineError::NotResumable {
                run_id: run_id.to_string(),
                reason: format!("last checkpoint is {}", run.status),
            });
        }

        let graph = self.validate(&run.definition)?;
        let next = run.last_sequence().map_or(0, |s| s + 1);
        info!(
            run_id = %run_id,
            settled = run.step_results.len(),
            next_sequence = next,
            "Resuming run"
        );
        let writer = self.writer(run_id, next);
        self.launch(run, graph, writer);
        Ok(())
    }

    /// Restarts a finished run from checkpoint `sequence`.
    ///
    /// Appends a `Running` checkpoint holding the chosen snapshot's progress,
    /// then resumes from it. Later checkpoints stay in the log.
    pub async fn rollback(&self, run_id: &str, sequence: u64) -> Result<()> {
        if self.is_live(run_id) {
            return Err(EngineError::AlreadyActive(run_id.to_string()));
        }

        let mut run = self.log.replay(run_id).await?.ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        if !run.status.is_terminal() {
            return Err(EngineError::NotResumable {
                run_id: run_id.to_string(),
                reason: format!("run is {}; only finished runs can be rolled back", run.status),
            });
        }

        let checkpoint: Checkpoint = self.log.load(run_id, sequence).await?;
        let graph = self.validate(&run.definition)?;
        run.completed_steps = checkpoint.completed_steps;
        run.step_results = checkpoint.step_results;
        run.variables = checkpoint.variables;
        run.status = RunStatus::Running;
        run.finished_at = None;
        run.started_at.get_or_insert(checkpoint.taken_at);

        let next = run.last_sequence().map_or(0, |s| s + 1);
        let mut writer = self.writer(run_id, next);
        writer.append(&mut run).await?;
        info!(run_id = %run_id, sequence = sequence, "Rolled back run");
        self.launch(run, graph, writer);
        Ok(())
    }

    /// Waits until a live run reaches a terminal status.
    ///
    /// # Errors
    /// Returns `Driver` if the run is not terminal and no driver is executing it.
    pub async fn wait(&self, run_id: &str) -> Result<WorkflowRun> {
        let receiver = self
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .map(|active| active.snapshot.clone());

        let run = match receiver {
            Some(mut receiver) => {
                // A closed channel still holds the driver's last snapshot.
                let _ = receiver.wait_for(|run| run.status.is_terminal()).await;
                receiver.borrow().clone()
            }
            None => self.get_status(run_id).await?,
        };

        if run.status.is_terminal() {
            Ok(run)
        } else {
            Err(EngineError::Driver(format!("no driver is executing run {} ({})", run_id, run.status)))
        }
    }

    /// Summaries of every run in the store, oldest run ID first.
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut summaries = Vec::new();
        for run_id in self.log.run_ids().await? {
            let run = self.get_status(&run_id).await?;
            summaries.push(RunSummary::from(&run));
        }
        Ok(summaries)
    }

    /// Every checkpoint of a run, oldest first.
    pub async fn checkpoints(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        self.log.load_all(run_id).await
    }

    /// Deletes a finished run and its checkpoints.
    ///
    /// Returns the number of checkpoints removed.
    pub async fn purge(&self, run_id: &str) -> Result<usize> {
        if self.is_live(run_id) {
            return Err(EngineError::AlreadyActive(run_id.to_string()));
        }
        let run = self.get_status(run_id).await?;
        if !run.status.is_terminal() {
            return Err(EngineError::NotTerminal { run_id: run_id.to_string(), status: run.status });
        }

        let removed = self.log.purge(run_id).await?;
        self.forget(run_id);
        info!(run_id = %run_id, checkpoints = removed, "Purged run");
        Ok(removed)
    }

    /// Drops expired idempotency records.
    pub async fn purge_idempotency(&self) -> usize {
        self.executor.idempotency().purge_expired().await
    }

    /// Statistics of every circuit breaker.
    pub fn breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        self.executor.breakers().stats()
    }
}
