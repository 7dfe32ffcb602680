//! Append-only checkpoint log.
//!
//! Every status change and every step commit of a run is written as an
//! immutable [`Checkpoint`] under `checkpoints/{run_id}/{sequence:010}` before
//! it becomes visible through the engine. A run header holding the definition
//! is stored once under `runs/{run_id}`. Replaying the log rebuilds the run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratus_abstraction::{Clock, PersistentStore};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::workflow::{CheckpointRef, RunStatus, StepOutcome, WorkflowDefinition, WorkflowRun};

/// Namespace holding checkpoints.
pub const CHECKPOINT_NAMESPACE: &str = "checkpoints";

/// Namespace holding run headers.
pub const RUN_NAMESPACE: &str = "runs";

/// Immutable snapshot of run progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Run ID.
    pub run_id: String,
    /// Position in the log, starting at 0.
    pub sequence: u64,
    /// Run status at the time of the snapshot.
    pub status: RunStatus,
    /// Steps that had succeeded.
    pub completed_steps: BTreeSet<String>,
    /// Settled step outcomes.
    pub step_results: BTreeMap<String, StepOutcome>,
    /// Run variables.
    pub variables: BTreeMap<String, Value>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Captures `run` as checkpoint `sequence`.
    pub fn capture(run: &WorkflowRun, sequence: u64, taken_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run.run_id.clone(),
            sequence,
            status: run.status,
            completed_steps: run.completed_steps.clone(),
            step_results: run.step_results.clone(),
            variables: run.variables.clone(),
            taken_at,
        }
    }

    /// Store key for checkpoint `sequence` of `run_id`.
    pub fn key(run_id: &str, sequence: u64) -> String {
        format!("{}/{:010}", run_id, sequence)
    }

    /// Reference used in `WorkflowRun::checkpoints`.
    pub fn to_ref(&self) -> CheckpointRef {
        CheckpointRef { sequence: self.sequence, status: self.status, taken_at: self.taken_at }
    }
}

/// Per-run record stored once when the run is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHeader {
    /// Run ID.
    pub run_id: String,
    /// Definition being executed.
    pub definition: WorkflowDefinition,
    /// When the run was accepted.
    pub created_at: DateTime<Utc>,
}

/// Single writer for one run's checkpoint log.
///
/// Owned by the task driving the run; sequences are assigned here.
pub struct CheckpointWriter {
    store: Arc<dyn PersistentStore>,
    clock: Arc<dyn Clock>,
    run_id: String,
    next_sequence: u64,
}

impl std::fmt::Debug for CheckpointWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointWriter")
            .field("run_id", &self.run_id)
            .field("next_sequence", &self.next_sequence)
            .finish_non_exhaustive()
    }
}

impl CheckpointWriter {
    /// Creates a writer that continues the log at `next_sequence`.
    pub fn new(
        store: Arc<dyn PersistentStore>,
        clock: Arc<dyn Clock>,
        run_id: impl Into<String>,
        next_sequence: u64,
    ) -> Self {
        Self { store, clock, run_id: run_id.into(), next_sequence }
    }

    /// Sequence the next checkpoint will get.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Persists a snapshot of `run` and records it in `run.checkpoints`.
    ///
    /// # Errors
    /// Returns an error if the store rejects the write; the sequence is not
    /// consumed in that case.
    pub async fn append(&mut self, run: &mut WorkflowRun) -> Result<CheckpointRef> {
        let checkpoint = Checkpoint::capture(run, self.next_sequence, self.clock.now());
        let key = Checkpoint::key(&self.run_id, checkpoint.sequence);
        self.store.save(CHECKPOINT_NAMESPACE, &key, serde_json::to_value(&checkpoint)?).await?;

        debug!(
            run_id = %self.run_id,
            sequence = checkpoint.sequence,
            status = %checkpoint.status,
            "Checkpoint appended"
        );
        self.next_sequence += 1;
        let reference = checkpoint.to_ref();
        run.checkpoints.push(reference.clone());
        Ok(reference)
    }
}

/// Read access to the checkpoint log and run headers.
#[derive(Clone)]
pub struct CheckpointLog {
    store: Arc<dyn PersistentStore>,
}

impl std::fmt::Debug for CheckpointLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointLog").finish_non_exhaustive()
    }
}

impl CheckpointLog {
    /// Creates a log over `store`.
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    /// Stores the header for a new run.
    pub async fn save_header(&self, header: &RunHeader) -> Result<()> {
        self.store.save(RUN_NAMESPACE, &header.run_id, serde_json::to_value(header)?).await?;
        Ok(())
    }

    /// Loads a run header, `None` if the run is unknown.
    pub async fn load_header(&self, run_id: &str) -> Result<Option<RunHeader>> {
        match self.store.load(RUN_NAMESPACE, run_id).await {
            Ok(value) => Ok(Some(serde_json::from_value(value)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// IDs of every run with a stored header, ascending.
    pub async fn run_ids(&self) -> Result<Vec<String>> {
        Ok(self.store.list(RUN_NAMESPACE, "").await?)
    }

    /// Every checkpoint of `run_id`, oldest first.
    pub async fn load_all(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        let keys = self.store.list(CHECKPOINT_NAMESPACE, &format!("{}/", run_id)).await?;
        let mut checkpoints = Vec::with_capacity(keys.len());
        for key in keys {
            let value = self.store.load(CHECKPOINT_NAMESPACE, &key).await?;
            checkpoints.push(serde_json::from_value::<Checkpoint>(value)?);
        }
        checkpoints.sort_by_key(|c| c.sequence);
        Ok(checkpoints)
    }

    /// Loads checkpoint `sequence` of `run_id`.
    pub async fn load(&self, run_id: &str, sequence: u64) -> Result<Checkpoint> {
        match self.store.load(CHECKPOINT_NAMESPACE, &Checkpoint::key(run_id, sequence)).await {
            Ok(value) => Ok(serde_json::from_value(value)?),
            Err(e) if e.is_not_found() => Err(EngineError::CheckpointNotFound {
                run_id: run_id.to_string(),
                sequence,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Rebuilds a run from its header and checkpoint log.
    ///
    /// Returns `None` if no header exists.
    pub async fn replay(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let Some(header) = self.load_header(run_id).await? else {
            return Ok(None);
        };
        let checkpoints = self.load_all(run_id).await?;
        Ok(Some(Self::rebuild(header, &checkpoints)))
    }

    /// Applies `checkpoints` in order on top of a fresh run.
    pub fn rebuild(header: RunHeader, checkpoints: &[Checkpoint]) -> WorkflowRun {
        let mut run =
            WorkflowRun::new(header.run_id, header.definition, BTreeMap::new(), header.created_at);

        let mut expected = 0;
        for checkpoint in checkpoints {
            if checkpoint.sequence != expected {
                warn!(
                    run_id = %run.run_id,
                    expected = expected,
                    found = checkpoint.sequence,
                    "Gap in checkpoint log"
                );
            }
            expected = checkpoint.sequence + 1;

            run.status = checkpoint.status;
            run.completed_steps.clone_from(&checkpoint.completed_steps);
            run.step_results.clone_from(&checkpoint.step_results);
            run.variables.clone_from(&checkpoint.variables);
            if checkpoint.status == RunStatus::Running && run.started_at.is_none() {
                run.started_at = Some(checkpoint.taken_at);
            }
            run.finished_at = checkpoint.status.is_terminal().then_some(checkpoint.taken_at);
            run.checkpoints.push(checkpoint.to_ref());
        }
        run
    }

    /// Deletes the header and every checkpoint of `run_id`.
    ///
    /// Returns the number of checkpoints removed.
    pub async fn purge(&self, run_id: &str) -> Result<usize> {
        let keys = self.store.list(CHECKPOINT_NAMESPACE, &format!("{}/", run_id)).await?;
        for key in &keys {
            self.store.delete(CHECKPOINT_NAMESPACE, key).await?;
        }
        self.store.delete(RUN_NAMESPACE, run_id).await?;
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::workflow::StepSpec;
    use stratus_abstraction::ManualClock;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new("pair")
            .with_step(StepSpec::new("a", "agent"))
            .with_step(StepSpec::new("b", "agent").depends_on(["a"]))
    }

    #[tokio::test]
    async fn test_append_and_replay() {
        let store: Arc<dyn PersistentStore> = Arc::new(InMemoryStore::new());
        let clock = ManualClock::default();
        let log = CheckpointLog::new(Arc::clone(&store));
        let now = clock.now();

        let mut run = WorkflowRun::new("r1", definition(), BTreeMap::new(), now);
        log.save_header(&RunHeader {
            run_id: "r1".into(),
            definition: run.definition.clone(),
            created_at: now,
        })
        .await
        .unwrap();

        let mut writer = CheckpointWriter::new(Arc::clone(&store), Arc::new(clock.clone()), "r1", 0);
        writer.append(&mut run).await.unwrap();
        run.status = RunStatus::Running;
        writer.append(&mut run).await.unwrap();
        run.record("a", StepOutcome::Succeeded { output: serde_json::json!(1), attempts: vec![] });
        let last = writer.append(&mut run).await.unwrap();
        assert_eq!(last.sequence, 2);
        assert_eq!(writer.next_sequence(), 3);

        let replayed = log.replay("r1").await.unwrap().unwrap();
        assert_eq!(replayed.status, RunStatus::Running);
        assert!(replayed.completed_steps.contains("a"));
        assert_eq!(replayed.checkpoints.len(), 3);
        assert_eq!(replayed.started_at, Some(now));

        let first = log.load("r1", 0).await.unwrap();
        assert_eq!(first.status, RunStatus::Pending);
        assert!(matches!(
            log.load("r1", 7).await,
            Err(EngineError::CheckpointNotFound { sequence: 7, .. })
        ));
    }

    #[tokio::test]
    async fn test_purge_removes_everything() {
        let store: Arc<dyn PersistentStore> = Arc::new(InMemoryStore::new());
        let log = CheckpointLog::new(Arc::clone(&store));
        let mut run = WorkflowRun::new("r1", definition(), BTreeMap::new(), Utc::now());
        log.save_header(&RunHeader {
            run_id: "r1".into(),
            definition: run.definition.clone(),
            created_at: run.created_at,
        })
        .await
        .unwrap();
        let mut writer = CheckpointWriter::new(Arc::clone(&store), Arc::new(ManualClock::default()), "r1", 0);
        writer.append(&mut run).await.unwrap();
        writer.append(&mut run).await.unwrap();

        assert_eq!(log.purge("r1").await.unwrap(), 2);
        assert!(log.replay("r1").await.unwrap().is_none());
        assert!(log.run_ids().await.unwrap().is_empty());
    }

    #[test]
    fn test_key_format_sorts_numerically() {
        assert_eq!(Checkpoint::key("r1", 42), "r1/0000000042");
        assert!(Checkpoint::key("r1", 9) < Checkpoint::key("r1", 10));
    }
}
