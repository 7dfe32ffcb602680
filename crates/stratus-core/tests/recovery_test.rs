//! Checkpoint-driven recovery: resume after a crash, cancellation, rollback
//! and retention.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use stratus_abstraction::{AgentError, Clock, ManualClock, PersistentStore};
use stratus_core::{
    CheckpointLog, CheckpointWriter, Engine, EngineError, FileStore, InMemoryStore, RunHeader,
    RunStatus, StepOutcome, StepSpec, WorkflowDefinition, WorkflowRun,
};

use common::{HangingInvoker, ScriptedInvoker, finish, test_config};

fn two_steps() -> WorkflowDefinition {
    WorkflowDefinition::new("pair")
        .with_step(StepSpec::new("first", "alpha"))
        .with_step(StepSpec::new("second", "beta").depends_on(["first"]))
}

/// Writes the log a crashed engine leaves behind: the run is `Running` and
/// `first` has succeeded.
async fn crashed_run(store: Arc<dyn PersistentStore>, clock: &ManualClock) -> String {
    let run_id = "run-crashed".to_string();
    let log = CheckpointLog::new(Arc::clone(&store));
    log.save_header(&RunHeader {
        run_id: run_id.clone(),
        definition: two_steps(),
        created_at: clock.now(),
    })
    .await
    .unwrap();

    let mut run = WorkflowRun::new(run_id.clone(), two_steps(), BTreeMap::new(), clock.now());
    let mut writer = CheckpointWriter::new(store, Arc::new(clock.clone()), &run_id, 0);
    writer.append(&mut run).await.unwrap();
    run.status = RunStatus::Running;
    run.started_at = Some(clock.now());
    writer.append(&mut run).await.unwrap();
    run.record("first", StepOutcome::Succeeded { output: json!("alpha done"), attempts: Vec::new() });
    writer.append(&mut run).await.unwrap();
    run_id
}

fn engine_on(
    invoker: Arc<dyn stratus_abstraction::AgentInvoker>,
    store: Arc<dyn PersistentStore>,
    clock: &ManualClock,
) -> Engine {
    Engine::builder(invoker)
        .with_store(store)
        .with_clock(Arc::new(clock.clone()))
        .with_config(test_config())
        .build()
}

#[tokio::test]
async fn test_resume_skips_settled_steps() {
    let clock = ManualClock::default();
    let store: Arc<dyn PersistentStore> = Arc::new(InMemoryStore::new());
    let run_id = crashed_run(Arc::clone(&store), &clock).await;

    let invoker = ScriptedInvoker::echo();
    let engine = engine_on(invoker.clone(), store, &clock);
    assert_eq!(engine.get_status(&run_id).await.unwrap().status, RunStatus::Running);

    engine.resume(&run_id).await.unwrap();
    let run = finish(&engine, &run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(invoker.calls(), vec!["beta"]);
    assert_eq!(run.step_results["first"], StepOutcome::Succeeded {
        output: json!("alpha done"),
        attempts: Vec::new(),
    });

    let sequences: Vec<u64> =
        engine.checkpoints(&run_id).await.unwrap().iter().map(|c| c.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_resume_rules() {
    let clock = ManualClock::default();
    let store: Arc<dyn PersistentStore> = Arc::new(InMemoryStore::new());
    let engine = engine_on(ScriptedInvoker::echo(), store, &clock);

    let err = engine.resume("missing").await.unwrap_err();
    assert!(matches!(err, EngineError::RunNotFound(_)));

    let run_id = engine.execute(two_steps(), BTreeMap::new()).await.unwrap();
    finish(&engine, &run_id).await;
    let err = engine.resume(&run_id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotResumable { .. }));
}

#[tokio::test]
async fn test_cancel_interrupts_in_flight_step() {
    let invoker = HangingInvoker::new();
    let (engine, _) = common::engine(invoker.clone(), test_config());
    let definition = WorkflowDefinition::new("stuck")
        .with_step(StepSpec::new("wait", "hang"))
        .with_step(StepSpec::new("after", "beta").depends_on(["wait"]));

    let run_id = engine.execute(definition, BTreeMap::new()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), invoker.started.notified()).await.unwrap();
    engine.cancel(&run_id).await.unwrap();
    let run = finish(&engine, &run_id).await;

    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.step_results.is_empty());
    assert!(run.finished_at.is_some());

    let err = engine.cancel(&run_id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { to: RunStatus::Cancelled, .. }));
}

#[tokio::test]
async fn test_cancel_run_without_driver() {
    let clock = ManualClock::default();
    let store: Arc<dyn PersistentStore> = Arc::new(InMemoryStore::new());
    let run_id = crashed_run(Arc::clone(&store), &clock).await;
    let engine = engine_on(ScriptedInvoker::echo(), store, &clock);

    engine.cancel(&run_id).await.unwrap();

    let run = engine.get_status(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.completed_steps.contains("first"));
    assert_eq!(run.last_sequence(), Some(3));
    assert!(matches!(engine.resume(&run_id).await, Err(EngineError::NotResumable { .. })));
}

#[tokio::test]
async fn test_rollback_replays_from_chosen_checkpoint() {
    let fail_beta = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let flag = Arc::clone(&fail_beta);
    let invoker = ScriptedInvoker::new(move |target, payload| {
        if target == "beta" && flag.load(std::sync::atomic::Ordering::SeqCst) {
            Err(AgentError::InvalidInput("beta misconfigured".into()))
        } else {
            Ok(payload.clone())
        }
    });
    let (engine, _) = common::engine(invoker.clone(), test_config());

    let run_id = engine.execute(two_steps(), BTreeMap::new()).await.unwrap();
    let failed = finish(&engine, &run_id).await;
    assert_eq!(failed.status, RunStatus::Failed);

    let after_first = engine
        .checkpoints(&run_id)
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.completed_steps.contains("first") && !c.step_results.contains_key("second"))
        .unwrap();

    fail_beta.store(false, std::sync::atomic::Ordering::SeqCst);
    engine.rollback(&run_id, after_first.sequence).await.unwrap();
    let run = finish(&engine, &run_id).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(invoker.calls_to("alpha"), 1);
    assert_eq!(invoker.calls_to("beta"), 2);

    let err = engine.rollback(&run_id, 999).await.unwrap_err();
    assert!(matches!(err, EngineError::CheckpointNotFound { sequence: 999, .. }));
}

#[tokio::test]
async fn test_purge_removes_finished_runs_only() {
    let clock = ManualClock::default();
    let store: Arc<dyn PersistentStore> = Arc::new(InMemoryStore::new());
    let crashed = crashed_run(Arc::clone(&store), &clock).await;
    let engine = engine_on(ScriptedInvoker::echo(), store, &clock);

    let err = engine.purge(&crashed).await.unwrap_err();
    assert!(matches!(err, EngineError::NotTerminal { status: RunStatus::Running, .. }));

    let run_id = engine.execute(two_steps(), BTreeMap::new()).await.unwrap();
    finish(&engine, &run_id).await;
    assert_eq!(engine.list_runs().await.unwrap().len(), 2);

    let removed = engine.purge(&run_id).await.unwrap();
    assert_eq!(removed, 5);
    assert!(matches!(engine.get_status(&run_id).await, Err(EngineError::RunNotFound(_))));

    let remaining = engine.list_runs().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].run_id, crashed);
    assert_eq!(remaining[0].settled_steps, 1);
    assert_eq!(remaining[0].total_steps, 2);
}

#[tokio::test]
async fn test_file_store_survives_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::default();

    let run_id = {
        let store: Arc<dyn PersistentStore> = Arc::new(FileStore::new(dir.path()));
        let engine = engine_on(ScriptedInvoker::echo(), store, &clock);
        let run_id = engine.execute(two_steps(), BTreeMap::new()).await.unwrap();
        finish(&engine, &run_id).await;
        run_id
    };

    let store: Arc<dyn PersistentStore> = Arc::new(FileStore::new(dir.path()));
    let engine = engine_on(ScriptedInvoker::echo(), store, &clock);
    let run = engine.get_status(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_steps.len(), 2);
    assert!(run.finished_at.is_some());
    assert_eq!(engine.list_runs().await.unwrap()[0].workflow, "pair");
}

#[tokio::test]
async fn test_idempotent_step_runs_once_across_runs() {
    let invoker = ScriptedInvoker::new(|_, _| Ok(json!({"charged": true})));
    let (engine, _) = common::engine(invoker.clone(), test_config());
    let definition = WorkflowDefinition::new("billing")
        .with_step(StepSpec::new("charge", "payments").with_idempotency_key("invoice-17"));

    for _ in 0..2 {
        let run_id = engine.execute(definition.clone(), BTreeMap::new()).await.unwrap();
        let run = finish(&engine, &run_id).await;
        assert_eq!(run.status, RunStatus::Completed);
    }
    assert_eq!(invoker.calls_to("payments"), 1);
}

#[tokio::test]
async fn test_finished_run_is_released_and_served_from_log() {
    let (engine, _) = common::engine(ScriptedInvoker::echo(), test_config());

    let mut finished = Vec::new();
    for _ in 0..3 {
        let run_id = engine.execute(two_steps(), BTreeMap::new()).await.unwrap();
        finished.push(finish(&engine, &run_id).await);
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.active_runs() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("finished runs were not released");

    for run in &finished {
        let replayed = engine.get_status(&run.run_id).await.unwrap();
        assert_eq!(replayed.status, RunStatus::Completed);
        assert_eq!(replayed.completed_steps, run.completed_steps);
        assert_eq!(replayed.step_results, run.step_results);
        assert_eq!(replayed.finished_at, run.finished_at);
        assert_eq!(engine.wait(&run.run_id).await.unwrap().status, RunStatus::Completed);
    }
    assert_eq!(engine.list_runs().await.unwrap().len(), 3);
}
