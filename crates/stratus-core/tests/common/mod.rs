//! Scripted agents and engine wiring shared by the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use stratus_abstraction::{AgentError, AgentInvoker, InvocationContext, ManualClock};
use stratus_core::config::RetryTierSettings;
use stratus_core::{Engine, StratusConfig, WorkflowRun};
use tokio::sync::{Barrier, Notify};

type Script = Box<dyn Fn(&str, &Value) -> Result<Value, AgentError> + Send + Sync>;

/// Answers every invocation through a closure and records the targets called.
pub struct ScriptedInvoker {
    script: Script,
    calls: Mutex<Vec<String>>,
}

impl ScriptedInvoker {
    pub fn new(
        script: impl Fn(&str, &Value) -> Result<Value, AgentError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self { script: Box::new(script), calls: Mutex::new(Vec::new()) })
    }

    /// Echoes every payload.
    pub fn echo() -> Arc<Self> {
        Self::new(|_, payload| Ok(payload.clone()))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, target: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|t| *t == target).count()
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        target_id: &str,
        payload: &Value,
        _context: &InvocationContext,
    ) -> Result<Value, AgentError> {
        self.calls.lock().unwrap().push(target_id.to_string());
        (self.script)(target_id, payload)
    }

    fn has_target(&self, target_id: &str) -> bool {
        target_id != "ghost"
    }
}

/// "left" and "right" only return once both are in flight.
pub struct RendezvousInvoker {
    barrier: Barrier,
}

impl RendezvousInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { barrier: Barrier::new(2) })
    }
}

#[async_trait]
impl AgentInvoker for RendezvousInvoker {
    async fn invoke(
        &self,
        target_id: &str,
        payload: &Value,
        _context: &InvocationContext,
    ) -> Result<Value, AgentError> {
        if matches!(target_id, "left" | "right") {
            self.barrier.wait().await;
        }
        Ok(payload.clone())
    }
}

/// "hang" never answers; it signals `started` when called.
pub struct HangingInvoker {
    pub started: Notify,
}

impl HangingInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { started: Notify::new() })
    }
}

#[async_trait]
impl AgentInvoker for HangingInvoker {
    async fn invoke(
        &self,
        target_id: &str,
        payload: &Value,
        _context: &InvocationContext,
    ) -> Result<Value, AgentError> {
        if target_id == "hang" {
            self.started.notify_one();
            std::future::pending::<()>().await;
        }
        Ok(payload.clone())
    }
}

pub fn tier(max_attempts: u32, initial_delay_ms: u64) -> RetryTierSettings {
    RetryTierSettings {
        max_attempts,
        initial_delay_ms,
        max_delay_ms: initial_delay_ms.max(1) * 60,
        base: 2.0,
        jitter: false,
    }
}

/// Single-invocation base tier, three escalated attempts 1s then 2s apart.
pub fn test_config() -> StratusConfig {
    let mut config = StratusConfig::default();
    config.retry.base = tier(1, 0);
    config.retry.escalated = tier(3, 1000);
    config
}

pub fn engine(invoker: Arc<dyn AgentInvoker>, config: StratusConfig) -> (Engine, ManualClock) {
    let clock = ManualClock::default();
    let engine = Engine::builder(invoker).with_clock(Arc::new(clock.clone())).with_config(config).build();
    (engine, clock)
}

/// Waits for a run, failing the test if it takes more than five seconds.
pub async fn finish(engine: &Engine, run_id: &str) -> WorkflowRun {
    tokio::time::timeout(Duration::from_secs(5), engine.wait(run_id))
        .await
        .expect("run did not finish in time")
        .expect("wait failed")
}
