//! Agent lifecycle tracking.
//!
//! Each coordinated target moves `Idle → Running → Idle | Error` while a
//! coordinator works with it. States are enforced by the generic
//! [`StateMachine`](crate::state_machine::StateMachine).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratus_abstraction::Clock;
use tokio::sync::RwLock;
use tracing::error;

use crate::state_machine::{StateMachine, TransitionError, TransitionTable};

/// Agent execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// Agent is idle and ready to execute.
    Idle,
    /// Agent is currently running.
    Running,
    /// Agent's last invocation failed.
    Error,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Idle => write!(f, "idle"),
            AgentState::Running => write!(f, "running"),
            AgentState::Error => write!(f, "error"),
        }
    }
}

/// Counters kept alongside each agent's state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentActivity {
    /// Times the agent entered `Running`.
    pub invocations: u32,
    /// Times the agent entered `Error`.
    pub failures: u32,
    /// Set while the agent is running.
    pub busy_since: Option<DateTime<Utc>>,
}

/// Agent state transitions; `busy_since` is stamped through `clock`.
fn agent_table(clock: Arc<dyn Clock>) -> Arc<TransitionTable<AgentState, AgentActivity>> {
    TransitionTable::<AgentState, AgentActivity>::new(AgentState::Idle)
        .allow(AgentState::Idle, AgentState::Running)
        .allow(AgentState::Running, AgentState::Idle)
        .allow(AgentState::Running, AgentState::Error)
        .allow(AgentState::Error, AgentState::Running)
        .allow(AgentState::Error, AgentState::Idle)
        .on_enter(AgentState::Running, move |_, activity| {
            activity.invocations += 1;
            activity.busy_since = Some(clock.now());
        })
        .on_exit(AgentState::Running, |_, activity| activity.busy_since = None)
        .on_enter(AgentState::Error, |_, activity| activity.failures += 1)
        .into()
}

struct TrackedAgent {
    machine: StateMachine<AgentState, AgentActivity>,
    activity: AgentActivity,
}

/// Lifecycle tracker for the agents taking part in one coordination.
pub struct AgentLifecycle {
    table: Arc<TransitionTable<AgentState, AgentActivity>>,
    agents: RwLock<HashMap<String, TrackedAgent>>,
}

impl fmt::Debug for AgentLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentLifecycle")
            .field("agent_count", &self.agents.try_read().map(|a| a.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl AgentLifecycle {
    /// Creates an empty tracker that reads time through `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { table: agent_table(clock), agents: RwLock::new(HashMap::new()) }
    }

    /// Gets the current state of an agent, `Idle` if it is not tracked.
    pub async fn get_state(&self, agent_id: &str) -> AgentState {
        self.agents.read().await.get(agent_id).map_or(AgentState::Idle, |a| a.machine.state())
    }

    /// Counters for an agent, if it has been tracked.
    pub async fn activity(&self, agent_id: &str) -> Option<AgentActivity> {
        self.agents.read().await.get(agent_id).map(|a| a.activity.clone())
    }

    /// Sets the state of an agent.
    ///
    /// # Arguments
    /// * `agent_id` - The agent ID
    /// * `new_state` - The new state
    ///
    /// # Returns
    /// The previous state if the transition is valid.
    pub async fn set_state(
        &self,
        agent_id: &str,
        new_state: AgentState,
    ) -> Result<AgentState, TransitionError<AgentState>> {
        let mut agents = self.agents.write().await;
        let agent = agents.entry(agent_id.to_string()).or_insert_with(|| TrackedAgent {
            machine: StateMachine::new(Arc::clone(&self.table)),
            activity: AgentActivity::default(),
        });

        agent.machine.transition(new_state, &mut agent.activity).inspect_err(|e| {
            error!(agent_id = %agent_id, error = %e, "Invalid agent state transition");
        })
    }

    /// Marks an agent as running.
    pub async fn start(&self, agent_id: &str) -> Result<(), TransitionError<AgentState>> {
        self.set_state(agent_id, AgentState::Running).await.map(|_| ())
    }

    /// Marks an agent's invocation as finished, successfully or not.
    pub async fn finish(
        &self,
        agent_id: &str,
        succeeded: bool,
    ) -> Result<(), TransitionError<AgentState>> {
        let next = if succeeded { AgentState::Idle } else { AgentState::Error };
        self.set_state(agent_id, next).await.map(|_| ())
    }

    /// States of every tracked agent, keyed by agent ID.
    pub async fn snapshot(&self) -> BTreeMap<String, AgentState> {
        self.agents
            .read()
            .await
            .iter()
            .map(|(id, agent)| (id.clone(), agent.machine.state()))
            .collect()
    }
}
