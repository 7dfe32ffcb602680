//! Generic finite state machine.
//!
//! A [`TransitionTable`] declares the allowed transitions between states of
//! type `S`, optional guards evaluated against a context `C`, and entry/exit
//! actions that may mutate that context. A [`StateMachine`] tracks the current
//! state of one instance against a shared table.
//!
//! Workflow runs and agent lifecycles are both driven through this type.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

/// Guard evaluated against the context before a transition is taken.
pub type Guard<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;

/// Action run when a state is entered or exited.
pub type Action<S, C> = Arc<dyn Fn(S, &mut C) + Send + Sync>;

/// Errors raised when a transition is refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError<S: fmt::Display + fmt::Debug> {
    /// No transition from `from` to `to` is declared.
    #[error("invalid transition from {from} to {to}")]
    Invalid {
        /// Current state.
        from: S,
        /// Requested state.
        to: S,
    },

    /// The transition exists but its guard rejected the context.
    #[error("guard rejected transition from {from} to {to}")]
    GuardRejected {
        /// Current state.
        from: S,
        /// Requested state.
        to: S,
    },

    /// The machine is in a terminal state.
    #[error("state {state} is terminal")]
    Terminal {
        /// Terminal state the machine is in.
        state: S,
    },
}

struct Transition<S, C> {
    from: S,
    to: S,
    guard: Option<Guard<C>>,
}

/// Declarative description of a state machine.
pub struct TransitionTable<S, C> {
    initial: S,
    transitions: Vec<Transition<S, C>>,
    terminal: HashSet<S>,
    on_enter: HashMap<S, Vec<Action<S, C>>>,
    on_exit: HashMap<S, Vec<Action<S, C>>>,
}

impl<S: fmt::Debug, C> fmt::Debug for TransitionTable<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionTable")
            .field("initial", &self.initial)
            .field("transitions", &self.transitions.len())
            .field("terminal", &self.terminal)
            .finish_non_exhaustive()
    }
}

impl<S, C> TransitionTable<S, C>
where
    S: Copy + Eq + Hash + fmt::Debug + fmt::Display,
{
    /// Creates a table whose machines start in `initial`.
    #[must_use]
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            transitions: Vec::new(),
            terminal: HashSet::new(),
            on_enter: HashMap::new(),
            on_exit: HashMap::new(),
        }
    }

    /// Allows `from → to` unconditionally.
    #[must_use]
    pub fn allow(mut self, from: S, to: S) -> Self {
        self.transitions.push(Transition { from, to, guard: None });
        self
    }

    /// Allows `from → to` when `guard` returns true for the context.
    #[must_use]
    pub fn allow_if(
        mut self,
        from: S,
        to: S,
        guard: impl Fn(&C) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.transitions.push(Transition { from, to, guard: Some(Arc::new(guard)) });
        self
    }

    /// Marks `state` as terminal: no transition may leave it.
    #[must_use]
    pub fn terminal(mut self, state: S) -> Self {
        self.terminal.insert(state);
        self
    }

    /// Runs `action` every time `state` is entered.
    #[must_use]
    pub fn on_enter(mut self, state: S, action: impl Fn(S, &mut C) + Send + Sync + 'static) -> Self {
        self.on_enter.entry(state).or_default().push(Arc::new(action));
        self
    }

    /// Runs `action` every time `state` is exited.
    #[must_use]
    pub fn on_exit(mut self, state: S, action: impl Fn(S, &mut C) + Send + Sync + 'static) -> Self {
        self.on_exit.entry(state).or_default().push(Arc::new(action));
        self
    }

    /// Initial state for new machines.
    pub fn initial(&self) -> S {
        self.initial
    }

    /// Returns true if `state` is terminal.
    pub fn is_terminal(&self, state: S) -> bool {
        self.terminal.contains(&state)
    }

    /// Checks whether `from → to` is allowed for `context`.
    ///
    /// # Errors
    /// Returns the reason the transition would be refused.
    pub fn check(&self, from: S, to: S, context: &C) -> Result<(), TransitionError<S>> {
        if self.is_terminal(from) {
            return Err(TransitionError::Terminal { state: from });
        }

        let mut declared = false;
        for transition in self.transitions.iter().filter(|t| t.from == from && t.to == to) {
            declared = true;
            match &transition.guard {
                None => return Ok(()),
                Some(guard) if guard(context) => return Ok(()),
                Some(_) => {}
            }
        }

        if declared {
            Err(TransitionError::GuardRejected { from, to })
        } else {
            Err(TransitionError::Invalid { from, to })
        }
    }
}

/// A state change that was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord<S> {
    /// State left.
    pub from: S,
    /// State entered.
    pub to: S,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

/// One instance of a state machine.
pub struct StateMachine<S, C> {
    table: Arc<TransitionTable<S, C>>,
    state: S,
    history: Vec<TransitionRecord<S>>,
}

impl<S: fmt::Debug, C> fmt::Debug for StateMachine<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.state)
            .field("transitions", &self.history.len())
            .finish_non_exhaustive()
    }
}

impl<S, C> StateMachine<S, C>
where
    S: Copy + Eq + Hash + fmt::Debug + fmt::Display,
{
    /// Creates a machine in the table's initial state.
    pub fn new(table: Arc<TransitionTable<S, C>>) -> Self {
        let state = table.initial();
        Self { table, state, history: Vec::new() }
    }

    /// Creates a machine already in `state`, without running entry actions.
    ///
    /// Used when rebuilding an instance from persisted state.
    pub fn restore(table: Arc<TransitionTable<S, C>>, state: S) -> Self {
        Self { table, state, history: Vec::new() }
    }

    /// Current state.
    pub fn state(&self) -> S {
        self.state
    }

    /// Returns true if the current state is terminal.
    pub fn is_terminal(&self) -> bool {
        self.table.is_terminal(self.state)
    }

    /// Transitions taken by this instance, oldest first.
    pub fn history(&self) -> &[TransitionRecord<S>] {
        &self.history
    }

    /// Returns true if `to` is reachable from the current state for `context`.
    pub fn can_transition(&self, to: S, context: &C) -> bool {
        self.table.check(self.state, to, context).is_ok()
    }

    /// Moves to `to`, running exit actions for the current state and entry
    /// actions for the new one.
    ///
    /// Returns the previous state.
    ///
    /// # Errors
    /// Returns a `TransitionError` if the transition is not allowed; the
    /// machine and context are left untouched.
    pub fn transition(&mut self, to: S, context: &mut C) -> Result<S, TransitionError<S>> {
        let from = self.state;
        self.table.check(from, to, context)?;

        if let Some(actions) = self.table.on_exit.get(&from) {
            for action in actions {
                action(from, context);
            }
        }
        self.state = to;
        if let Some(actions) = self.table.on_enter.get(&to) {
            for action in actions {
                action(to, context);
            }
        }

        debug!(from = %from, to = %to, "State transition");
        self.history.push(TransitionRecord { from, to, at: Utc::now() });
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Door {
        Closed,
        Open,
        Locked,
        Broken,
    }

    impl fmt::Display for Door {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    #[derive(Default)]
    struct Log {
        has_key: bool,
        events: Vec<String>,
    }

    fn table() -> Arc<TransitionTable<Door, Log>> {
        Arc::new(
            TransitionTable::<Door, Log>::new(Door::Closed)
                .allow(Door::Closed, Door::Open)
                .allow(Door::Open, Door::Closed)
                .allow(Door::Closed, Door::Locked)
                .allow_if(Door::Locked, Door::Closed, |log: &Log| log.has_key)
                .allow(Door::Closed, Door::Broken)
                .terminal(Door::Broken)
                .on_enter(Door::Open, |s, log: &mut Log| log.events.push(format!("enter {}", s)))
                .on_exit(Door::Open, |s, log: &mut Log| log.events.push(format!("exit {}", s))),
        )
    }

    #[test]
    fn test_transitions_run_actions_in_order() {
        let mut machine = StateMachine::new(table());
        let mut log = Log::default();

        assert_eq!(machine.transition(Door::Open, &mut log), Ok(Door::Closed));
        assert_eq!(machine.transition(Door::Closed, &mut log), Ok(Door::Open));
        assert_eq!(log.events, vec!["enter Open", "exit Open"]);
        assert_eq!(machine.history().len(), 2);
    }

    #[test]
    fn test_undeclared_transition_rejected() {
        let mut machine = StateMachine::new(table());
        let mut log = Log::default();
        machine.transition(Door::Open, &mut log).unwrap();

        let err = machine.transition(Door::Locked, &mut log).unwrap_err();
        assert_eq!(err, TransitionError::Invalid { from: Door::Open, to: Door::Locked });
        assert_eq!(machine.state(), Door::Open);
    }

    #[test]
    fn test_guard_controls_transition() {
        let mut machine = StateMachine::new(table());
        let mut log = Log::default();
        machine.transition(Door::Locked, &mut log).unwrap();

        assert!(matches!(
            machine.transition(Door::Closed, &mut log),
            Err(TransitionError::GuardRejected { .. })
        ));
        log.has_key = true;
        assert!(machine.can_transition(Door::Closed, &log));
        assert!(machine.transition(Door::Closed, &mut log).is_ok());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut machine = StateMachine::restore(table(), Door::Broken);
        let mut log = Log::default();
        assert!(machine.is_terminal());
        assert_eq!(
            machine.transition(Door::Closed, &mut log),
            Err(TransitionError::Terminal { state: Door::Broken })
        );
    }
}
