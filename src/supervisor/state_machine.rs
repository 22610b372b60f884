use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Stopped => "stopped",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
        }
    }
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(State, State),
}

pub struct StateMachine {
    pub state: State,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: State::Stopped }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_transition(&self, to: State) -> bool {
        matches!(
            (self.state, to),
            (State::Stopped, State::Starting)
                | (State::Starting, State::Running)
                // spawn failed
                | (State::Starting, State::Stopped)
                | (State::Running, State::Stopping)
                // exited on its own
                | (State::Running, State::Stopped)
                | (State::Stopping, State::Stopped)
        )
    }

    pub fn transition(&mut self, to: State) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::debug!("State transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}

/// Per-instance lifecycle states. Unknown ids are `Stopped`.
#[derive(Default)]
pub struct StateTable {
    machines: Mutex<HashMap<String, StateMachine>>,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, id: &str, f: impl FnOnce(&mut StateMachine) -> R) -> R {
        let mut map = self.machines.lock().unwrap_or_else(|p| p.into_inner());
        f(map.entry(id.to_string()).or_default())
    }

    pub fn transition(&self, id: &str, to: State) -> Result<(), TransitionError> {
        self.with(id, |sm| sm.transition(to)).map_err(|e| {
            tracing::warn!("'{}': {}", id, e);
            e
        })
    }

    /// Current state reconciled with whether a process is actually alive.
    /// A server that died while `Running` folds back to `Stopped`.
    pub fn observe(&self, id: &str, process_alive: bool) -> State {
        self.with(id, |sm| {
            if sm.state == State::Running && !process_alive {
                tracing::warn!("Server '{}' is no longer running", id);
                sm.state = State::Stopped;
            }
            sm.state
        })
    }

    /// Set the state unconditionally (startup recovery, forced cleanup).
    pub fn reset(&self, id: &str, state: State) {
        self.with(id, |sm| sm.state = state);
    }

    pub fn forget(&self, id: &str) {
        self.machines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
    }
}
