//! Control door: shipping state control requests to the hosting
//! environment.
//!
//! Decision policies never manipulate states directly. They assemble a
//! parameter payload describing the wanted operation and push it through a
//! [`ControlDoor`], whose implementation owns the transport (a control
//! session into a container, an SSH channel to a remote host, or an
//! in-process backend registry for self-contained runs).

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use vtgrid_params::Params;

/// The state operation a door request asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateAction {
    /// Assert that every requested state is present.
    Check,
    /// Retrieve states into the calling environment.
    Get,
    /// Remove states from the calling environment.
    Unset,
}

impl StateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateAction::Check => "check",
            StateAction::Get => "get",
            StateAction::Unset => "unset",
        }
    }
}

impl std::fmt::Display for StateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by a control door call.
#[derive(Debug, Error)]
pub enum DoorError {
    /// The remote side completed but asserted a state is absent.
    #[error("state assertion failed for {0}")]
    StateMissing(String),

    /// The remote control script failed.
    #[error("state control script exited with {status}: {output}")]
    Script { status: i32, output: String },

    /// The control session itself broke down.
    #[error("control session failure: {0}")]
    Session(String),
}

/// Transport for state control requests.
#[async_trait]
pub trait ControlDoor: Send + Sync {
    /// Run one state control operation described by `params`.
    ///
    /// For [`StateAction::Check`] an absent state is reported as
    /// [`DoorError::StateMissing`], not as success.
    async fn run_state_control(&self, action: StateAction, params: &Params)
        -> Result<(), DoorError>;
}

/// In-memory door for tests: records calls and answers checks from a
/// configurable set of missing states.
#[derive(Default)]
pub struct MockDoor {
    calls: Mutex<Vec<(StateAction, Params)>>,
    missing_states: Mutex<BTreeSet<String>>,
    script_failure: Mutex<Option<String>>,
}

impl MockDoor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `state` as absent on the far side.
    pub fn mark_missing(&self, state: impl Into<String>) {
        self.missing_states.lock().unwrap().insert(state.into());
    }

    /// Treat `state` as present again.
    pub fn mark_present(&self, state: &str) {
        self.missing_states.lock().unwrap().remove(state);
    }

    /// Make every subsequent call fail as a script error.
    pub fn fail_with(&self, output: impl Into<String>) {
        *self.script_failure.lock().unwrap() = Some(output.into());
    }

    /// All recorded calls in order.
    pub fn calls(&self) -> Vec<(StateAction, Params)> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls for one action.
    pub fn calls_for(&self, action: StateAction) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(recorded, _)| *recorded == action)
            .count()
    }
}

#[async_trait]
impl ControlDoor for MockDoor {
    async fn run_state_control(
        &self,
        action: StateAction,
        params: &Params,
    ) -> Result<(), DoorError> {
        self.calls.lock().unwrap().push((action, params.clone()));
        if let Some(output) = self.script_failure.lock().unwrap().clone() {
            return Err(DoorError::Script { status: 1, output });
        }
        if action == StateAction::Check {
            let missing = self.missing_states.lock().unwrap();
            for (key, value) in params.iter() {
                if key.starts_with("check_state") && missing.contains(value) {
                    return Err(DoorError::StateMissing(value.to_owned()));
                }
            }
        }
        Ok(())
    }
}
