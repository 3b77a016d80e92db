use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`super::FleetRuntime`].
///
/// ```text
/// Stopped --start--> Starting --connected--> Running --stop--> Stopping --exited--> Stopped
///                       |
///                       +--connect failed--> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ExecutionState {
    /// Whether a worker thread exists for this state.
    pub fn is_active(&self) -> bool {
        !matches!(self, ExecutionState::Stopped)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ExecutionState::Running)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionState::Stopped => write!(f, "stopped"),
            ExecutionState::Starting => write!(f, "starting"),
            ExecutionState::Running => write!(f, "running"),
            ExecutionState::Stopping => write!(f, "stopping"),
        }
    }
}
