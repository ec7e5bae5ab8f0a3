use serde::{Deserialize, Serialize};
use strum::Display;

/// Worker lifecycle.
///
/// `Spawning -> Running -> (WaitingConfirmation <-> Running) -> terminal`,
/// where every non-terminal state may end in `Completed`, `Failed`,
/// `TimedOut` or `Crashed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    Running,
    WaitingConfirmation,
    Completed,
    Failed,
    TimedOut,
    Crashed,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Crashed
        )
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Spawning, Self::Running)
            | (Self::Running, Self::WaitingConfirmation)
            | (Self::WaitingConfirmation, Self::Running) => true,
            (from, to) => !from.is_terminal() && to.is_terminal(),
        }
    }
}
