//! Run status machine: `idle → running ⇄ paused_waiting_user → {done | failed}`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    PausedWaitingUser,
    Done,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed)
    }

    /// Whether `self → next` is a legal transition.
    ///
    /// A terminal run may be restarted, which re-enters `running`.
    pub fn can_transition(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (*self, next),
            (Idle, Running)
                | (Running, PausedWaitingUser)
                | (PausedWaitingUser, Running)
                | (Running | PausedWaitingUser, Done | Failed)
                | (Done | Failed, Running)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::PausedWaitingUser => "paused_waiting_user",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
