//! Shared types and enums used across batchmerge.
//! Includes the per-batch `BatchStatus` state machine, `BatchOrigin`, and the
//! closed `RemoteState` set that external status strings are mapped onto.
use serde::{Deserialize, Serialize};

/// Lifecycle state of one batch, owned by the job tracker.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Created, never accepted by the API (or requeued after a failure)
    Pending,
    /// Accepted by the API, waiting for a terminal remote status
    Submitted,
    /// Result payload downloaded and stored
    Completed,
    /// Execution failed, retry budget remains
    Failed,
    /// Execution failed and the retry budget is spent
    TerminalFailed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::TerminalFailed)
    }

    /// Pending -> Failed is only taken when repairing an interrupted submission.
    pub fn can_transition_to(&self, to: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (*self, to),
            (Pending, Submitted)
                | (Pending, Failed)
                | (Submitted, Completed)
                | (Submitted, Failed)
                | (Submitted, TerminalFailed)
                | (Failed, Pending)
                | (Failed, Submitted)
                | (Failed, TerminalFailed)
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Pending => write!(f, "pending"),
            BatchStatus::Submitted => write!(f, "submitted"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::Failed => write!(f, "failed"),
            BatchStatus::TerminalFailed => write!(f, "terminal_failed"),
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "submitted" => Ok(Self::Submitted),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "terminal_failed" => Ok(Self::TerminalFailed),
            _ => Err(format!("Invalid batch status: {s}")),
        }
    }
}

/// Why a batch exists: created by the initial split, or appended later to
/// reprocess rows that came back missing.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOrigin {
    #[default]
    Initial,
    Rerun,
}

impl std::fmt::Display for BatchOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchOrigin::Initial => write!(f, "initial"),
            BatchOrigin::Rerun => write!(f, "rerun"),
        }
    }
}

/// Remote job status as seen through the batch API, reduced to the four
/// states the tracker acts on.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for RemoteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteState::Pending => write!(f, "pending"),
            RemoteState::Running => write!(f, "running"),
            RemoteState::Succeeded => write!(f, "succeeded"),
            RemoteState::Failed => write!(f, "failed"),
        }
    }
}
