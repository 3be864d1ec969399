//! Job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a per-worker job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, not yet looked at by the scheduler.
    Wait,
    /// Head of the queue, the scheduler is waiting for a free worker.
    AssignToWorker,
    /// Handed to a worker, result not yet available.
    InProgress,
    /// Finished with a result list.
    Done,
    /// The computation raised; the error sink holds the details.
    Error,
    /// Removed before it could finish.
    Canceled,
    /// Result already taken out of the job.
    DoneEmpty,
    /// Default / moved-from job.
    #[default]
    Empty,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Wait, AssignToWorker) | (Wait, Canceled) |
            (AssignToWorker, InProgress) | (AssignToWorker, Canceled) |
            (InProgress, Done) | (InProgress, Error) | (InProgress, Canceled) |
            (Done, DoneEmpty)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Error | Self::Canceled | Self::DoneEmpty
        )
    }

    /// Stable numeric code used when marshaling status tables to a host.
    pub fn code(&self) -> u8 {
        match self {
            Self::Wait => 0,
            Self::AssignToWorker => 1,
            Self::InProgress => 2,
            Self::Done => 3,
            Self::Error => 4,
            Self::Canceled => 5,
            Self::DoneEmpty => 6,
            Self::Empty => 7,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Wait => "wait",
            Self::AssignToWorker => "assign_to_worker",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Error => "error",
            Self::Canceled => "canceled",
            Self::DoneEmpty => "done_empty",
            Self::Empty => "empty",
        };
        write!(f, "{s}")
    }
}

/// Aggregate status of a broadcast job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    /// Not run on any worker yet.
    #[default]
    NoJob,
    /// Every worker finished without raising.
    Success,
    /// At least one worker raised.
    Error,
}

impl std::fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoJob => "no_job",
            Self::Success => "success",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub timestamp: DateTime<Utc>,
}
