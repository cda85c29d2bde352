//! Scheduler lifecycle and run state.
//!
//! This module provides state tracking for the scheduler: the lifecycle state machine,
//! the per-step [`RunState`] snapshot published to observers, and the [`RunReport`]
//! returned once a run has finished.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AcqError, ErrorKind};
use crate::experiment::coords::Coordinate;

/// Scheduler lifecycle state.
///
/// # State Machine
///
/// ```text
/// Idle ──start──> Running ──all steps written──> Completed
///                   │
///                   ├──step error──> Failed
///                   │
///                   └──cancel at boundary──> Cancelled
/// ```
///
/// Terminal states accept a new run, which re-enters `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    /// No run has been started
    Idle,
    /// A run is executing
    Running,
    /// Last run wrote every coordinate
    Completed,
    /// Last run aborted on an error
    Failed,
    /// Last run stopped on user request
    Cancelled,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "Idle"),
            SchedulerState::Running => write!(f, "Running"),
            SchedulerState::Completed => write!(f, "Completed"),
            SchedulerState::Failed => write!(f, "Failed"),
            SchedulerState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl SchedulerState {
    /// Check if the state allows starting a new run.
    pub fn can_begin(&self) -> bool {
        !matches!(self, SchedulerState::Running)
    }

    /// True for the states a run ends in.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SchedulerState::Completed | SchedulerState::Failed | SchedulerState::Cancelled
        )
    }
}

/// Progress snapshot of a running acquisition.
///
/// Written only by the scheduler task; observers receive copies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Steps written so far (1-based position of the last written step)
    pub current: u64,
    /// Total steps in the run
    pub total: u64,
    /// Free slots in the source buffer at the last check
    pub buffer_free: u64,
    /// Capacity of the source buffer
    pub buffer_total: u64,
    /// Cumulative time spent in `add_image`, in milliseconds
    pub write_time_ms: f64,
    /// Coordinate of the last written frame
    pub last_coordinate: Option<Coordinate>,
}

impl RunState {
    /// Fresh progress for a run of `total` steps.
    pub fn new(total: u64) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Fraction of steps written, in `[0, 1]`.
    pub fn fraction_done(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.current as f64 / self.total as f64
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every coordinate was written
    Completed,
    /// Stopped at a step boundary on request
    Cancelled,
    /// Aborted by a step failure
    Failed {
        /// Classification of the error
        kind: ErrorKind,
        /// Rendered error message
        message: String,
    },
}

impl RunOutcome {
    /// Failure outcome describing `err`.
    pub fn failed(err: &AcqError) -> Self {
        RunOutcome::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// The terminal scheduler state this outcome corresponds to.
    pub fn state(&self) -> SchedulerState {
        match self {
            RunOutcome::Completed => SchedulerState::Completed,
            RunOutcome::Cancelled => SchedulerState::Cancelled,
            RunOutcome::Failed { .. } => SchedulerState::Failed,
        }
    }

    /// True for [`RunOutcome::Completed`].
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
            RunOutcome::Failed { kind, message } => write!(f, "failed ({}): {}", kind, message),
        }
    }
}

/// Summary returned by a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Unique run identifier
    pub run_id: String,
    /// How the run ended
    pub outcome: RunOutcome,
    /// Frames accepted by the sink
    pub frames_written: u64,
    /// Steps in the plan
    pub total_steps: u64,
    /// Cumulative `add_image` time in milliseconds
    pub total_write_ms: f64,
    /// Wall time from `Started` to the terminal event
    pub elapsed: Duration,
}

impl RunReport {
    /// Mean time per written frame, 0 when nothing was written.
    pub fn mean_write_ms(&self) -> f64 {
        if self.frames_written == 0 {
            0.0
        } else {
            self.total_write_ms / self.frames_written as f64
        }
    }
}
