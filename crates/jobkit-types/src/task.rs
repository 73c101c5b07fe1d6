//! Task state machine, record, and lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a remote task as reported by the platform.
///
/// Closed enumeration: any wire value outside this set is a protocol
/// violation and must be rejected, never silently accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Success,
    SuccessHolding,
    Failed,
    Terminated,
}

impl TaskState {
    /// Parse a platform wire string; `None` for anything outside the enumeration.
    pub fn from_wire(s: &str) -> Option<TaskState> {
        match s {
            "Pending" => Some(TaskState::Pending),
            "Running" => Some(TaskState::Running),
            "Success" => Some(TaskState::Success),
            "SuccessHolding" => Some(TaskState::SuccessHolding),
            "Failed" => Some(TaskState::Failed),
            "Terminated" => Some(TaskState::Terminated),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "Pending",
            TaskState::Running => "Running",
            TaskState::Success => "Success",
            TaskState::SuccessHolding => "SuccessHolding",
            TaskState::Failed => "Failed",
            TaskState::Terminated => "Terminated",
        }
    }

    /// True for states from which no further transition occurs.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::SuccessHolding | TaskState::Failed | TaskState::Terminated
        )
    }

    /// Whether observing `next` after `self` is a legal move in the
    /// transition graph. Observing the same state again is a no-op and
    /// always legal; leaving a terminal state never is.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        if self == next {
            return true;
        }
        match self {
            TaskState::Pending => true,
            TaskState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle points at which a notification may be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskEvent {
    Submitted,
    Terminated,
}

/// Local mirror of one remote task's identity and last-known state.
///
/// `state` and `last_observed_at` are written exclusively by the task's
/// single monitor loop; everything else is fixed at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    pub state: TaskState,
    pub submitted_at: DateTime<Utc>,
    pub last_observed_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: String, name: String, state: TaskState, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name,
            state,
            submitted_at,
            last_observed_at: submitted_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a freshly observed state. Rejects moves outside the transition
    /// graph; a repeat observation of the current state only refreshes
    /// `last_observed_at`.
    pub fn observe(
        &mut self,
        state: TaskState,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(state) {
            return Err(InvalidTransition {
                from: self.state,
                to: state,
            });
        }
        self.state = state;
        if at > self.last_observed_at {
            self.last_observed_at = at;
        }
        Ok(())
    }
}

/// Observed state transition outside the task graph (e.g. `Running` back to
/// `Pending`, or anything leaving a terminal state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal task state transition `{from}` -> `{to}`")]
pub struct InvalidTransition {
    pub from: TaskState,
    pub to: TaskState,
}
