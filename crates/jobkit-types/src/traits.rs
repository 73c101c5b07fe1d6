//! Trait seams between the monitor and its collaborators.

use crate::{TaskEvent, TaskRecord, TaskState};
use async_trait::async_trait;

/// Failure while reading a task's status from the platform.
///
/// The split drives the monitor's retry decision: `Transient` is retried
/// under the backoff budget, `Permanent` fails the wait immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("transient status failure: {0}")]
    Transient(String),
    #[error("permanent status failure: {0}")]
    Permanent(String),
}

/// Single-call status read against the platform. Stateless; one probe may be
/// shared across many concurrently monitored tasks.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn get_status(&self, task_id: &str) -> Result<TaskState, ProbeError>;
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification auth failed: {0}")]
    Auth(String),
    #[error("notification send failed: {0}")]
    Send(String),
}

/// Fire-and-forget lifecycle message dispatch.
///
/// Callers wrap every `notify` in an isolation boundary: errors are logged
/// and swallowed, never retried, and never allowed to touch the task record.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: TaskEvent, record: &TaskRecord) -> Result<(), NotifyError>;
}

/// Malformed submission parameters, raised before any remote call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("priority must be one of 2, 4, 6, got {0}")]
    Priority(u8),
    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },
    #[error("resource buffers must be non-negative")]
    NegativeBuffer,
    #[error("mount sub path `{0}` must start with `/`")]
    MountPath(String),
}
