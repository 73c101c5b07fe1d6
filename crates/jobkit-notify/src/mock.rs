//! Recording notifier for tests: captures events, optionally fails.

use async_trait::async_trait;
use jobkit_types::{Notifier, NotifyError, TaskEvent, TaskRecord};
use std::sync::Mutex;

/// Notifier that records every dispatch. With `failing()` it still records
/// the attempt and then reports an error, for exercising the isolation
/// boundary around notification calls.
pub struct RecordingNotifier {
    fail: bool,
    events: Mutex<Vec<(TaskEvent, TaskRecord)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            fail: false,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<(TaskEvent, TaskRecord)> {
        self.events.lock().unwrap().clone()
    }
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: TaskEvent, record: &TaskRecord) -> Result<(), NotifyError> {
        self.events.lock().unwrap().push((event, record.clone()));
        if self.fail {
            return Err(NotifyError::Send("forced failure".to_string()));
        }
        Ok(())
    }
}
