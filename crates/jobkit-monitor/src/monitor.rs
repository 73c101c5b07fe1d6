//! The task monitor: one poll loop per task, any number of waiters.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobkit_types::{Notifier, ProbeError, StatusProbe, TaskEvent, TaskRecord};
use tokio::sync::watch;

use crate::MonitorConfig;

/// Why a `finished` wait failed. Never a statement about the remote task
/// itself: a task that *ran* and failed still resolves the wait with a
/// terminal record.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MonitorError {
    #[error("wait timed out after {0:?}")]
    Timeout(Duration),
    #[error("status polling gave up after {attempts} consecutive transient failures: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("permanent status failure: {0}")]
    Permanent(String),
}

/// Snapshot published by the poll loop. Waiters only ever see whole
/// observations, so state can never appear to move backwards.
#[derive(Debug, Clone)]
enum Observation {
    InFlight(TaskRecord),
    Terminal(TaskRecord),
    Fatal(TaskRecord, MonitorError),
}

impl Observation {
    fn record(&self) -> &TaskRecord {
        match self {
            Observation::InFlight(r) | Observation::Terminal(r) | Observation::Fatal(r, _) => r,
        }
    }
}

/// Handle to one task's tracking loop.
///
/// Cloning is cheap and every clone observes the same loop; the loop itself
/// stops once the task is terminal, the wait has failed fatally, or every
/// handle and waiter has been dropped.
#[derive(Debug, Clone)]
pub struct TaskMonitor {
    rx: watch::Receiver<Observation>,
}

impl TaskMonitor {
    /// Start tracking `record`. Exactly one poll loop is spawned regardless
    /// of how many waiters later attach. An already-terminal record is
    /// published as-is without a single probe call.
    pub fn spawn(
        record: TaskRecord,
        probe: Arc<dyn StatusProbe>,
        notifier: Option<Arc<dyn Notifier>>,
        config: MonitorConfig,
    ) -> Self {
        let (tx, rx) = watch::channel(Observation::InFlight(record.clone()));
        tokio::spawn(poll_loop(record, probe, notifier, config, tx));
        Self { rx }
    }

    /// The platform-assigned task id.
    pub fn id(&self) -> String {
        self.rx.borrow().record().id.clone()
    }

    /// Current last-known record.
    pub fn snapshot(&self) -> TaskRecord {
        self.rx.borrow().record().clone()
    }

    /// Suspend until the task reaches a terminal state, returning the final
    /// record. Once resolved, later calls return the cached record
    /// immediately with no further remote calls. Dropping the returned
    /// future detaches this waiter only.
    pub async fn finished(&self) -> Result<TaskRecord, MonitorError> {
        self.wait(None).await
    }

    /// Like [`finished`](Self::finished) but gives up after `timeout`. The
    /// poll loop is unaffected: a later un-timed wait can still resolve.
    pub async fn finished_within(&self, timeout: Duration) -> Result<TaskRecord, MonitorError> {
        self.wait(Some(timeout)).await
    }

    async fn wait(&self, timeout: Option<Duration>) -> Result<TaskRecord, MonitorError> {
        let mut rx = self.rx.clone();
        let resolved = async move {
            loop {
                {
                    let observation = rx.borrow_and_update();
                    match &*observation {
                        Observation::Terminal(record) => return Ok(record.clone()),
                        Observation::Fatal(_, error) => return Err(error.clone()),
                        Observation::InFlight(_) => {}
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(MonitorError::Permanent(
                        "status tracker stopped before reaching a terminal state".to_string(),
                    ));
                }
            }
        };
        match timeout {
            None => resolved.await,
            Some(limit) => tokio::time::timeout(limit, resolved)
                .await
                .unwrap_or(Err(MonitorError::Timeout(limit))),
        }
    }
}

async fn poll_loop(
    mut record: TaskRecord,
    probe: Arc<dyn StatusProbe>,
    notifier: Option<Arc<dyn Notifier>>,
    config: MonitorConfig,
    tx: watch::Sender<Observation>,
) {
    if record.is_terminal() {
        tracing::debug!(task_id = %record.id, state = %record.state, "record already terminal, skipping poll loop");
        tx.send_replace(Observation::Terminal(record.clone()));
        dispatch_notification(notifier.as_deref(), TaskEvent::Terminated, &record).await;
        return;
    }

    let mut failures: u32 = 0;
    loop {
        let delay = if failures == 0 {
            config.poll_delay()
        } else {
            config.backoff_delay(failures)
        };
        tokio::select! {
            _ = tx.closed() => {
                tracing::debug!(task_id = %record.id, "no monitor handles remain, stopping poll loop");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match probe.get_status(&record.id).await {
            Ok(state) => {
                failures = 0;
                if let Err(violation) = record.observe(state, Utc::now()) {
                    tracing::error!(task_id = %record.id, error = %violation, "status endpoint violated the task state protocol");
                    let error = MonitorError::Permanent(violation.to_string());
                    tx.send_replace(Observation::Fatal(record.clone(), error));
                    return;
                }
                if record.is_terminal() {
                    tracing::info!(task_id = %record.id, state = %record.state, "task reached terminal state");
                    tx.send_replace(Observation::Terminal(record.clone()));
                    dispatch_notification(notifier.as_deref(), TaskEvent::Terminated, &record).await;
                    return;
                }
                tracing::debug!(task_id = %record.id, state = %record.state, "task still in flight");
                tx.send_replace(Observation::InFlight(record.clone()));
            }
            Err(ProbeError::Transient(reason)) => {
                failures += 1;
                if failures > config.max_consecutive_failures {
                    tracing::error!(
                        task_id = %record.id,
                        attempts = failures,
                        "giving up on status polling, task state remains unknown"
                    );
                    let error = MonitorError::RetriesExhausted {
                        attempts: failures,
                        last: reason,
                    };
                    tx.send_replace(Observation::Fatal(record.clone(), error));
                    return;
                }
                tracing::warn!(
                    task_id = %record.id,
                    attempt = failures,
                    error = %reason,
                    "transient status failure, backing off"
                );
            }
            Err(ProbeError::Permanent(reason)) => {
                tracing::error!(task_id = %record.id, error = %reason, "permanent status failure");
                tx.send_replace(Observation::Fatal(record.clone(), MonitorError::Permanent(reason)));
                return;
            }
        }
    }
}

/// Dispatch a lifecycle notification inside the isolation boundary: errors
/// are logged and swallowed, never retried, and never touch the record.
pub async fn dispatch_notification(
    notifier: Option<&dyn Notifier>,
    event: TaskEvent,
    record: &TaskRecord,
) {
    let Some(notifier) = notifier else { return };
    if let Err(error) = notifier.notify(event, record).await {
        tracing::warn!(task_id = %record.id, ?event, %error, "notification dispatch failed");
    }
}
