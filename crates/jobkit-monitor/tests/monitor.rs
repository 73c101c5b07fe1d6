//! Integration tests for the task monitor: waiter contract, retry budget,
//! timeout behavior, notification isolation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use jobkit_monitor::{MonitorConfig, MonitorError, TaskMonitor};
use jobkit_notify::RecordingNotifier;
use jobkit_types::{Notifier, ProbeError, StatusProbe, TaskEvent, TaskRecord, TaskState};

enum Step {
    State(TaskState),
    Transient,
    Permanent,
}

/// Probe that plays back a fixed response script; once exhausted it keeps
/// reporting `Running`. Counts every call.
struct ScriptedProbe {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusProbe for ScriptedProbe {
    async fn get_status(&self, _task_id: &str) -> Result<TaskState, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.steps.lock().unwrap().pop_front() {
            Some(Step::State(state)) => Ok(state),
            Some(Step::Transient) => Err(ProbeError::Transient("connection reset".to_string())),
            Some(Step::Permanent) => Err(ProbeError::Permanent("task not found".to_string())),
            None => Ok(TaskState::Running),
        }
    }
}

fn pending_record() -> TaskRecord {
    TaskRecord::new("t-123".into(), "train-demo".into(), TaskState::Pending, Utc::now())
}

fn fast_config() -> MonitorConfig {
    MonitorConfig {
        interval: Duration::from_millis(10),
        jitter: Duration::ZERO,
        backoff_base: Duration::from_millis(5),
        max_backoff: Duration::from_millis(40),
        max_consecutive_failures: 3,
    }
}

#[tokio::test]
async fn resolves_after_exact_probe_count() {
    let probe = ScriptedProbe::new(vec![
        Step::State(TaskState::Running),
        Step::State(TaskState::Running),
        Step::State(TaskState::Running),
        Step::State(TaskState::Success),
    ]);
    let record = pending_record();
    let submitted_at = record.submitted_at;
    let monitor = TaskMonitor::spawn(record, probe.clone(), None, fast_config());

    let finished = monitor.finished().await.unwrap();
    assert_eq!(finished.state, TaskState::Success);
    assert_eq!(finished.id, "t-123");
    assert_eq!(finished.name, "train-demo");
    assert!(finished.last_observed_at >= submitted_at);
    assert_eq!(probe.calls(), 4);
}

#[tokio::test]
async fn terminal_wait_is_idempotent_with_no_extra_probes() {
    let probe = ScriptedProbe::new(vec![Step::State(TaskState::Success)]);
    let monitor = TaskMonitor::spawn(pending_record(), probe.clone(), None, fast_config());

    let first = monitor.finished().await.unwrap();
    let calls_after_first = probe.calls();
    assert_eq!(calls_after_first, 1);

    let second = monitor.finished().await.unwrap();
    assert_eq!(second.state, first.state);
    assert_eq!(second.last_observed_at, first.last_observed_at);
    assert_eq!(probe.calls(), calls_after_first);
    assert_eq!(monitor.snapshot().state, TaskState::Success);
}

#[tokio::test]
async fn concurrent_waiters_share_one_poll_loop() {
    let probe = ScriptedProbe::new(vec![
        Step::State(TaskState::Running),
        Step::State(TaskState::Running),
        Step::State(TaskState::Failed),
    ]);
    let monitor = TaskMonitor::spawn(pending_record(), probe.clone(), None, fast_config());

    let (a, b, c) = tokio::join!(monitor.finished(), monitor.finished(), monitor.finished());
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert_eq!(a.state, TaskState::Failed);
    assert_eq!(b.state, TaskState::Failed);
    assert_eq!(c.state, TaskState::Failed);
    assert_eq!(a.last_observed_at, b.last_observed_at);
    assert_eq!(b.last_observed_at, c.last_observed_at);
    // had each waiter started its own loop, the script would have drained faster
    assert_eq!(probe.calls(), 3);
}

#[tokio::test]
async fn transient_failures_are_absorbed_within_budget() {
    let probe = ScriptedProbe::new(vec![
        Step::Transient,
        Step::Transient,
        Step::State(TaskState::Success),
    ]);
    let monitor = TaskMonitor::spawn(pending_record(), probe.clone(), None, fast_config());

    let finished = monitor.finished().await.unwrap();
    assert_eq!(finished.state, TaskState::Success);
    assert_eq!(probe.calls(), 3);
}

#[tokio::test]
async fn failure_counter_resets_after_successful_poll() {
    // never more than two consecutive failures; max_consecutive_failures = 2
    let probe = ScriptedProbe::new(vec![
        Step::Transient,
        Step::State(TaskState::Running),
        Step::Transient,
        Step::Transient,
        Step::State(TaskState::Running),
        Step::Transient,
        Step::State(TaskState::Success),
    ]);
    let config = MonitorConfig {
        max_consecutive_failures: 2,
        ..fast_config()
    };
    let monitor = TaskMonitor::spawn(pending_record(), probe.clone(), None, config);

    let finished = monitor.finished().await.unwrap();
    assert_eq!(finished.state, TaskState::Success);
    assert_eq!(probe.calls(), 7);
}

#[tokio::test]
async fn retry_budget_exhaustion_fails_the_wait() {
    let probe = ScriptedProbe::new(vec![
        Step::Transient,
        Step::Transient,
        Step::Transient,
        Step::Transient,
    ]);
    let monitor = TaskMonitor::spawn(pending_record(), probe.clone(), None, fast_config());

    let error = monitor.finished().await.unwrap_err();
    match error {
        MonitorError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 4),
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(probe.calls(), 4);
    // the propagation error is cached exactly like a terminal record
    assert!(matches!(
        monitor.finished().await,
        Err(MonitorError::RetriesExhausted { .. })
    ));
    assert_eq!(probe.calls(), 4);
}

#[tokio::test]
async fn permanent_failure_is_never_retried() {
    let probe = ScriptedProbe::new(vec![Step::Permanent]);
    let monitor = TaskMonitor::spawn(pending_record(), probe.clone(), None, fast_config());

    let error = monitor.finished().await.unwrap_err();
    assert!(matches!(error, MonitorError::Permanent(_)));
    assert_eq!(probe.calls(), 1);
}

#[tokio::test]
async fn timed_out_wait_leaves_the_loop_running() {
    let probe = ScriptedProbe::new(vec![
        Step::State(TaskState::Running),
        Step::State(TaskState::Running),
        Step::State(TaskState::Running),
        Step::State(TaskState::Running),
        Step::State(TaskState::Success),
    ]);
    let monitor = TaskMonitor::spawn(pending_record(), probe.clone(), None, fast_config());

    let started = Instant::now();
    let timeout = Duration::from_millis(25);
    let error = monitor.finished_within(timeout).await.unwrap_err();
    assert!(matches!(error, MonitorError::Timeout(t) if t == timeout));
    assert!(started.elapsed() >= timeout);

    // the same monitor still resolves an un-timed wait later
    let finished = monitor.finished().await.unwrap();
    assert_eq!(finished.state, TaskState::Success);
    assert_eq!(probe.calls(), 5);
}

#[tokio::test]
async fn backwards_transition_is_a_protocol_violation() {
    let probe = ScriptedProbe::new(vec![
        Step::State(TaskState::Running),
        Step::State(TaskState::Pending),
    ]);
    let monitor = TaskMonitor::spawn(pending_record(), probe.clone(), None, fast_config());

    let error = monitor.finished().await.unwrap_err();
    match error {
        MonitorError::Permanent(message) => {
            assert!(message.contains("Running"), "unexpected message: {message}");
            assert!(message.contains("Pending"), "unexpected message: {message}");
        }
        other => panic!("expected Permanent, got {other:?}"),
    }
    assert_eq!(probe.calls(), 2);
    // the record keeps its last valid state
    assert_eq!(monitor.snapshot().state, TaskState::Running);
}

#[tokio::test]
async fn already_terminal_record_short_circuits() {
    let probe = ScriptedProbe::new(Vec::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let record = TaskRecord::new(
        "t-9".into(),
        "fast-fail".into(),
        TaskState::Failed,
        Utc::now(),
    );
    let monitor = TaskMonitor::spawn(
        record,
        probe.clone(),
        Some(notifier.clone() as Arc<dyn Notifier>),
        fast_config(),
    );

    let finished = monitor.finished().await.unwrap();
    assert_eq!(finished.state, TaskState::Failed);
    assert_eq!(probe.calls(), 0);

    // termination is still announced
    tokio::time::sleep(Duration::from_millis(20)).await;
    let events = notifier.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, TaskEvent::Terminated);
}

#[tokio::test]
async fn notifier_failure_never_affects_the_wait() {
    let probe = ScriptedProbe::new(vec![Step::State(TaskState::Success)]);
    let notifier = Arc::new(RecordingNotifier::failing());
    let monitor = TaskMonitor::spawn(
        pending_record(),
        probe.clone(),
        Some(notifier.clone() as Arc<dyn Notifier>),
        fast_config(),
    );

    let finished = monitor.finished().await.unwrap();
    assert_eq!(finished.state, TaskState::Success);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let events = notifier.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, TaskEvent::Terminated);
    assert_eq!(events[0].1.state, TaskState::Success);
    // the failed dispatch was not retried and the cached record is intact
    assert_eq!(monitor.snapshot().state, TaskState::Success);
    assert_eq!(probe.calls(), 1);
}

#[tokio::test]
async fn cancelling_one_waiter_detaches_only_that_waiter() {
    let probe = ScriptedProbe::new(vec![
        Step::State(TaskState::Running),
        Step::State(TaskState::Running),
        Step::State(TaskState::Success),
    ]);
    let monitor = TaskMonitor::spawn(pending_record(), probe.clone(), None, fast_config());

    let cancelled = tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.finished().await }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    cancelled.abort();
    assert!(cancelled.await.unwrap_err().is_cancelled());

    let finished = monitor.finished().await.unwrap();
    assert_eq!(finished.state, TaskState::Success);
    assert_eq!(probe.calls(), 3);
}
