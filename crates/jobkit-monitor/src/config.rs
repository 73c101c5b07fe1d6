//! Poll and backoff knobs for task monitors.

use rand::Rng;
use std::time::Duration;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
const MIN_INTERVAL: Duration = Duration::from_secs(5);
const MAX_INTERVAL: Duration = Duration::from_secs(300);

/// Pacing policy for one task's poll loop.
///
/// Defaults: 10 s base interval (accepted range 5 s..=300 s), up to 2 s of
/// random jitter per poll, transient-failure backoff starting at 2 s and
/// doubling up to 300 s, giving up after 5 consecutive failures.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Base sleep between successful status reads.
    pub interval: Duration,
    /// Upper bound of the uniform random extra added to each poll sleep,
    /// de-synchronizing many concurrently tracked tasks.
    pub jitter: Duration,
    /// Backoff after the first consecutive transient failure; doubles per
    /// further failure.
    pub backoff_base: Duration,
    /// Cap on the transient-failure backoff.
    pub max_backoff: Duration,
    /// Consecutive transient failures tolerated before the wait fails with
    /// a propagation error.
    pub max_consecutive_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            jitter: Duration::from_secs(2),
            backoff_base: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
            max_consecutive_failures: 5,
        }
    }
}

impl MonitorConfig {
    /// Read overrides from `JOBKIT_POLL_INTERVAL`, `JOBKIT_POLL_JITTER`,
    /// `JOBKIT_BACKOFF_BASE`, `JOBKIT_BACKOFF_MAX` (seconds) and
    /// `JOBKIT_MAX_POLL_FAILURES`; anything unset or unparseable keeps its
    /// default.
    pub fn from_env() -> Self {
        let secs = |key: &str| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
        };
        let defaults = Self::default();
        Self {
            interval: secs("JOBKIT_POLL_INTERVAL").unwrap_or(defaults.interval),
            jitter: secs("JOBKIT_POLL_JITTER").unwrap_or(defaults.jitter),
            backoff_base: secs("JOBKIT_BACKOFF_BASE").unwrap_or(defaults.backoff_base),
            max_backoff: secs("JOBKIT_BACKOFF_MAX").unwrap_or(defaults.max_backoff),
            max_consecutive_failures: std::env::var("JOBKIT_MAX_POLL_FAILURES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_consecutive_failures),
        }
        .sanitized()
    }

    /// Replace an out-of-range interval with the default, with a warning.
    pub fn sanitized(self) -> Self {
        if self.interval < MIN_INTERVAL || self.interval > MAX_INTERVAL {
            tracing::warn!(
                requested_secs = self.interval.as_secs(),
                "poll interval must be between {}s and {}s, using default {}s instead",
                MIN_INTERVAL.as_secs(),
                MAX_INTERVAL.as_secs(),
                DEFAULT_INTERVAL.as_secs()
            );
            return Self {
                interval: DEFAULT_INTERVAL,
                ..self
            };
        }
        self
    }

    /// Base interval plus a fresh jitter sample.
    pub(crate) fn poll_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        self.interval + Duration::from_millis(jitter_ms)
    }

    /// Exponential backoff for the n-th consecutive transient failure,
    /// capped at `max_backoff`.
    pub(crate) fn backoff_delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}
