//! Circuit breaker for sub-agent fault isolation
//!
//! Stops calls to a repeatedly failing agent and self-heals after a timeout.
//! Three states:
//!
//! - **closed**: healthy, calls pass through
//! - **open**: tripped, calls are rejected
//! - **half-open**: after `reset_timeout`, exactly one probe call is allowed
//!
//! The open → half-open transition happens inline in [`CircuitBreaker::is_open`]:
//! the first query after the timeout flips the state and reports "not open"
//! so the caller dispatches the probe. The probe's outcome (via
//! `record_success` / `record_failure`) resolves the state.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    last_failure: Option<Instant>,
}

/// Snapshot of a breaker for observability surfaces.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerStatus {
    pub name: String,
    pub state: &'static str,
    pub failure_count: u32,
    pub success_count: u64,
    /// Seconds since the last recorded failure, if any.
    pub last_failure_secs_ago: Option<f64>,
}

/// Per-agent circuit breaker.
///
/// Shared between the dispatcher's call sites, so the interior is guarded by
/// a mutex; all operations are non-suspending and hold the lock only briefly.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    max_failures: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            max_failures,
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Whether calls should currently be rejected.
    ///
    /// Performs the timed open → half-open transition inline: the first call
    /// after `reset_timeout` gets `false` back and becomes the probe.
    pub fn is_open(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed > self.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    info!(agent = %self.name, "circuit breaker open -> half_open (probing)");
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Record a failure; may trip the breaker.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!(agent = %self.name, "circuit breaker half_open -> open (probe failed)");
            }
            CircuitState::Closed if inner.failure_count >= self.max_failures => {
                inner.state = CircuitState::Open;
                warn!(
                    agent = %self.name,
                    failures = inner.failure_count,
                    "circuit breaker closed -> open"
                );
            }
            _ => {}
        }
    }

    /// Record a success; resets the breaker to closed.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == CircuitState::HalfOpen {
            info!(agent = %self.name, "circuit breaker half_open -> closed (recovered)");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count += 1;
    }

    /// Current state without side effects.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Observability snapshot.
    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state.as_str(),
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_secs_ago: inner.last_failure.map(|t| t.elapsed().as_secs_f64()),
        }
    }

    #[cfg(test)]
    fn backdate_last_failure(&self, by: Duration) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.last_failure = inner.last_failure.map(|t| t - by);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test_agent", 3, Duration::from_secs(1))
    }

    #[test]
    fn test_starts_closed() {
        let b = breaker();
        assert!(!b.is_open());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_opens_after_max_failures() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        assert!(b.is_open());
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_does_not_open_below_threshold() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        assert!(!b.is_open());
    }

    #[test]
    fn test_success_resets_failures() {
        let b = breaker();
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.status().failure_count, 0);
        assert!(!b.is_open());
    }

    #[test]
    fn test_half_open_after_timeout_allows_probe() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        assert!(b.is_open());

        b.backdate_last_failure(Duration::from_secs(2));

        // First query after the timeout: transition to half-open, allow probe.
        assert!(!b.is_open());
        assert_eq!(b.state(), CircuitState::HalfOpen);

        // Further queries before resolution also report not-open.
        assert!(!b.is_open());
    }

    #[test]
    fn test_half_open_success_closes() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        b.backdate_last_failure(Duration::from_secs(2));
        b.is_open();

        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.status().failure_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let b = breaker();
        for _ in 0..3 {
            b.record_failure();
        }
        b.backdate_last_failure(Duration::from_secs(2));
        b.is_open();

        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        // Open-time was reset, so the breaker stays open again.
        assert!(b.is_open());
    }

    #[test]
    fn test_status_snapshot() {
        let b = breaker();
        let status = b.status();
        assert_eq!(status.name, "test_agent");
        assert_eq!(status.state, "closed");
        assert_eq!(status.failure_count, 0);
        assert!(status.last_failure_secs_ago.is_none());

        b.record_failure();
        assert!(b.status().last_failure_secs_ago.is_some());
    }
}
