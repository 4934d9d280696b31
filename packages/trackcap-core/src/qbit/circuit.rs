//! Circuit breaker protecting the qBittorrent API.
//!
//! Transport failures (timeouts, 5xx, network errors) increment a
//! counter; once the threshold is reached the circuit opens and calls
//! fail fast until the cooldown elapses. One half-open probe is then
//! allowed: success closes the circuit, failure re-opens it.
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

const FAILURE_THRESHOLD: u32 = 5;
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// The externally visible breaker state.
#[derive(Serialize, PartialEq, Eq, Debug, Clone, Copy, derive_more::Display)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    #[display("closed")]
    Closed,
    #[display("open")]
    Open,
    #[display("half-open")]
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD, RECOVERY_TIMEOUT)
    }
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            failure_threshold,
            recovery_timeout,
        }
    }

    /// Whether a call may proceed. Moves an open circuit to half-open
    /// once the cooldown has elapsed, admitting a single probe.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock is not poisoned");

        match inner.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_some_and(|opened_at| opened_at.elapsed() >= self.recovery_timeout);

                if cooled_down {
                    inner.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock is not poisoned");

        if inner.state == State::HalfOpen {
            tracing::info!("qBittorrent circuit breaker closed after successful probe");
        }

        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock is not poisoned");

        inner.consecutive_failures += 1;

        let should_open = inner.state == State::HalfOpen || inner.consecutive_failures >= self.failure_threshold;
        if should_open && inner.state != State::Open {
            tracing::warn!(
                failures = inner.consecutive_failures,
                cooldown_secs = self.recovery_timeout.as_secs(),
                "qBittorrent circuit breaker opened"
            );
            inner.state = State::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.inner.lock().expect("breaker lock is not poisoned").state
    }
}
