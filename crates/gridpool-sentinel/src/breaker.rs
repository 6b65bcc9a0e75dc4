//! Per-endpoint circuit breaker.
//!
//! State machine: **Closed** (calls pass, qualifying failures counted) →
//! **Tripped** once consecutive failures reach the threshold (calls
//! short-circuit) → after the retry interval elapses exactly one **trial**
//! call is admitted; its success resets the breaker, its failure re-trips
//! and restarts the interval.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors surfaced by the breaker to its callers.
#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("circuit breaker '{name}' is tripped, retry in {retry_in:?}")]
    Tripped { name: String, retry_in: Duration },
}

/// Decides whether a given failure qualifies as trip-worthy.
///
/// Connection failures, timeouts, and gateway-class responses should trip;
/// ordinary application errors (a script failing on its own terms) should
/// not affect breaker state.
pub trait TripReasonAuthority<E>: Send + Sync {
    fn is_trip_worthy(&self, error: &E) -> bool;
}

/// Blanket impl so a plain closure can serve as an authority.
impl<E, F> TripReasonAuthority<E> for F
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn is_trip_worthy(&self, error: &E) -> bool {
        self(error)
    }
}

/// Breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive qualifying failures tolerated before tripping.
    pub failures_allowed_before_trip: u32,
    /// Cooldown before a tripped breaker admits a trial call.
    pub retry_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failures_allowed_before_trip: 3,
            retry_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    /// When the breaker tripped. `None` means closed.
    tripped_since: Option<Instant>,
    consecutive_failures: u32,
}

/// A named circuit breaker guarding one logical endpoint.
///
/// Lives for the lifetime of the owning client; all state transitions are
/// atomic with respect to concurrent reporters.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                tripped_since: None,
                consecutive_failures: 0,
            }),
        }
    }

    /// The breaker's endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gate a call. `Ok` means proceed (closed, or this caller won the
    /// trial slot); `Err` means short-circuit without touching the endpoint.
    ///
    /// When the retry interval has elapsed the trial slot is claimed by
    /// re-arming `tripped_since`, so concurrent callers cannot obtain a
    /// second trial before the first reports its outcome.
    pub fn check(&self) -> Result<(), SentinelError> {
        let mut state = self.state.lock().expect("breaker lock");

        let Some(tripped_since) = state.tripped_since else {
            return Ok(());
        };

        let elapsed = tripped_since.elapsed();
        if elapsed < self.config.retry_interval {
            return Err(SentinelError::Tripped {
                name: self.name.clone(),
                retry_in: self.config.retry_interval - elapsed,
            });
        }

        debug!(breaker = %self.name, "retry interval elapsed, admitting trial call");
        state.tripped_since = Some(Instant::now());
        Ok(())
    }

    /// Report a successful call: closes the breaker and resets the counter.
    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock");
        if state.tripped_since.is_some() {
            debug!(breaker = %self.name, "trial call succeeded, breaker reset");
        }
        state.tripped_since = None;
        state.consecutive_failures = 0;
    }

    /// Report a qualifying failure: counts toward the threshold, or re-trips
    /// immediately if the breaker was already tripped.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock");
        state.consecutive_failures += 1;

        if state.tripped_since.is_some() {
            // Failed trial: restart the interval.
            state.tripped_since = Some(Instant::now());
            debug!(breaker = %self.name, "trial call failed, breaker re-tripped");
            return;
        }

        if state.consecutive_failures >= self.config.failures_allowed_before_trip {
            state.tripped_since = Some(Instant::now());
            warn!(
                breaker = %self.name,
                failures = state.consecutive_failures,
                "circuit breaker tripped"
            );
        }
    }

    /// Whether the breaker is currently tripped.
    pub fn is_tripped(&self) -> bool {
        let state = self.state.lock().expect("breaker lock");
        state.tripped_since.is_some()
    }

    /// Current consecutive-failure count.
    pub fn consecutive_failures(&self) -> u32 {
        let state = self.state.lock().expect("breaker lock");
        state.consecutive_failures
    }
}
