//! Per-endpoint circuit breaker with atomic state transitions
//!
//! `Closed -> Open` on `failure_threshold` consecutive failures;
//! `Open -> HalfOpen` after the timeout, admitting exactly one probe;
//! `HalfOpen -> Closed` after `success_threshold` successes, back to `Open`
//! on the first failure.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use super::config::CircuitBreakerConfig;
use crate::time_provider::TimeProvider;

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Traffic flows normally
    Closed,
    /// Traffic blocked until the timeout elapses
    Open,
    /// One probe admitted; outcome decides the next state
    HalfOpen,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Atomic circuit breaker
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    probe_in_flight: AtomicBool,
    opened_at_millis: AtomicU64,
    config: CircuitBreakerConfig,
    time: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field(
                "consecutive_failures",
                &self.consecutive_failures.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker
    #[must_use]
    pub fn new(config: CircuitBreakerConfig, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            probe_in_flight: AtomicBool::new(false),
            opened_at_millis: AtomicU64::new(0),
            config,
            time,
        }
    }

    /// Current state, transitioning `Open -> HalfOpen` when the timeout
    /// has elapsed
    #[must_use]
    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::SeqCst) {
            OPEN => {
                let opened = self.opened_at_millis.load(Ordering::SeqCst);
                let elapsed = self.time.epoch_millis().saturating_sub(opened);
                if elapsed >= u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX) {
                    // Only one caller wins the transition.
                    if self
                        .state
                        .compare_exchange(OPEN, HALF_OPEN, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        self.half_open_successes.store(0, Ordering::SeqCst);
                        self.probe_in_flight.store(false, Ordering::SeqCst);
                    }
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
            HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// Whether a call may proceed; in half-open, admits exactly one probe
    #[must_use]
    pub fn try_admit(&self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => !self.probe_in_flight.swap(true, Ordering::SeqCst),
        }
    }

    /// Records a successful call
    pub fn record_success(&self) {
        match self.state() {
            BreakerState::HalfOpen => {
                self.probe_in_flight.store(false, Ordering::SeqCst);
                let successes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    self.state.store(CLOSED, Ordering::SeqCst);
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                }
            }
            _ => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
        }
    }

    /// Records a failed call
    pub fn record_failure(&self) {
        match self.state() {
            BreakerState::HalfOpen => {
                self.probe_in_flight.store(false, Ordering::SeqCst);
                self.trip();
            }
            BreakerState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.trip();
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Whether the breaker currently blocks traffic
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    fn trip(&self) {
        self.opened_at_millis
            .store(self.time.epoch_millis(), Ordering::SeqCst);
        self.state.store(OPEN, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::MockTimeProvider;
    use std::time::Duration;

    fn breaker(clock: Arc<MockTimeProvider>) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                timeout: Duration::from_secs(10),
            },
            clock,
        )
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let clock = Arc::new(MockTimeProvider::new());
        let cb = breaker(clock);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.try_admit());
    }

    #[test]
    fn success_resets_the_failure_run() {
        let clock = Arc::new(MockTimeProvider::new());
        let cb = breaker(clock);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let clock = Arc::new(MockTimeProvider::new());
        let cb = breaker(Arc::clone(&clock));
        for _ in 0..3 {
            cb.record_failure();
        }
        clock.advance(Duration::from_secs(11));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.try_admit());
        assert!(!cb.try_admit());
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let clock = Arc::new(MockTimeProvider::new());
        let cb = breaker(Arc::clone(&clock));
        for _ in 0..3 {
            cb.record_failure();
        }
        clock.advance(Duration::from_secs(11));
        assert!(cb.try_admit());
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.try_admit());
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let clock = Arc::new(MockTimeProvider::new());
        let cb = breaker(Arc::clone(&clock));
        for _ in 0..3 {
            cb.record_failure();
        }
        clock.advance(Duration::from_secs(11));
        assert!(cb.try_admit());
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }
}
