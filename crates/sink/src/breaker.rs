//! Explicit circuit-breaker state machine guarding admission to the sink.
//!
//! Three states, directly testable, rather than counters hidden inside the
//! retry loop: `closed` (normal), `open` (refusing batches during a
//! cool-down), `half-open` (admitting a single probe batch).

use std::time::{Duration, Instant};

/// The circuit breaker's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Admitting batches normally.
    Closed,
    /// Refusing batches until the cool-down elapses.
    Open,
    /// Cool-down elapsed; a single probe batch is admitted.
    HalfOpen,
}

impl CircuitState {
    /// Numeric state ordinal, following the 0/1/2 convention used
    /// elsewhere in this corpus for a breaker's `closed`/`open`/`half_open`
    /// states.
    pub fn as_u8(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

/// A snapshot of the breaker's state, surfaced on the status endpoint.
#[derive(Debug, Clone, Copy)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failure count since the last transition to `closed`.
    pub failure_count: u32,
    /// How long ago the breaker last transitioned state.
    pub since_last_transition: Duration,
}

/// Per-sink circuit breaker. After `trip_threshold` consecutive failures,
/// transitions `closed -> open` for `cooldown`; after cool-down, admits one
/// probe batch (`half_open`): success returns to `closed`, failure reopens
/// with a cool-down capped at `max_cooldown`.
pub struct CircuitBreaker {
    state: CircuitState,
    trip_threshold: u32,
    base_cooldown: Duration,
    max_cooldown: Duration,
    current_cooldown: Duration,
    failure_count: u32,
    last_transition: Instant,
    next_retry_allowed: Instant,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    /// Creates a new breaker: trips after `trip_threshold` consecutive
    /// failures, cooling down for `base_cooldown` (doubling on repeated
    /// trips, capped at `max_cooldown`).
    pub fn new(trip_threshold: u32, base_cooldown: Duration, max_cooldown: Duration) -> Self {
        let now = Instant::now();
        Self {
            state: CircuitState::Closed,
            trip_threshold: trip_threshold.max(1),
            base_cooldown,
            max_cooldown,
            current_cooldown: base_cooldown,
            failure_count: 0,
            last_transition: now,
            next_retry_allowed: now,
            probe_in_flight: false,
        }
    }

    /// Whether a batch may currently be admitted to the sink. Advances
    /// `open -> half_open` as a side effect once the cool-down has
    /// elapsed. In `half_open`, only a single probe is admitted at a time.
    pub fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if Instant::now() >= self.next_retry_allowed {
                    self.state = CircuitState::HalfOpen;
                    self.last_transition = Instant::now();
                    self.probe_in_flight = false;
                    tracing::info!("circuit breaker cool-down elapsed, admitting probe batch");
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records a successful batch delivery.
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                tracing::info!("circuit breaker probe succeeded, closing");
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.current_cooldown = self.base_cooldown;
                self.last_transition = Instant::now();
                self.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed batch delivery, tripping the breaker once
    /// `trip_threshold` consecutive failures have accumulated.
    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.trip_threshold {
                    self.trip();
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("circuit breaker probe failed, reopening with increased cool-down");
                self.current_cooldown = (self.current_cooldown * 2).min(self.max_cooldown);
                self.trip();
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&mut self) {
        self.state = CircuitState::Open;
        self.last_transition = Instant::now();
        self.next_retry_allowed = self.last_transition + self.current_cooldown;
        self.probe_in_flight = false;
        tracing::warn!(cooldown = ?self.current_cooldown, "circuit breaker tripped open");
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// A snapshot for the status endpoint.
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            since_last_transition: self.last_transition.elapsed(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trips_after_threshold_consecutive_failures() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_millis(10), Duration::from_secs(1));
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn refuses_requests_while_open() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(30), Duration::from_secs(60));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn admits_single_probe_after_cooldown() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(5), Duration::from_secs(1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(10));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // A second concurrent probe is refused.
        assert!(!breaker.allow_request());
    }

    #[test]
    fn probe_success_closes_and_probe_failure_reopens_with_longer_cooldown() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(5), Duration::from_secs(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(10));
        assert!(breaker.allow_request());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(10));
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.current_cooldown > breaker.base_cooldown);
    }
}
