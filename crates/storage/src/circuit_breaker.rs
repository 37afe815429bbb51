//! Circuit breaker protecting calls to a flaky dependency.
//!
//! The breaker detects sustained failures of a dependency (the revocation
//! store, typically) and stops calling it for a cooldown period, serving a
//! caller-provided fallback instead. After the cooldown one trial call is let
//! through to probe for recovery.
//!
//! # State Machine
//!
//! ```text
//! ┌────────┐  failure_threshold  ┌──────┐  retry_interval  ┌──────────┐
//! │ Closed │ ──────reached─────→ │ Open │ ────elapsed────→ │ HalfOpen │
//! └────────┘                     └──────┘ ←─probe fails─── └──────────┘
//!      ↑                                                        │
//!      └───────────────────── probe succeeds ───────────────────┘
//! ```
//!
//! The transitions live in [`BreakerFsm`], which performs no I/O and takes
//! the current time as an argument. [`CircuitBreaker`] wraps it in a mutex
//! and drives it around an async operation.

use std::{
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use thiserror::Error;

use crate::error::ConfigError;

/// Default number of consecutive failures before opening the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time the circuit stays open before a trial call is allowed.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, every call is attempted.
    Closed,
    /// Calls are short-circuited to the fallback until `until`.
    Open {
        /// When the circuit becomes eligible for a trial call.
        until: Instant,
    },
    /// One trial call decides between closing and re-opening.
    HalfOpen,
}

impl CircuitState {
    fn name(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open { .. } => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    retry_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

#[bon::bon]
impl CircuitBreakerConfig {
    /// Creates a new circuit breaker configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `failure_threshold` or `retry_interval` is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_FAILURE_THRESHOLD)] failure_threshold: u32,
        #[builder(default = DEFAULT_RETRY_INTERVAL)] retry_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "failure_threshold",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if retry_interval.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "retry_interval",
                value: "0s".into(),
            });
        }
        Ok(Self { failure_threshold, retry_interval })
    }

    /// Returns the failure threshold.
    #[must_use]
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Returns the cooldown before a trial call.
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}

/// What the breaker decided for an incoming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, attempt the call.
    Proceed,
    /// Circuit half-open, this call is the single trial.
    Probe,
    /// Circuit open (or a trial is already running), use the fallback.
    Reject,
}

impl Admission {
    /// Returns `true` unless the call must be short-circuited.
    #[must_use]
    pub fn is_allowed(self) -> bool {
        !matches!(self, Self::Reject)
    }
}

/// Pure circuit breaker state machine.
///
/// Every method takes the current time explicitly, so transitions can be
/// tested without sleeping or mocking I/O.
#[derive(Debug, Clone)]
pub struct BreakerFsm {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    probe_in_flight: bool,
    state_transitions: u64,
    fast_fail_count: u64,
}

impl BreakerFsm {
    /// Creates a closed state machine.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            probe_in_flight: false,
            state_transitions: 0,
            fast_fail_count: 0,
        }
    }

    /// Current state, without applying any time-based transition.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Current consecutive failure count.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Decides whether a call arriving at `now` may run.
    ///
    /// An open circuit whose retry interval has elapsed moves to half-open
    /// and admits exactly one trial call.
    pub fn on_request(&mut self, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Proceed,
            CircuitState::Open { until } if now >= until => {
                self.transition(CircuitState::HalfOpen);
                self.probe_in_flight = true;
                Admission::Probe
            },
            CircuitState::Open { .. } => {
                self.fast_fail_count += 1;
                Admission::Reject
            },
            CircuitState::HalfOpen if self.probe_in_flight => {
                self.fast_fail_count += 1;
                Admission::Reject
            },
            CircuitState::HalfOpen => {
                self.probe_in_flight = true;
                Admission::Probe
            },
        }
    }

    /// Records a successful call.
    pub fn on_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                self.consecutive_failures = 0;
                self.probe_in_flight = false;
                self.transition(CircuitState::Closed);
            },
            // A call admitted before the circuit opened finished late.
            CircuitState::Open { .. } => {},
        }
    }

    /// Records a failed call completing at `now`.
    pub fn on_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.transition(CircuitState::Open { until: now + self.config.retry_interval });
                }
            },
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                self.transition(CircuitState::Open { until: now + self.config.retry_interval });
            },
            CircuitState::Open { .. } => {},
        }
    }

    /// Records that an admitted call was dropped before completing.
    ///
    /// Frees the trial slot so a cancelled probe cannot wedge the circuit
    /// in half-open.
    pub fn on_abandoned(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    /// Returns to the closed state and forgets failures.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.probe_in_flight = false;
        if self.state != CircuitState::Closed {
            self.transition(CircuitState::Closed);
        }
    }

    fn transition(&mut self, next: CircuitState) {
        self.state = next;
        self.state_transitions += 1;
    }
}

/// A snapshot of circuit breaker metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    /// Current circuit state.
    pub state: CircuitState,
    /// Total number of state transitions since creation.
    pub state_transitions: u64,
    /// Total number of calls short-circuited to the fallback.
    pub fast_fail_count: u64,
    /// Current consecutive failure count.
    pub consecutive_failures: u32,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the operation was not attempted.
    #[error("circuit breaker is open")]
    Open,
    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

/// Thread-safe circuit breaker wrapping one dependency.
///
/// State is process-local and resets on restart. Critical sections never
/// span the protected operation. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    fsm: Arc<Mutex<BreakerFsm>>,
}

impl CircuitBreaker {
    /// Creates a closed breaker. `name` identifies the dependency in logs.
    #[must_use]
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self { name, fsm: Arc::new(Mutex::new(BreakerFsm::new(config))) }
    }

    /// Runs `operation`, returning `fallback()` if it fails or the circuit is open.
    ///
    /// The underlying error is logged and never propagated.
    pub async fn execute<T, E, Op, Fut, Fb>(&self, operation: Op, fallback: Fb) -> T
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
        Fb: FnOnce() -> T,
    {
        match self.call(operation).await {
            Ok(value) => value,
            Err(BreakerError::Open) => {
                tracing::debug!(breaker = self.name, "circuit open, serving fallback");
                fallback()
            },
            Err(BreakerError::Inner(err)) => {
                tracing::warn!(
                    breaker = self.name,
                    error = %err,
                    "protected call failed, serving fallback"
                );
                fallback()
            },
        }
    }

    /// Runs `operation` through the breaker, propagating its error.
    ///
    /// Use this for calls whose failure must not be masked by a fallback.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::Open`] without running `operation` while the
    /// circuit is open, or [`BreakerError::Inner`] if `operation` fails.
    pub async fn call<T, E, Op, Fut>(&self, operation: Op) -> Result<T, BreakerError<E>>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.admit().is_allowed() {
            return Err(BreakerError::Open);
        }

        let mut guard = InFlight { breaker: self, completed: false };
        let result = operation().await;
        guard.completed = true;

        match result {
            Ok(value) => {
                self.update(BreakerFsm::on_success);
                Ok(value)
            },
            Err(err) => {
                let now = Instant::now();
                self.update(|fsm| fsm.on_failure(now));
                Err(BreakerError::Inner(err))
            },
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.fsm.lock().state()
    }

    /// Forces the breaker back to closed.
    pub fn reset(&self) {
        self.update(BreakerFsm::reset);
    }

    /// Returns a snapshot of the breaker metrics.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let fsm = self.fsm.lock();
        CircuitBreakerMetrics {
            state: fsm.state,
            state_transitions: fsm.state_transitions,
            fast_fail_count: fsm.fast_fail_count,
            consecutive_failures: fsm.consecutive_failures,
        }
    }

    fn admit(&self) -> Admission {
        let now = Instant::now();
        let mut admission = Admission::Reject;
        self.update(|fsm| admission = fsm.on_request(now));
        admission
    }

    /// Applies `f` under the lock and logs any state change.
    fn update(&self, f: impl FnOnce(&mut BreakerFsm)) {
        let mut fsm = self.fsm.lock();
        let before = fsm.state;
        f(&mut *fsm);
        let after = fsm.state;
        let failures = fsm.consecutive_failures;
        drop(fsm);

        if before.name() == after.name() {
            return;
        }
        match after {
            CircuitState::Open { .. } => tracing::warn!(
                breaker = self.name,
                previous_state = before.name(),
                new_state = after.name(),
                consecutive_failures = failures,
                "circuit breaker opened",
            ),
            _ => tracing::info!(
                breaker = self.name,
                previous_state = before.name(),
                new_state = after.name(),
                "circuit breaker state changed",
            ),
        }
    }
}

/// Releases a trial slot if the protected future is dropped mid-flight.
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    completed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.breaker.update(BreakerFsm::on_abandoned);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use crate::StorageError;

    fn config(failure_threshold: u32, retry_interval: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig { failure_threshold, retry_interval }
    }

    #[test]
    fn fsm_starts_closed() {
        let mut fsm = BreakerFsm::new(CircuitBreakerConfig::default());
        assert_eq!(fsm.state(), CircuitState::Closed);
        assert_eq!(fsm.on_request(Instant::now()), Admission::Proceed);
    }

    #[test]
    fn fsm_opens_at_threshold() {
        let now = Instant::now();
        let mut fsm = BreakerFsm::new(config(3, Duration::from_secs(30)));

        fsm.on_failure(now);
        fsm.on_failure(now);
        assert_eq!(fsm.state(), CircuitState::Closed);

        fsm.on_failure(now);
        assert_eq!(fsm.state(), CircuitState::Open { until: now + Duration::from_secs(30) });
        assert_eq!(fsm.on_request(now + Duration::from_secs(29)), Admission::Reject);
    }

    #[test]
    fn fsm_success_resets_failure_count() {
        let now = Instant::now();
        let mut fsm = BreakerFsm::new(config(3, Duration::from_secs(30)));

        fsm.on_failure(now);
        fsm.on_failure(now);
        fsm.on_success();
        fsm.on_failure(now);
        fsm.on_failure(now);

        assert_eq!(fsm.state(), CircuitState::Closed);
        assert_eq!(fsm.consecutive_failures(), 2);
    }

    #[test]
    fn fsm_half_open_admits_single_probe() {
        let now = Instant::now();
        let mut fsm = BreakerFsm::new(config(1, Duration::from_secs(30)));
        fsm.on_failure(now);

        let later = now + Duration::from_secs(30);
        assert_eq!(fsm.on_request(later), Admission::Probe);
        assert_eq!(fsm.state(), CircuitState::HalfOpen);
        assert_eq!(fsm.on_request(later), Admission::Reject);
    }

    #[test]
    fn fsm_probe_success_closes() {
        let now = Instant::now();
        let mut fsm = BreakerFsm::new(config(1, Duration::from_secs(30)));
        fsm.on_failure(now);
        fsm.on_request(now + Duration::from_secs(31));

        fsm.on_success();
        assert_eq!(fsm.state(), CircuitState::Closed);
        assert_eq!(fsm.consecutive_failures(), 0);
    }

    #[test]
    fn fsm_probe_failure_reopens_with_fresh_timer() {
        let now = Instant::now();
        let mut fsm = BreakerFsm::new(config(1, Duration::from_secs(30)));
        fsm.on_failure(now);

        let probe_at = now + Duration::from_secs(45);
        fsm.on_request(probe_at);
        fsm.on_failure(probe_at);

        assert_eq!(fsm.state(), CircuitState::Open { until: probe_at + Duration::from_secs(30) });
        assert_eq!(fsm.on_request(probe_at + Duration::from_secs(10)), Admission::Reject);
    }

    #[test]
    fn fsm_abandoned_probe_frees_slot() {
        let now = Instant::now();
        let mut fsm = BreakerFsm::new(config(1, Duration::from_secs(1)));
        fsm.on_failure(now);

        let later = now + Duration::from_secs(2);
        assert_eq!(fsm.on_request(later), Admission::Probe);
        fsm.on_abandoned();
        assert_eq!(fsm.on_request(later), Admission::Probe);
    }

    #[test]
    fn config_defaults_pass_validation() {
        let config = CircuitBreakerConfig::builder().build().unwrap();
        assert_eq!(config.failure_threshold(), DEFAULT_FAILURE_THRESHOLD);
        assert_eq!(config.retry_interval(), DEFAULT_RETRY_INTERVAL);
    }

    #[rstest]
    #[case::zero_failure_threshold("failure_threshold")]
    #[case::zero_retry_interval("retry_interval")]
    fn config_zero_field_rejected(#[case] field: &str) {
        let result = match field {
            "failure_threshold" => CircuitBreakerConfig::builder().failure_threshold(0).build(),
            "retry_interval" => {
                CircuitBreakerConfig::builder().retry_interval(Duration::ZERO).build()
            },
            _ => unreachable!(),
        };
        assert!(result.is_err(), "{field} = 0 should be rejected");
    }

    #[test]
    fn display_for_circuit_state() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open { until: Instant::now() }.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    async fn failing(calls: &AtomicU32) -> Result<u32, StorageError> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::connection("down"))
    }

    async fn succeeding(calls: &AtomicU32) -> Result<u32, StorageError> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(7)
    }

    #[tokio::test]
    async fn execute_serves_fallback_without_calling_when_open() {
        let breaker = CircuitBreaker::new("test", config(3, Duration::from_secs(30)));
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert_eq!(breaker.execute(|| failing(&calls), || 0).await, 0);
        }
        assert!(matches!(breaker.state(), CircuitState::Open { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        assert_eq!(breaker.execute(|| succeeding(&calls), || 0).await, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3, "open circuit must not invoke operation");
        assert_eq!(breaker.metrics().fast_fail_count, 1);
    }

    #[tokio::test]
    async fn execute_probes_once_after_interval() {
        let breaker = CircuitBreaker::new("test", config(1, Duration::from_millis(20)));
        let calls = AtomicU32::new(0);

        breaker.execute(|| failing(&calls), || 0).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(breaker.execute(|| succeeding(&calls), || 0).await, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state(), CircuitState::Closed);

        let metrics = breaker.metrics();
        // closed→open, open→half_open, half_open→closed
        assert_eq!(metrics.state_transitions, 3);
    }

    #[tokio::test]
    async fn call_propagates_inner_error() {
        let breaker = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        let calls = AtomicU32::new(0);

        let err = breaker.call(|| failing(&calls)).await.unwrap_err();
        assert!(matches!(err, BreakerError::Inner(StorageError::Connection { .. })));
        assert_eq!(breaker.metrics().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn call_reports_open_circuit() {
        let breaker = CircuitBreaker::new("test", config(1, Duration::from_secs(30)));
        let calls = AtomicU32::new(0);

        let _ = breaker.call(|| failing(&calls)).await;
        let err = breaker.call(|| succeeding(&calls)).await.unwrap_err();
        assert!(matches!(err, BreakerError::Open));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_closes_circuit() {
        let breaker = CircuitBreaker::new("test", config(1, Duration::from_secs(30)));
        let calls = AtomicU32::new(0);
        breaker.execute(|| failing(&calls), || 0).await;

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.execute(|| succeeding(&calls), || 0).await, 7);
    }

    #[derive(Debug, Clone, Copy)]
    enum Event {
        Success,
        Failure,
        Abandon,
        Advance(u64),
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            Just(Event::Success),
            Just(Event::Failure),
            Just(Event::Abandon),
            (0u64..200).prop_map(Event::Advance),
        ]
    }

    proptest! {
        #[test]
        fn fsm_never_admits_two_concurrent_probes(
            events in prop::collection::vec(event(), 1..100)
        ) {
            let mut fsm = BreakerFsm::new(config(3, Duration::from_millis(100)));
            let mut now = Instant::now();
            let mut probing = false;

            for event in events {
                match event {
                    Event::Advance(ms) => now += Duration::from_millis(ms),
                    Event::Success => {
                        fsm.on_success();
                        probing = false;
                    },
                    Event::Failure => {
                        fsm.on_failure(now);
                        probing = false;
                    },
                    Event::Abandon => {
                        fsm.on_abandoned();
                        probing = false;
                    },
                }

                let admission = fsm.on_request(now);
                if admission == Admission::Probe {
                    prop_assert!(!probing, "a second trial was admitted while one was in flight");
                    probing = true;
                }
                if let CircuitState::Open { until } = fsm.state() {
                    prop_assert!(now < until || admission != Admission::Reject);
                }
                prop_assert!(fsm.consecutive_failures() <= 3);
            }
        }
    }
}
