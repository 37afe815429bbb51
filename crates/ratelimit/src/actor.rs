//! Strictly serialized per-key rate limiter.
//!
//! Each limiter key is owned by one Tokio task fed through a bounded channel,
//! so evaluations for the same key never overlap while different keys run in
//! parallel. Actor state is restored from the shared store when the actor
//! starts and written back after every evaluation; actors retire after an
//! idle period and are respawned on demand.
//!
//! # Algorithm
//!
//! A leaky bucket with hysteresis. Every request pushes `next_allowed_at`
//! forward by `60_000 / requests_per_minute` milliseconds. A caller running
//! slightly ahead of pace is allowed with a reported delay; a caller more than
//! three intervals ahead is locked out for the penalty duration.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use perimeter_storage::{ConfigError, Environment, StorageBackend, StorageError, keys};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    clock::{Clock, SystemClock},
    decision::{RateLimitDecision, ceil_secs},
    error::RateLimitError,
    policy::RateLimitPolicy,
};

/// Default sustained budget.
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 50;

/// Default lockout once a caller is far over budget (40 seconds).
pub const DEFAULT_PENALTY: Duration = Duration::from_secs(40);

/// Default time an actor waits for work before retiring.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default retention of persisted actor state.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(60 * 60);

/// Intervals a caller may run ahead of pace before the lockout trips.
pub const BURST_INTERVALS: i64 = 3;

const MAILBOX_CAPACITY: usize = 64;

/// Configuration for [`ActorRateLimiter`].
///
/// # Validation
///
/// - `requests_per_minute` must be between 1 and 60 000
/// - `penalty`, `idle_timeout` and `state_ttl` must be non-zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorLimiterConfig {
    requests_per_minute: u32,
    penalty: Duration,
    idle_timeout: Duration,
    state_ttl: Duration,
    environment: Environment,
}

impl Default for ActorLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            penalty: DEFAULT_PENALTY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            state_ttl: DEFAULT_STATE_TTL,
            environment: Environment::default(),
        }
    }
}

#[bon::bon]
impl ActorLimiterConfig {
    /// Creates a new actor limiter configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a field is out of range.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_REQUESTS_PER_MINUTE)] requests_per_minute: u32,
        #[builder(default = DEFAULT_PENALTY)] penalty: Duration,
        #[builder(default = DEFAULT_IDLE_TIMEOUT)] idle_timeout: Duration,
        #[builder(default = DEFAULT_STATE_TTL)] state_ttl: Duration,
        #[builder(default)] environment: Environment,
    ) -> Result<Self, ConfigError> {
        if requests_per_minute == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "requests_per_minute",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if requests_per_minute > 60_000 {
            return Err(ConfigError::AboveMaximum {
                field: "requests_per_minute",
                max: "60000".into(),
                value: requests_per_minute.to_string(),
            });
        }
        for (field, value) in
            [("penalty", penalty), ("idle_timeout", idle_timeout), ("state_ttl", state_ttl)]
        {
            if value.is_zero() {
                return Err(ConfigError::MustBePositive { field, value: format!("{value:?}") });
            }
        }
        Ok(Self { requests_per_minute, penalty, idle_timeout, state_ttl, environment })
    }

    /// Sustained budget.
    #[must_use]
    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute
    }

    /// Lockout duration.
    #[must_use]
    pub fn penalty(&self) -> Duration {
        self.penalty
    }

    /// Idle period before an actor retires.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Milliseconds between requests at the sustained budget.
    #[must_use]
    pub fn interval_millis(&self) -> i64 {
        60_000 / i64::from(self.requests_per_minute)
    }

    fn penalty_millis(&self) -> i64 {
        i64::try_from(self.penalty.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Persisted per-key limiter state. Times are Unix milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorState {
    /// Earliest time the next request is on pace.
    pub next_allowed_at: i64,
    /// Whether a lockout is active.
    pub blocked: bool,
    /// End of the lockout.
    pub blocked_until: i64,
}

/// Evaluates one request at `now` and updates `state`.
///
/// When a lockout ends the state starts over from defaults, so the caller
/// resumes with a full budget.
pub fn evaluate(
    state: &mut ActorState,
    now: i64,
    config: &ActorLimiterConfig,
) -> RateLimitDecision {
    let limit = config.requests_per_minute;

    if state.blocked {
        if now < state.blocked_until {
            return RateLimitDecision::Deny {
                limit,
                retry_after: ceil_secs(state.blocked_until - now),
            };
        }
        *state = ActorState::default();
    }

    let interval = config.interval_millis();
    let wait = (state.next_allowed_at - now).max(0);
    state.next_allowed_at = state.next_allowed_at.max(now).saturating_add(interval);

    if wait > BURST_INTERVALS * interval {
        let penalty = config.penalty_millis();
        state.blocked = true;
        state.blocked_until = now.saturating_add(penalty);
        return RateLimitDecision::Deny { limit, retry_after: ceil_secs(penalty) };
    }

    let used = u32::try_from((wait + interval - 1) / interval).unwrap_or(u32::MAX);
    RateLimitDecision::Allow {
        limit,
        remaining: limit.saturating_sub(used),
        delay: Duration::from_millis(u64::try_from(wait).unwrap_or(0)),
    }
}

type Reply = oneshot::Sender<RateLimitDecision>;

struct Shared {
    registry: Mutex<HashMap<String, mpsc::Sender<Reply>>>,
    store: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    config: ActorLimiterConfig,
}

/// Per-key actor limiter.
///
/// Cloning shares the same actors. Must be used within a Tokio runtime.
#[derive(Clone)]
pub struct ActorRateLimiter {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ActorRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRateLimiter")
            .field("config", &self.shared.config)
            .field("active_actors", &self.active_actors())
            .finish_non_exhaustive()
    }
}

impl ActorRateLimiter {
    /// Creates a limiter persisting actor state to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StorageBackend>, config: ActorLimiterConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Creates a limiter reading time from `clock`.
    #[must_use]
    pub fn with_clock(
        store: Arc<dyn StorageBackend>,
        config: ActorLimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared { registry: Mutex::new(HashMap::new()), store, clock, config }),
        }
    }

    /// Number of live actors.
    #[must_use]
    pub fn active_actors(&self) -> usize {
        self.shared.registry.lock().len()
    }

    fn mailbox(&self, key: &str) -> mpsc::Sender<Reply> {
        let mut registry = self.shared.registry.lock();
        if let Some(tx) = registry.get(key).filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        registry.insert(key.to_owned(), tx.clone());
        tokio::spawn(run_actor(Arc::clone(&self.shared), key.to_owned(), rx));
        tx
    }
}

#[async_trait]
impl RateLimitPolicy for ActorRateLimiter {
    fn name(&self) -> &'static str {
        "actor"
    }

    async fn check(&self, key: &str) -> Result<RateLimitDecision, RateLimitError> {
        let (reply, response) = oneshot::channel();
        self.mailbox(key)
            .send(reply)
            .await
            .map_err(|_| RateLimitError::ActorUnavailable { key: key.to_owned() })?;
        response.await.map_err(|_| RateLimitError::ActorUnavailable { key: key.to_owned() })
    }
}

async fn run_actor(shared: Arc<Shared>, key: String, mut rx: mpsc::Receiver<Reply>) {
    let state_key = keys::ratelimit_state(shared.config.environment, &key);
    let mut state = load_state(shared.store.as_ref(), &state_key).await;
    debug!(key = %key, ?state, "rate limit actor started");

    loop {
        let reply = match tokio::time::timeout(shared.config.idle_timeout, rx.recv()).await {
            Ok(Some(reply)) => reply,
            Ok(None) => break,
            Err(_) => {
                if retire(&shared, &key, &rx) {
                    break;
                }
                continue;
            },
        };

        let decision = evaluate(&mut state, shared.clock.now_millis(), &shared.config);
        persist_state(&shared, &state_key, &state).await;
        let _ = reply.send(decision);
    }
    debug!(key = %key, "rate limit actor retired");
}

/// Removes the registry entry if no caller can still reach this actor.
fn retire(shared: &Shared, key: &str, rx: &mpsc::Receiver<Reply>) -> bool {
    let mut registry = shared.registry.lock();
    // The registry holds the only sender and nothing is queued.
    let idle = rx.is_empty() && registry.get(key).is_some_and(|tx| tx.strong_count() == 1);
    if idle {
        registry.remove(key);
    }
    idle
}

async fn load_state(store: &dyn StorageBackend, state_key: &str) -> ActorState {
    match store.get(state_key).await {
        Ok(Some(raw)) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
            warn!(key = state_key, error = %err, "unreadable rate limit state, starting cold");
            ActorState::default()
        }),
        Ok(None) => ActorState::default(),
        Err(err) => {
            warn!(key = state_key, error = %err, "rate limit state unavailable, starting cold");
            ActorState::default()
        },
    }
}

async fn persist_state(shared: &Shared, state_key: &str, state: &ActorState) {
    let result = match serde_json::to_vec(state) {
        Ok(value) => shared.store.set_with_ttl(state_key, value, shared.config.state_ttl).await,
        Err(err) => Err(StorageError::serialization_with_source("encode rate limit state", err)),
    };
    if let Err(err) = result {
        warn!(key = state_key, error = %err, "failed to persist rate limit state");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use perimeter_storage::{MemoryBackend, testutil::FlakyBackend};
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use crate::clock::ManualClock;

    const T0: i64 = 1_760_000_000_000;

    fn config() -> ActorLimiterConfig {
        ActorLimiterConfig::builder().environment(Environment::Development).build().unwrap()
    }

    #[test]
    fn interval_from_budget() {
        assert_eq!(config().interval_millis(), 1_200);
    }

    #[test]
    fn budget_at_minimum_spacing_is_allowed() {
        let config = config();
        let mut state = ActorState::default();
        let mut now = T0;
        for _ in 0..50 {
            let decision = evaluate(&mut state, now, &config);
            assert_eq!(decision.remaining(), 50);
            now += config.interval_millis();
        }
    }

    #[test]
    fn small_burst_is_delayed_not_blocked() {
        let config = config();
        let mut state = ActorState::default();
        let decisions: Vec<_> = (0..4).map(|_| evaluate(&mut state, T0, &config)).collect();

        assert!(decisions.iter().all(RateLimitDecision::is_allowed));
        assert_eq!(
            decisions[3],
            RateLimitDecision::Allow {
                limit: 50,
                remaining: 47,
                delay: Duration::from_millis(3_600),
            }
        );
    }

    #[test]
    fn far_ahead_trips_penalty_then_recovers() {
        let config = config();
        let mut state = ActorState::default();
        for _ in 0..4 {
            evaluate(&mut state, T0, &config);
        }

        let tripped = evaluate(&mut state, T0, &config);
        assert_eq!(tripped, RateLimitDecision::Deny { limit: 50, retry_after: 40 });

        let during = evaluate(&mut state, T0 + 39_001, &config);
        assert_eq!(during.retry_after(), Some(1));

        let after = evaluate(&mut state, T0 + 40_000, &config);
        assert_eq!(
            after,
            RateLimitDecision::Allow { limit: 50, remaining: 50, delay: Duration::ZERO }
        );
    }

    #[rstest]
    #[case::zero_rpm(ActorLimiterConfig::builder().requests_per_minute(0).build())]
    #[case::huge_rpm(ActorLimiterConfig::builder().requests_per_minute(60_001).build())]
    #[case::zero_penalty(ActorLimiterConfig::builder().penalty(Duration::ZERO).build())]
    #[case::zero_idle(ActorLimiterConfig::builder().idle_timeout(Duration::ZERO).build())]
    fn config_rejects_out_of_range(#[case] result: Result<ActorLimiterConfig, ConfigError>) {
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn lockout_is_honored_and_bounded(steps in prop::collection::vec(0i64..3_000, 1..200)) {
            let config = config();
            let mut state = ActorState::default();
            let mut now = T0;
            for step in steps {
                now += step;
                let locked_until = state.blocked.then_some(state.blocked_until);
                let decision = evaluate(&mut state, now, &config);

                if locked_until.is_some_and(|until| now < until) {
                    prop_assert!(!decision.is_allowed());
                }
                if let Some(retry) = decision.retry_after() {
                    prop_assert!(retry <= 40);
                }
                prop_assert!(decision.remaining() <= 50);
                if decision.is_allowed() {
                    let horizon = now + (BURST_INTERVALS + 1) * config.interval_millis();
                    prop_assert!(state.next_allowed_at <= horizon);
                }
            }
        }
    }

    fn limiter(
        store: Arc<dyn StorageBackend>,
        clock: &ManualClock,
        idle: Duration,
    ) -> ActorRateLimiter {
        let config = ActorLimiterConfig::builder()
            .environment(Environment::Development)
            .idle_timeout(idle)
            .build()
            .unwrap();
        ActorRateLimiter::with_clock(store, config, Arc::new(clock.clone()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_for_one_key_are_serialized() {
        let clock = ManualClock::new(T0);
        let limiter = limiter(Arc::new(MemoryBackend::new()), &clock, DEFAULT_IDLE_TIMEOUT);

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check("10.0.0.1").await.unwrap() })
            })
            .collect();

        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap().is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 4, "exactly the in-budget burst passes");
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let clock = ManualClock::new(T0);
        let limiter = limiter(Arc::new(MemoryBackend::new()), &clock, DEFAULT_IDLE_TIMEOUT);
        for _ in 0..5 {
            limiter.check("a").await.unwrap();
        }
        assert!(!limiter.check("a").await.unwrap().is_allowed());
        assert!(limiter.check("b").await.unwrap().is_allowed());
        assert_eq!(limiter.active_actors(), 2);
    }

    #[tokio::test]
    async fn idle_actor_retires_and_restores_state() {
        let store = Arc::new(MemoryBackend::new());
        let clock = ManualClock::new(T0);
        let limiter = limiter(store.clone(), &clock, Duration::from_millis(50));
        for _ in 0..5 {
            limiter.check("10.0.0.1").await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(limiter.active_actors(), 0);
        assert!(store.get("ratelimit:development:10.0.0.1:state").await.unwrap().is_some());

        clock.advance(Duration::from_secs(10));
        let decision = limiter.check("10.0.0.1").await.unwrap();
        assert_eq!(decision.retry_after(), Some(30), "lockout survives the restart");
    }

    #[tokio::test]
    async fn store_outage_starts_cold() {
        let store = Arc::new(FlakyBackend::new());
        store.set_failing(true);
        let clock = ManualClock::new(T0);
        let limiter = limiter(store, &clock, DEFAULT_IDLE_TIMEOUT);

        assert!(limiter.check("10.0.0.1").await.unwrap().is_allowed());
    }
}
