//! End-to-end behavior of both limiters against the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{sync::Arc, time::Duration};

use perimeter_ratelimit::{
    ActorLimiterConfig, ActorRateLimiter, LayeredLimiter, ManualClock, RateLimitPolicy,
    SharedCounterConfig, SharedCounterRateLimiter, render_denial,
};
use perimeter_storage::{Environment, MemoryBackend, StorageBackend, testutil::FlakyBackend};

const T0: i64 = 1_760_000_000_000;

fn actor(store: Arc<dyn StorageBackend>, clock: &ManualClock) -> ActorRateLimiter {
    let config = ActorLimiterConfig::builder()
        .requests_per_minute(50)
        .environment(Environment::Development)
        .build()
        .unwrap();
    ActorRateLimiter::with_clock(store, config, Arc::new(clock.clone()))
}

#[tokio::test]
async fn actor_paced_budget_then_lockout_then_recovery() {
    let clock = ManualClock::new(T0);
    let limiter = actor(Arc::new(MemoryBackend::new()), &clock);

    for _ in 0..50 {
        assert!(limiter.check("10.0.0.1").await.unwrap().is_allowed());
        clock.advance(Duration::from_millis(1_200));
    }

    // Burst with no spacing: three more are absorbed as delay, then lockout.
    let mut burst = Vec::new();
    for _ in 0..6 {
        burst.push(limiter.check("10.0.0.1").await.unwrap());
    }
    assert_eq!(burst.iter().filter(|d| d.is_allowed()).count(), 4);
    assert_eq!(burst[4].retry_after(), Some(40));
    assert!(!burst[5].is_allowed());

    clock.advance(Duration::from_secs(20));
    assert_eq!(limiter.check("10.0.0.1").await.unwrap().retry_after(), Some(20));

    clock.advance(Duration::from_secs(20));
    let resumed = limiter.check("10.0.0.1").await.unwrap();
    assert!(resumed.is_allowed());
    assert_eq!(resumed.remaining(), 50);
}

#[tokio::test]
async fn actor_state_is_shared_through_the_store() {
    let store: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let clock = ManualClock::new(T0);
    let first = actor(store.clone(), &clock);
    for _ in 0..5 {
        first.check("10.0.0.9").await.unwrap();
    }

    // A second process loading the same key sees the lockout.
    let second = actor(store, &clock);
    assert!(!second.check("10.0.0.9").await.unwrap().is_allowed());
}

#[tokio::test]
async fn shared_counter_window_restarts_after_penalty() {
    let store = Arc::new(MemoryBackend::new());
    let config = SharedCounterConfig::builder()
        .max_requests(3)
        .window(Duration::from_millis(200))
        .penalty(Duration::from_millis(100))
        .environment(Environment::Development)
        .build()
        .unwrap();
    let limiter = SharedCounterRateLimiter::new(store.clone(), config);

    for _ in 0..3 {
        assert!(limiter.check("c").await.unwrap().is_allowed());
    }
    let denied = limiter.check("c").await.unwrap();
    assert_eq!(denied.retry_after(), Some(1));

    tokio::time::sleep(Duration::from_millis(350)).await;

    let fresh = limiter.check("c").await.unwrap();
    assert!(fresh.is_allowed());
    assert_eq!(fresh.remaining(), 2, "counter restarts at one");
    let count = store.get("ratelimit:development:c:count").await.unwrap();
    assert_eq!(count.as_deref(), Some(&b"1"[..]));
}

#[tokio::test]
async fn shared_counter_concurrent_increments_are_linearized() {
    let store = Arc::new(MemoryBackend::new());
    let config = SharedCounterConfig::builder().max_requests(10).build().unwrap();
    let limiter = Arc::new(SharedCounterRateLimiter::new(store, config));

    let tasks: Vec<_> = (0..25)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.check("c").await.unwrap().is_allowed() })
        })
        .collect();

    let mut allowed = 0;
    for task in tasks {
        allowed += usize::from(task.await.unwrap());
    }
    assert_eq!(allowed, 10);
}

#[tokio::test]
async fn layered_limiter_survives_store_outage() {
    let store = Arc::new(FlakyBackend::new());
    let shared = SharedCounterRateLimiter::new(store.clone(), SharedCounterConfig::default());
    let limiter = LayeredLimiter::new().with(Arc::new(shared));

    store.set_failing(true);
    let decision = limiter.check("10.0.0.1").await;
    assert!(decision.is_allowed());
    assert!(render_denial(&decision, 0).is_none());
}

#[tokio::test]
async fn layered_limiter_denies_when_either_denies() {
    let store: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let clock = ManualClock::new(T0);
    let shared_config = SharedCounterConfig::builder()
        .max_requests(2)
        .environment(Environment::Development)
        .build()
        .unwrap();
    let limiter = LayeredLimiter::new()
        .with(Arc::new(actor(store.clone(), &clock)))
        .with(Arc::new(SharedCounterRateLimiter::new(store, shared_config)));

    assert!(limiter.check("k").await.is_allowed());
    assert!(limiter.check("k").await.is_allowed());
    let denied = limiter.check("k").await;
    assert!(!denied.is_allowed(), "shared counter denies while the actor still allows");
    assert_eq!(render_denial(&denied, 100).unwrap().status(), http::StatusCode::TOO_MANY_REQUESTS);
}
