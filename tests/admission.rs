//! End-to-end admission checks through tier configuration and the facade.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Barrier;

use tollgate::ratelimit::codec::{decode, encode, Stamped};
use tollgate::ratelimit::{TokenBucketState, WindowState};
use tollgate::{
    Algorithm, Clock, LimiterOptions, MemoryStore, MockClock, QuotaError, QuotaStore, RateLimiter, Tier,
    TierRegistry,
};

const TIERS: &str = r#"
basic:
  algo: TokenBucket
  period: 60
  capacity: 5
burst:
  algo: FixedWindow
  period: 10
  capacity: 3
unset:
  algo: FixedWindow
"#;

fn limiters(clock: &MockClock) -> (HashMap<String, RateLimiter>, MemoryStore) {
    let registry = TierRegistry::from_yaml(TIERS).unwrap();
    let store = MemoryStore::new(Arc::new(clock.clone()));
    let limiters = registry.build_limiters(
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
        &LimiterOptions::default(),
    );
    (limiters, store)
}

#[tokio::test]
async fn token_bucket_scenario() {
    let clock = MockClock::new(1_700_000_000);
    let (limiters, store) = limiters(&clock);
    let basic = &limiters["basic"];

    for i in 1..=5 {
        assert!(basic.check_limit("u1").await, "request {} should be admitted", i);
    }
    assert!(!basic.check_limit("u1").await);

    clock.advance(61);
    assert!(basic.check_limit("u1").await);

    let bytes = store.get("tollgate:basic:u1").await.unwrap().unwrap();
    let bucket = decode::<TokenBucketState>(&bytes).unwrap().state;
    assert_eq!(bucket.capacity, 5);
    assert_eq!(bucket.next_refresh, clock.now() + 60);
    assert_eq!(basic.peek("u1").await.unwrap().remaining, 4);
}

#[tokio::test]
async fn fixed_window_scenario() {
    let clock = MockClock::new(0);
    let (limiters, _) = limiters(&clock);
    let burst = &limiters["burst"];

    for t in [0, 2, 4] {
        clock.set(t);
        assert!(burst.check_limit("u1").await, "t={} should be admitted", t);
    }
    clock.set(6);
    assert!(!burst.check_limit("u1").await);

    clock.set(11);
    assert!(burst.check_limit("u1").await);
}

#[tokio::test]
async fn unset_parameters_use_defaults() {
    let clock = MockClock::new(0);
    let (limiters, _) = limiters(&clock);
    let unset = &limiters["unset"];

    for _ in 0..5 {
        assert!(unset.check_limit("u1").await);
    }
    assert!(!unset.check_limit("u1").await);

    // Default window is 30 seconds.
    clock.set(29);
    assert!(!unset.check_limit("u1").await);
    clock.set(30);
    assert!(unset.check_limit("u1").await);
}

#[tokio::test]
async fn tiers_do_not_share_state() {
    let clock = MockClock::new(0);
    let (limiters, _) = limiters(&clock);

    for _ in 0..3 {
        assert!(limiters["burst"].check_limit("u1").await);
    }
    assert!(!limiters["burst"].check_limit("u1").await);
    assert!(limiters["basic"].check_limit("u1").await);
}

#[tokio::test]
async fn state_expires_with_ttl() {
    let clock = MockClock::new(0);
    let (limiters, store) = limiters(&clock);
    limiters["burst"].check_limit("u1").await;
    assert_eq!(store.len(), 1);

    clock.advance(20);
    assert!(store.is_empty());
}

#[tokio::test]
async fn unknown_tier_is_a_config_error() {
    let clock = MockClock::new(0);
    let registry = TierRegistry::from_yaml(TIERS).unwrap();
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));

    let result = registry.limiter("platinum", store, Arc::new(clock), &LimiterOptions::default());
    assert!(result.is_err());
}

/// Store that fails reads but would accept writes.
struct UnreadableStore(MemoryStore);

#[async_trait]
impl QuotaStore for UnreadableStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, QuotaError> {
        Err(QuotaError::Store("READONLY You can't read against a replica".to_string()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), QuotaError> {
        self.0.set(key, value, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, QuotaError> {
        self.0.compare_and_swap(key, expected, value, ttl).await
    }
}

#[tokio::test]
async fn store_read_error_denies_for_both_algorithms() {
    let clock = MockClock::new(0);
    let inner = MemoryStore::new(Arc::new(clock.clone()));
    let store: Arc<dyn QuotaStore> = Arc::new(UnreadableStore(inner.clone()));

    for algo in [Algorithm::TokenBucket, Algorithm::FixedWindow] {
        let limiter = RateLimiter::new(
            "basic",
            &Tier::new(algo, 60, 5),
            Arc::clone(&store),
            Arc::new(clock.clone()),
            &LimiterOptions::default(),
        );
        assert!(!limiter.check_limit("u1").await);
    }
    assert!(inner.is_empty(), "a failed check must not write state");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checks_admit_exactly_capacity() {
    for algo in [Algorithm::TokenBucket, Algorithm::FixedWindow] {
        let clock = MockClock::new(1_700_000_000);
        let store = MemoryStore::new(Arc::new(clock.clone()));
        let limiter = RateLimiter::new(
            "basic",
            &Tier::new(algo, 60, 5),
            Arc::new(store),
            Arc::new(clock),
            &LimiterOptions::default(),
        );

        let tasks = (0..40).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check_limit("hot").await })
        });
        let admitted = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .filter(|admitted| *admitted)
            .count();

        assert_eq!(admitted, 5, "{} admitted {} of 40", algo, admitted);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_subjects_are_independent() {
    let clock = MockClock::new(0);
    let (limiters, _) = limiters(&clock);
    let burst = limiters["burst"].clone();

    let tasks = (0..10).flat_map(|subject| {
        let burst = burst.clone();
        (0..5).map(move |_| {
            let burst = burst.clone();
            tokio::spawn(async move { (subject, burst.check_limit(&format!("user-{}", subject)).await) })
        })
    });

    let mut admitted: HashMap<u32, usize> = HashMap::new();
    for joined in join_all(tasks).await {
        let (subject, ok) = joined.unwrap();
        if ok {
            *admitted.entry(subject).or_default() += 1;
        }
    }

    assert_eq!(admitted.len(), 10);
    assert!(admitted.values().all(|&count| count == 3));
}

/// Memory store with a round trip of real latency on every read and swap.
#[derive(Clone)]
struct SlowStore {
    inner: MemoryStore,
    latency: Duration,
}

#[async_trait]
impl QuotaStore for SlowStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, QuotaError> {
        tokio::time::sleep(self.latency).await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), QuotaError> {
        tokio::time::sleep(self.latency).await;
        self.inner.set(key, value, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, QuotaError> {
        tokio::time::sleep(self.latency).await;
        self.inner.compare_and_swap(key, expected, value, ttl).await
    }
}

async fn admitted_under_latency(algo: Algorithm, capacity: u64, requests: usize) -> usize {
    let clock = MockClock::new(1_700_000_000);
    let store = SlowStore {
        inner: MemoryStore::new(Arc::new(clock.clone())),
        latency: Duration::from_millis(1),
    };
    let limiter = RateLimiter::new(
        "basic",
        &Tier::new(algo, 60, capacity),
        Arc::new(store),
        Arc::new(clock),
        &LimiterOptions::default(),
    );

    let tasks = (0..requests).map(|_| {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.check_limit("hot").await })
    });
    join_all(tasks)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(true)))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contention_never_denies_while_quota_remains() {
    for algo in [Algorithm::TokenBucket, Algorithm::FixedWindow] {
        let admitted = admitted_under_latency(algo, 1000, 64).await;
        assert_eq!(admitted, 64, "{} admitted {} of 64", algo, admitted);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contention_admits_exactly_capacity_under_latency() {
    for algo in [Algorithm::TokenBucket, Algorithm::FixedWindow] {
        let admitted = admitted_under_latency(algo, 24, 32).await;
        assert_eq!(admitted, 24, "{} admitted {} of 32", algo, admitted);
    }
}

/// A get-then-set check with no compare-and-swap, for contrast.
async fn naive_accept(store: &MemoryStore, key: &str, barrier: &Barrier) -> bool {
    let raw = store.get(key).await.unwrap();
    let current = raw.as_deref().map(decode::<TokenBucketState>).transpose().unwrap();
    barrier.wait().await;

    let Some(current) = current else { return false };
    if current.state.tokens < 1 {
        return false;
    }
    let next = current.succeed(TokenBucketState {
        tokens: current.state.tokens - 1,
        ..current.state.clone()
    });
    store
        .set(key, &encode(&next).unwrap(), Duration::from_secs(60))
        .await
        .unwrap();
    true
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn naive_get_then_set_loses_updates() {
    let clock = MockClock::new(0);
    let store = MemoryStore::new(Arc::new(clock));
    let seeded = Stamped::first(TokenBucketState {
        subject_id: "hot".to_string(),
        tokens: 1,
        capacity: 5,
        period: 60,
        next_refresh: 60,
    });
    store
        .set("hot", &encode(&seeded).unwrap(), Duration::from_secs(60))
        .await
        .unwrap();

    // Every racer reads the single remaining token before anyone writes.
    let barrier = Arc::new(Barrier::new(4));
    let tasks = (0..4).map(|_| {
        let store = store.clone();
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move { naive_accept(&store, "hot", &barrier).await })
    });
    let admitted = join_all(tasks)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(true)))
        .count();

    assert_eq!(admitted, 4, "without compare-and-swap one token admits every racer");
}

#[tokio::test]
async fn window_state_is_replaced_on_rollover() {
    let clock = MockClock::new(0);
    let (limiters, store) = limiters(&clock);
    let burst = &limiters["burst"];

    burst.check_limit("u1").await;
    burst.check_limit("u1").await;
    clock.set(25);
    burst.check_limit("u1").await;

    let bytes = store.get("tollgate:burst:u1").await.unwrap().unwrap();
    let window = decode::<WindowState>(&bytes).unwrap();
    assert_eq!(window.state.window_id, 2);
    assert_eq!(window.state.request_count, 1);
    assert_eq!(window.revision, 3);
}
