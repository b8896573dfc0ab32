//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::{StoreError, TatStore};
use super::clock::{Clock, SystemClock};
use super::gcra::{period_nanos, StoreReply};
use crate::config::{FailurePolicy, RateLimitingConfig};

/// Default namespace prepended to every store key.
const DEFAULT_KEY_PREFIX: &str = "rl:";
/// Default budget for one store round trip.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// The outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the call may proceed now
    pub admitted: bool,
    /// How long to wait before retrying; zero when admitted
    pub retry_after: Duration,
}

impl Decision {
    pub const fn admit() -> Self {
        Self {
            admitted: true,
            retry_after: Duration::ZERO,
        }
    }

    pub const fn reject(retry_after: Duration) -> Self {
        Self {
            admitted: false,
            retry_after,
        }
    }

    /// Retry hint in whole seconds for protocol headers.
    ///
    /// Always one second above the truncated wait, so it is never shorter
    /// than [`retry_after`](Self::retry_after).
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.as_secs() + 1
    }
}

/// The admission-control core.
///
/// Holds no rate limit state of its own: every decision is one atomic
/// evaluation in the shared store. Safe to share across tasks behind an
/// `Arc` with no further coordination.
///
/// # Failure policy
///
/// When the store errors or does not answer within the timeout the limiter
/// **fails open** by default and admits the call. Rate limiting is therefore
/// silently disabled for the duration of a store outage. Deployments that
/// prefer rejecting traffic set [`FailurePolicy::FailClosed`].
pub struct RateLimiter {
    store: Arc<dyn TatStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    timeout: Duration,
    failure_policy: FailurePolicy,
}

impl RateLimiter {
    /// Create a rate limiter over `store` with default settings.
    pub fn new(store: Arc<dyn TatStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: DEFAULT_STORE_TIMEOUT,
            failure_policy: FailurePolicy::FailOpen,
        }
    }

    /// Create a rate limiter configured from the rate limiting section.
    pub fn from_config(store: Arc<dyn TatStore>, config: &RateLimitingConfig) -> Self {
        Self::new(store)
            .with_key_prefix(&config.key_prefix)
            .with_timeout(config.store_timeout())
            .with_failure_policy(config.failure_policy)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// The store this limiter evaluates against.
    pub fn store(&self) -> &Arc<dyn TatStore> {
        &self.store
    }

    /// Decide whether `key` may proceed now, bounded by the configured timeout.
    pub async fn allow(&self, key: &str, burst: u32, rate_per_second: f64) -> Decision {
        self.allow_within(key, burst, rate_per_second, self.timeout)
            .await
    }

    /// Decide whether `key` may proceed now, bounded by `timeout`.
    ///
    /// A non-positive (or NaN) rate rejects with a zero wait and never
    /// touches the store. Dropping the returned future abandons the call;
    /// the store either ran the whole evaluation or none of it.
    pub async fn allow_within(
        &self,
        key: &str,
        burst: u32,
        rate_per_second: f64,
        timeout: Duration,
    ) -> Decision {
        if !(rate_per_second > 0.0) {
            trace!(key = %key, rate = rate_per_second, "Rate disabled, rejecting");
            return Decision::reject(Duration::ZERO);
        }

        let store_key = self.store_key(key);
        let period_ns = period_nanos(rate_per_second);
        let now_ns = self.clock.now_nanos();

        trace!(
            key = %store_key,
            burst = burst,
            period_ns = period_ns,
            "Checking rate limit"
        );

        let evaluation = self.store.evaluate(&store_key, burst, period_ns, now_ns);
        let reply = match tokio::time::timeout(timeout, evaluation).await {
            Ok(Ok(raw)) => StoreReply::from_raw(raw),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StoreError::Timeout(timeout)),
        };

        match reply {
            Ok(StoreReply::Admitted) => Decision::admit(),
            Ok(StoreReply::Rejected { retry_after }) => {
                debug!(
                    key = %store_key,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limit exceeded"
                );
                Decision::reject(retry_after)
            }
            Err(e) => self.on_store_failure(&store_key, e),
        }
    }

    fn on_store_failure(&self, store_key: &str, error: StoreError) -> Decision {
        match self.failure_policy {
            FailurePolicy::FailOpen => {
                warn!(
                    key = %store_key,
                    store = self.store.name(),
                    error = %error,
                    "Rate limit store failed, admitting request"
                );
                Decision::admit()
            }
            FailurePolicy::FailClosed => {
                warn!(
                    key = %store_key,
                    store = self.store.name(),
                    error = %error,
                    "Rate limit store failed, rejecting request"
                );
                Decision::reject(Duration::ZERO)
            }
        }
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::key::RateLimitKey;
    use crate::ratelimit::memory::MemoryStore;
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;

    const START: u64 = 1_700_000_000_000_000_000;

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        limiter: RateLimiter,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let limiter = RateLimiter::new(store.clone()).with_clock(clock.clone());
        Harness {
            store,
            clock,
            limiter,
        }
    }

    struct FailingStore;

    #[async_trait]
    impl TatStore for FailingStore {
        async fn evaluate(
            &self,
            _key: &str,
            _burst: u32,
            _period_ns: u64,
            _now_ns: u64,
        ) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    struct StallingStore;

    #[async_trait]
    impl TatStore for StallingStore {
        async fn evaluate(
            &self,
            _key: &str,
            _burst: u32,
            _period_ns: u64,
            _now_ns: u64,
        ) -> Result<i64, StoreError> {
            std::future::pending().await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            std::future::pending().await
        }

        fn name(&self) -> &'static str {
            "stalling"
        }
    }

    struct GarbageStore;

    #[async_trait]
    impl TatStore for GarbageStore {
        async fn evaluate(
            &self,
            _key: &str,
            _burst: u32,
            _period_ns: u64,
            _now_ns: u64,
        ) -> Result<i64, StoreError> {
            Ok(12)
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "garbage"
        }
    }

    #[tokio::test]
    async fn test_non_positive_rate_rejects_without_wait() {
        let h = harness();

        for rate in [0.0, -1.0, -0.001, f64::NAN, f64::NEG_INFINITY] {
            for burst in [0, 1, 100] {
                let decision = h.limiter.allow("caller", burst, rate).await;
                assert_eq!(decision, Decision::reject(Duration::ZERO), "rate {}", rate);
            }
        }
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_rate_rejects_even_when_store_is_down() {
        let limiter = RateLimiter::new(Arc::new(FailingStore));
        assert!(!limiter.allow("caller", 10, 0.0).await.admitted);
    }

    #[tokio::test]
    async fn test_burst_admitted_then_rejected() {
        let h = harness();

        for i in 1..=3 {
            let decision = h.limiter.allow("caller", 3, 10.0).await;
            assert_eq!(decision, Decision::admit(), "call {} should be admitted", i);
        }

        let decision = h.limiter.allow("caller", 3, 10.0).await;
        assert!(!decision.admitted);
        assert!(decision.retry_after > Duration::ZERO);
        assert_eq!(decision.retry_after, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_zero_burst_admits_nothing() {
        let h = harness();

        for _ in 0..5 {
            assert!(!h.limiter.allow("caller", 0, 10.0).await.admitted);
            h.clock.advance(Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn test_steady_state_conformance() {
        let h = harness();

        for i in 0..200 {
            let decision = h.limiter.allow("caller", 1, 10.0).await;
            assert!(decision.admitted, "call {} at the sustained rate was rejected", i);
            h.clock.advance(Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_rejections_do_not_advance_tat() {
        let h = harness();
        let store_key = "rl:caller";

        assert!(h.limiter.allow("caller", 1, 10.0).await.admitted);
        let tat = h.store.tat(store_key);

        for _ in 0..25 {
            assert!(!h.limiter.allow("caller", 1, 10.0).await.admitted);
        }
        assert_eq!(h.store.tat(store_key), tat);

        // One period later the caller conforms as if the rejections never happened.
        h.clock.advance(Duration::from_millis(100));
        assert!(h.limiter.allow("caller", 1, 10.0).await.admitted);
    }

    #[tokio::test]
    async fn test_waiting_retry_after_is_always_enough() {
        let h = harness();

        for rate in [3.0, 7.0, 10.0, 33.3, 1000.0] {
            let key = format!("caller-{}", rate);
            while h.limiter.allow(&key, 2, rate).await.admitted {}

            let rejected = h.limiter.allow(&key, 2, rate).await;
            assert!(!rejected.admitted);
            assert!(rejected.retry_after >= Duration::from_millis(1));

            h.clock.advance(rejected.retry_after);
            assert!(
                h.limiter.allow(&key, 2, rate).await.admitted,
                "waiting {:?} at rate {} was not enough",
                rejected.retry_after,
                rate
            );
        }
    }

    #[tokio::test]
    async fn test_retry_after_never_truncated() {
        let h = harness();

        // Period is 333,333,334ns; the true wait after one burst slot is one period.
        assert!(h.limiter.allow("caller", 1, 3.0).await.admitted);
        let decision = h.limiter.allow("caller", 1, 3.0).await;

        assert!(decision.retry_after >= Duration::from_nanos(333_333_334));
        assert_eq!(decision.retry_after, Duration::from_millis(334));
    }

    #[tokio::test]
    async fn test_tat_monotonic_across_admissions() {
        let h = harness();
        let mut last = 0;

        for step in [0u64, 5, 0, 250, 1, 40, 0, 900] {
            h.clock.advance(Duration::from_millis(step));
            if h.limiter.allow("caller", 4, 20.0).await.admitted {
                let tat = h.store.tat("rl:caller").unwrap();
                assert!(tat >= last);
                last = tat;
            }
        }
        assert!(last > 0);
    }

    #[tokio::test]
    async fn test_descriptor_may_change_between_calls() {
        let h = harness();

        assert!(h.limiter.allow("caller", 1, 1.0).await.admitted);
        assert!(!h.limiter.allow("caller", 1, 1.0).await.admitted);
        // A larger burst on the next call governs that call.
        assert!(h.limiter.allow("caller", 5, 1.0).await.admitted);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let h = harness();
        let a = RateLimitKey::from_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let b = RateLimitKey::from_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));

        assert!(h.limiter.allow(a.as_str(), 1, 1.0).await.admitted);
        assert!(!h.limiter.allow(a.as_str(), 1, 1.0).await.admitted);
        assert!(h.limiter.allow(b.as_str(), 1, 1.0).await.admitted);
        assert!(h.store.tat("rl:ip:10.0.0.1").is_some());
    }

    #[tokio::test]
    async fn test_custom_key_prefix() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone()).with_key_prefix("edge:");

        assert!(limiter.allow("caller", 1, 1.0).await.admitted);
        assert!(store.tat("edge:caller").is_some());
        assert!(store.tat("rl:caller").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_admit_exactly_burst() {
        let h = harness();
        let limiter = Arc::new(h.limiter);

        for (callers, burst) in [(50, 7), (200, 1), (16, 16), (100, 30)] {
            let key = format!("hot-{}-{}", callers, burst);
            let tasks: Vec<_> = (0..callers)
                .map(|_| {
                    let limiter = limiter.clone();
                    let key = key.clone();
                    tokio::spawn(async move { limiter.allow(&key, burst, 5.0).await })
                })
                .collect();

            let admitted = futures::future::join_all(tasks)
                .await
                .into_iter()
                .map(|r| r.unwrap())
                .filter(|d| d.admitted)
                .count();

            assert_eq!(admitted, burst as usize, "{} callers, burst {}", callers, burst);
        }
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unreachable() {
        let limiter = RateLimiter::new(Arc::new(FailingStore));

        for burst in [0, 1, 50] {
            assert_eq!(limiter.allow("caller", burst, 10.0).await, Decision::admit());
        }
    }

    #[tokio::test]
    async fn test_fails_open_within_timeout_when_store_stalls() {
        let limiter = RateLimiter::new(Arc::new(StallingStore));
        let budget = Duration::from_millis(50);

        let started = Instant::now();
        let decision = limiter.allow_within("caller", 3, 10.0, budget).await;

        assert_eq!(decision, Decision::admit());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_fail_closed_policy() {
        let limiter = RateLimiter::new(Arc::new(FailingStore))
            .with_failure_policy(FailurePolicy::FailClosed);

        assert_eq!(
            limiter.allow("caller", 3, 10.0).await,
            Decision::reject(Duration::ZERO)
        );
    }

    #[tokio::test]
    async fn test_unexpected_reply_treated_as_store_failure() {
        let open = RateLimiter::new(Arc::new(GarbageStore));
        assert!(open.allow("caller", 1, 1.0).await.admitted);

        let closed = RateLimiter::new(Arc::new(GarbageStore))
            .with_failure_policy(FailurePolicy::FailClosed);
        assert!(!closed.allow("caller", 1, 1.0).await.admitted);
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = RateLimitingConfig {
            key_prefix: "cfg:".to_string(),
            store_timeout_ms: 10,
            failure_policy: FailurePolicy::FailClosed,
            ..RateLimitingConfig::default()
        };
        let limiter = RateLimiter::from_config(Arc::new(StallingStore), &config);

        assert_eq!(limiter.store().name(), "stalling");
        assert!(!limiter.allow("caller", 1, 1.0).await.admitted);
    }

    #[test]
    fn test_retry_after_secs_rounds_up() {
        assert_eq!(Decision::reject(Duration::from_millis(1)).retry_after_secs(), 1);
        assert_eq!(Decision::reject(Duration::from_millis(999)).retry_after_secs(), 1);
        assert_eq!(Decision::reject(Duration::from_millis(1000)).retry_after_secs(), 2);
        assert_eq!(Decision::reject(Duration::from_millis(2500)).retry_after_secs(), 3);
    }
}
