use std::{sync::Arc, time::Instant};
use tracing::{debug, error, warn};

use crate::{
    config::RateLimitPolicy,
    error::{GateError, Result},
    metrics::Metrics,
    store::{CounterStore, MemoryCounterStore},
    utils::{retry_after_secs, ClientKey},
};

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Denied { retry_after_secs: u64 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }

    fn outcome(&self) -> &'static str {
        match self {
            Admission::Allowed { .. } => "allowed",
            Admission::Denied { .. } => "denied",
        }
    }
}

/// The limit actually enforced for one decision
#[derive(Debug, Clone, Copy)]
struct Limit {
    points: u32,
    window: std::time::Duration,
    block: std::time::Duration,
}

/// Gate that composes the shared counter store with a per-process
/// insurance store
pub struct AdmissionController {
    primary: Arc<dyn CounterStore>,
    insurance: MemoryCounterStore,
    metrics: Arc<Metrics>,
}

impl AdmissionController {
    pub fn new(primary: Arc<dyn CounterStore>, metrics: Arc<Metrics>) -> Self {
        Self::with_insurance(primary, MemoryCounterStore::default(), metrics)
    }

    pub fn with_insurance(
        primary: Arc<dyn CounterStore>,
        insurance: MemoryCounterStore,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            primary,
            insurance,
            metrics,
        }
    }

    /// Decide whether `client_key` may proceed under `policy`. Never fails:
    /// when the shared store is unreachable the insurance limits apply
    /// to this process alone.
    pub async fn admit(&self, policy: &RateLimitPolicy, client_key: &ClientKey) -> Admission {
        let limit = Limit {
            points: policy.points_per_window(),
            window: policy.window(),
            block: policy.block(),
        };

        let started = Instant::now();
        let primary_result = Self::consume(self.primary.as_ref(), policy, limit, client_key).await;
        self.metrics
            .record_store_operation_duration(self.primary.name(), started.elapsed().as_secs_f64());

        let admission = match primary_result {
            Ok(admission) => admission,
            Err(e) => {
                warn!(
                    policy = %policy.key_prefix(),
                    client = %client_key,
                    store = self.primary.name(),
                    error = %e,
                    "Counter store unavailable, applying insurance limits"
                );
                self.metrics.record_insurance_fallback(policy.key_prefix());

                // Insurance limits are points per window only, never a block
                let insurance_limit = Limit {
                    points: policy.insurance_points(),
                    window: policy.insurance_window(),
                    block: std::time::Duration::ZERO,
                };
                match Self::consume(&self.insurance, policy, insurance_limit, client_key).await {
                    Ok(admission) => admission,
                    Err(e) => {
                        // The in-memory store has no failure path; admit rather than
                        // turn a limiter fault into an outage.
                        error!(error = %e, "Insurance store failed, admitting request");
                        Admission::Allowed { remaining: 0 }
                    }
                }
            }
        };

        self.metrics
            .record_admission(policy.key_prefix(), admission.outcome());
        if let Admission::Denied { retry_after_secs } = admission {
            debug!(
                policy = %policy.key_prefix(),
                client = %client_key,
                retry_after_secs,
                "Request denied"
            );
        }

        admission
    }

    /// Evaluate policies in order, stopping at the first denial
    pub async fn admit_chain(
        &self,
        policies: &[Arc<RateLimitPolicy>],
        client_key: &ClientKey,
    ) -> Admission {
        let mut last = Admission::Allowed { remaining: u32::MAX };
        for policy in policies {
            let admission = self.admit(policy, client_key).await;
            if !admission.is_allowed() {
                return admission;
            }
            last = match (last, admission) {
                (Admission::Allowed { remaining: a }, Admission::Allowed { remaining: b }) => {
                    Admission::Allowed { remaining: a.min(b) }
                }
                (_, admission) => admission,
            };
        }
        last
    }

    /// Admit or convert the denial into the client-facing error
    pub async fn check(
        &self,
        policies: &[Arc<RateLimitPolicy>],
        client_key: &ClientKey,
        denied_message: &str,
    ) -> Result<()> {
        match self.admit_chain(policies, client_key).await {
            Admission::Allowed { .. } => Ok(()),
            Admission::Denied { retry_after_secs } => Err(GateError::AdmissionDenied {
                message: denied_message.to_string(),
                retry_after_secs,
            }),
        }
    }

    pub async fn health_check(&self) -> Result<()> {
        self.primary.health_check().await
    }

    async fn consume(
        store: &dyn CounterStore,
        policy: &RateLimitPolicy,
        limit: Limit,
        client_key: &ClientKey,
    ) -> Result<Admission> {
        let block_key = policy.block_key(client_key.as_str());
        if let Some(remaining) = store.blocked_for(&block_key).await? {
            return Ok(Admission::Denied {
                retry_after_secs: retry_after_secs(remaining),
            });
        }

        let counter_key = policy.counter_key(client_key.as_str());
        let count = store.increment(&counter_key, limit.window).await?;
        let points = u64::from(limit.points);

        if count.consumed <= points {
            return Ok(Admission::Allowed {
                remaining: (points - count.consumed) as u32,
            });
        }

        if limit.block.is_zero() {
            return Ok(Admission::Denied {
                retry_after_secs: retry_after_secs(count.resets_in),
            });
        }

        store.block(&block_key, &counter_key, limit.block).await?;
        Ok(Admission::Denied {
            retry_after_secs: retry_after_secs(limit.block),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::WindowCount;
    use async_trait::async_trait;
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::Mutex;

    /// Store whose every call fails like an unreachable Redis
    struct UnreachableStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CounterStore for UnreachableStore {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        async fn blocked_for(&self, _block_key: &str) -> Result<Option<Duration>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(GateError::StoreUnavailable("connection refused".to_string()))
        }

        async fn increment(&self, _counter_key: &str, _window: Duration) -> Result<WindowCount> {
            Err(GateError::StoreUnavailable("connection refused".to_string()))
        }

        async fn block(&self, _b: &str, _c: &str, _d: Duration) -> Result<()> {
            Err(GateError::StoreUnavailable("connection refused".to_string()))
        }

        async fn health_check(&self) -> Result<()> {
            Err(GateError::StoreUnavailable("connection refused".to_string()))
        }
    }

    /// Store with one flat keyspace, like Redis: counters and block markers
    /// are the same kind of entry
    #[derive(Default)]
    struct FlatKeyspaceStore {
        entries: Mutex<HashMap<String, (u64, std::time::Instant)>>,
    }

    impl FlatKeyspaceStore {
        fn live(entry: Option<&(u64, std::time::Instant)>) -> Option<(u64, Duration)> {
            entry.and_then(|(value, expires_at)| {
                let now = std::time::Instant::now();
                (*expires_at > now).then(|| (*value, *expires_at - now))
            })
        }
    }

    #[async_trait]
    impl CounterStore for FlatKeyspaceStore {
        fn name(&self) -> &'static str {
            "flat"
        }

        async fn blocked_for(&self, block_key: &str) -> Result<Option<Duration>> {
            let entries = self.entries.lock().await;
            Ok(Self::live(entries.get(block_key)).map(|(_, ttl)| ttl))
        }

        async fn increment(&self, counter_key: &str, window: Duration) -> Result<WindowCount> {
            let mut entries = self.entries.lock().await;
            let (consumed, resets_in) = match Self::live(entries.get(counter_key)) {
                Some((value, ttl)) => (value + 1, ttl),
                None => (1, window),
            };
            entries.insert(
                counter_key.to_string(),
                (consumed, std::time::Instant::now() + resets_in),
            );
            Ok(WindowCount {
                consumed,
                resets_in,
            })
        }

        async fn block(&self, block_key: &str, counter_key: &str, duration: Duration) -> Result<()> {
            let mut entries = self.entries.lock().await;
            entries.remove(counter_key);
            entries.insert(
                block_key.to_string(),
                (1, std::time::Instant::now() + duration),
            );
            Ok(())
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    fn controller() -> AdmissionController {
        AdmissionController::new(
            Arc::new(MemoryCounterStore::default()),
            Arc::new(Metrics::new().unwrap()),
        )
    }

    fn policy(points: u32, window: u64, block: u64) -> RateLimitPolicy {
        RateLimitPolicy::new("test", points, window, block, 2, window).unwrap()
    }

    #[tokio::test]
    async fn test_allows_up_to_points() {
        let controller = controller();
        let policy = policy(5, 60, 0);
        let client = ClientKey::from("c1");

        for expected_remaining in (0..5).rev() {
            assert_eq!(
                controller.admit(&policy, &client).await,
                Admission::Allowed {
                    remaining: expected_remaining
                }
            );
        }
    }

    #[tokio::test]
    async fn test_denies_after_points_with_positive_retry() {
        let controller = controller();
        let policy = policy(3, 60, 0);
        let client = ClientKey::from("c1");

        for _ in 0..3 {
            assert!(controller.admit(&policy, &client).await.is_allowed());
        }

        match controller.admit(&policy, &client).await {
            Admission::Denied { retry_after_secs } => {
                assert!(retry_after_secs > 0);
                assert!(retry_after_secs <= 60);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_block_reports_block_duration() {
        let controller = controller();
        let policy = policy(1, 60, 120);
        let client = ClientKey::from("c1");

        assert!(controller.admit(&policy, &client).await.is_allowed());
        assert_eq!(
            controller.admit(&policy, &client).await,
            Admission::Denied {
                retry_after_secs: 120
            }
        );

        // Still blocked; the marker answers without touching the counter.
        match controller.admit(&policy, &client).await {
            Admission::Denied { retry_after_secs } => assert!(retry_after_secs <= 120),
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_allowed_again_after_block_elapses() {
        let controller = controller();
        let policy = policy(1, 60, 1);
        let client = ClientKey::from("c1");

        assert!(controller.admit(&policy, &client).await.is_allowed());
        assert!(!controller.admit(&policy, &client).await.is_allowed());

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert!(controller.admit(&policy, &client).await.is_allowed());
    }

    #[tokio::test]
    async fn test_clients_have_independent_buckets() {
        let controller = controller();
        let policy = policy(1, 60, 0);

        assert!(controller.admit(&policy, &ClientKey::from("a")).await.is_allowed());
        assert!(controller.admit(&policy, &ClientKey::from("b")).await.is_allowed());
        assert!(!controller.admit(&policy, &ClientKey::from("a")).await.is_allowed());
    }

    #[tokio::test]
    async fn test_falls_back_to_insurance_limits() {
        let store = Arc::new(UnreachableStore {
            calls: AtomicUsize::new(0),
        });
        let controller =
            AdmissionController::new(store.clone(), Arc::new(Metrics::new().unwrap()));
        // 10 shared points, but only 2 insurance points
        let policy = RateLimitPolicy::new("global", 10, 60, 0, 2, 60).unwrap();
        let client = ClientKey::from("c1");

        assert!(controller.admit(&policy, &client).await.is_allowed());
        assert!(controller.admit(&policy, &client).await.is_allowed());
        assert!(!controller.admit(&policy, &client).await.is_allowed());
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_insurance_limits_never_block() {
        let store = Arc::new(UnreachableStore {
            calls: AtomicUsize::new(0),
        });
        let controller = AdmissionController::new(store, Arc::new(Metrics::new().unwrap()));
        // Shared policy blocks for a minute; insurance is 2 per second
        let policy = RateLimitPolicy::new("global", 20, 1, 60, 2, 1).unwrap();
        let client = ClientKey::from("u1");

        assert!(controller.admit(&policy, &client).await.is_allowed());
        assert!(controller.admit(&policy, &client).await.is_allowed());
        match controller.admit(&policy, &client).await {
            Admission::Denied { retry_after_secs } => assert_eq!(retry_after_secs, 1),
            other => panic!("expected denial, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(controller.admit(&policy, &client).await.is_allowed());
    }

    #[tokio::test]
    async fn test_client_key_cannot_reach_another_clients_marker() {
        let controller = AdmissionController::new(
            Arc::new(FlatKeyspaceStore::default()),
            Arc::new(Metrics::new().unwrap()),
        );
        let policy = RateLimitPolicy::new("global", 20, 60, 60, 10, 60).unwrap();

        for prefix in ["blocked:", "b:", "c:"] {
            let attacker = ClientKey::from(format!("{}203.0.113.9", prefix).as_str());
            assert!(controller.admit(&policy, &attacker).await.is_allowed());
        }

        let victim = ClientKey::from("203.0.113.9");
        assert_eq!(
            controller.admit(&policy, &victim).await,
            Admission::Allowed { remaining: 19 }
        );
    }

    #[tokio::test]
    async fn test_chain_short_circuits_on_first_denial() {
        let controller = controller();
        let strict = Arc::new(RateLimitPolicy::new("strict", 1, 60, 0, 1, 60).unwrap());
        let loose = Arc::new(RateLimitPolicy::new("loose", 100, 60, 0, 1, 60).unwrap());
        let client = ClientKey::from("c1");
        let chain = vec![strict.clone(), loose.clone()];

        assert!(controller.admit_chain(&chain, &client).await.is_allowed());
        assert!(!controller.admit_chain(&chain, &client).await.is_allowed());

        // The denied call never reached the second policy.
        assert_eq!(
            controller.admit(&loose, &client).await,
            Admission::Allowed { remaining: 98 }
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_single_point() {
        let controller = Arc::new(controller());
        let policy = Arc::new(policy(1, 60, 0));
        let client = ClientKey::from("racer");

        let a = {
            let (controller, policy, client) = (controller.clone(), policy.clone(), client.clone());
            tokio::spawn(async move { controller.admit(&policy, &client).await })
        };
        let b = {
            let (controller, policy, client) = (controller.clone(), policy.clone(), client.clone());
            tokio::spawn(async move { controller.admit(&policy, &client).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let allowed = results.iter().filter(|r| r.is_allowed()).count();
        assert_eq!(allowed, 1);
    }

    #[tokio::test]
    async fn test_check_maps_denial_to_error() {
        let controller = controller();
        let policies = vec![Arc::new(policy(1, 60, 0))];
        let client = ClientKey::from("c1");

        tokio_test::assert_ok!(controller.check(&policies, &client, "slow down").await);
        let err = controller
            .check(&policies, &client, "slow down")
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::AdmissionDenied { ref message, .. } if message == "slow down"));
    }
}
