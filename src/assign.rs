// src/assign.rs
//! Assignment service: turns a consumption request into a stimulus while keeping
//! exposure balanced across the pool.
//!
//! Single-item requests take the least-served item and record the consumption
//! before the item is returned. In [`AssignMode::Atomic`] that record is a
//! conditional claim on the count observed at read time, so two racing requests
//! can never both take the same item at the same count; the loser re-reads and
//! tries the next least-served candidate. [`AssignMode::Legacy`] keeps the older
//! read-then-mark sequence, which narrows but does not close that race.
//!
//! When the pool is absent, exhausted, or unreachable, the request is served from
//! the [`FallbackSampler`] instead and tagged [`Provenance::Fallback`].

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{AssignConfig, AssignMode};
use crate::error::{AssignError, StoreError};
use crate::fallback::FallbackSampler;
use crate::metrics::{
    ensure_metrics_described, ASSIGN_MS, ASSIGN_TOTAL, CLAIM_CONFLICTS_TOTAL, STORE_ERRORS_TOTAL,
};
use crate::pool::{bounded, Claim, ClaimOutcome, CollectionRef, ConsumerId, StimulusItem, StimulusStore};
use crate::telemetry::anon_id;

/// Where an assigned item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Consumption recorded in the pool.
    Tracked,
    /// Same request key seen before; the earlier item is returned, nothing recorded.
    Replay,
    /// Sampled locally; the pool was not consulted or not usable.
    Fallback,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tracked => "tracked",
            Self::Replay => "replay",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub provenance: Provenance,
    #[serde(rename = "stim")]
    pub item: StimulusItem,
}

/// A request for stimulus items from one pool.
#[derive(Debug, Clone)]
pub struct ConsumptionRequest {
    pub pool: CollectionRef,
    pub consumer: ConsumerId,
    /// Idempotency key, scoped to `consumer`; a retried request with the same key
    /// gets the same item back.
    pub request_key: Option<String>,
}

impl ConsumptionRequest {
    pub fn single(pool: CollectionRef, consumer: ConsumerId) -> Self {
        Self {
            pool,
            consumer,
            request_key: None,
        }
    }

    pub fn with_request_key(mut self, key: impl Into<String>) -> Self {
        self.request_key = Some(key.into());
        self
    }
}

pub struct AssignmentService {
    store: Arc<dyn StimulusStore>,
    fallback: FallbackSampler,
    cfg: AssignConfig,
}

impl AssignmentService {
    pub fn new(store: Arc<dyn StimulusStore>, fallback: FallbackSampler, cfg: AssignConfig) -> Self {
        ensure_metrics_described();
        Self { store, fallback, cfg }
    }

    pub fn config(&self) -> &AssignConfig {
        &self.cfg
    }

    pub fn fallback(&self) -> &FallbackSampler {
        &self.fallback
    }

    /// Single-item path with degradation: pool trouble is masked by the fallback sampler.
    pub async fn get_single_stimulus(&self, req: &ConsumptionRequest) -> Result<Assignment, AssignError> {
        let started = Instant::now();
        let res = match self.assign_tracked(req).await {
            Ok(a) => Ok(a),
            Err(e) if e.falls_back() => {
                warn!(
                    target: "assign",
                    pool = %req.pool,
                    error = %e,
                    candidates = self.fallback.len(),
                    "pool unavailable, falling back to local stimulus list"
                );
                self.fallback_assignment().ok_or(e)
            }
            Err(e) => Err(e),
        };

        if let Ok(a) = &res {
            counter!(ASSIGN_TOTAL, "provenance" => a.provenance.as_str()).increment(1);
            histogram!(ASSIGN_MS).record(started.elapsed().as_secs_f64() * 1_000.0);
            info!(
                target: "assign",
                pool = %req.pool,
                consumer = %anon_id(req.consumer.as_str()),
                item = %a.item.id,
                num_served = a.item.num_served(),
                provenance = a.provenance.as_str(),
                "stimulus assigned"
            );
        }
        res
    }

    /// A locally sampled item, without touching the pool.
    pub fn fallback_assignment(&self) -> Option<Assignment> {
        self.fallback.sample().map(|item| Assignment {
            provenance: Provenance::Fallback,
            item,
        })
    }

    /// Single-item path without fallback: either the consumption is recorded or an error comes back.
    pub async fn assign_tracked(&self, req: &ConsumptionRequest) -> Result<Assignment, AssignError> {
        if req.consumer.as_str().trim().is_empty() {
            return Err(AssignError::Validation("consumer id must not be empty".into()));
        }

        if let Some(replay) = self.find_replay(req).await? {
            return Ok(replay);
        }

        match self.cfg.mode {
            AssignMode::Atomic => self.claim_least_served(req).await,
            AssignMode::Legacy => self.read_then_mark(req).await,
        }
    }

    async fn claim_least_served(&self, req: &ConsumptionRequest) -> Result<Assignment, AssignError> {
        let attempts = self.cfg.max_claim_attempts.max(1);
        for attempt in 1..=attempts {
            let candidate = self.least_served_one(&req.pool).await?;
            let claim = Claim {
                item: candidate.id.clone(),
                observed_served: candidate.num_served(),
                consumer: req.consumer.clone(),
                request_key: req.request_key.clone(),
            };
            // Never retried on error: a timed-out claim may already have been applied.
            let outcome = bounded(self.cfg.call_timeout(), self.store.claim(&req.pool, &claim))
                .await
                .inspect_err(|_| count_store_error("claim"))?;
            match outcome {
                ClaimOutcome::Claimed(item) => {
                    return Ok(Assignment {
                        provenance: Provenance::Tracked,
                        item,
                    })
                }
                ClaimOutcome::Duplicate => {
                    // A concurrent request with the same key won; hand back what it took.
                    if let Some(replay) = self.find_replay(req).await? {
                        return Ok(replay);
                    }
                    counter!(CLAIM_CONFLICTS_TOTAL).increment(1);
                }
                ClaimOutcome::Conflict => {
                    counter!(CLAIM_CONFLICTS_TOTAL).increment(1);
                    debug!(
                        target: "assign",
                        pool = %req.pool,
                        item = %claim.item,
                        attempt,
                        "claim lost to a concurrent request, retrying"
                    );
                }
            }
        }
        Err(AssignError::PoolExhausted {
            pool: req.pool.clone(),
            attempts,
        })
    }

    /// The item this consumer already claimed under the request's key, if any.
    async fn find_replay(&self, req: &ConsumptionRequest) -> Result<Option<Assignment>, StoreError> {
        let Some(key) = req.request_key.as_deref() else {
            return Ok(None);
        };
        let prior = self
            .read_with_retry("find_claimed", || {
                self.store.find_claimed(&req.pool, &req.consumer, key)
            })
            .await?;
        Ok(prior.map(|item| {
            debug!(target: "assign", pool = %req.pool, item = %item.id, "replaying earlier claim");
            Assignment {
                provenance: Provenance::Replay,
                item,
            }
        }))
    }

    async fn read_then_mark(&self, req: &ConsumptionRequest) -> Result<Assignment, AssignError> {
        let mut item = self.least_served_one(&req.pool).await?;
        // Mark before replying so the window for a concurrent duplicate read stays short.
        bounded(
            self.cfg.call_timeout(),
            self.store.mark_consumed(&req.pool, &item.id, &req.consumer),
        )
        .await
        .inspect_err(|_| count_store_error("mark_consumed"))?;
        item.record_consumer(&req.consumer, None);
        Ok(Assignment {
            provenance: Provenance::Tracked,
            item,
        })
    }

    async fn least_served_one(&self, pool: &CollectionRef) -> Result<StimulusItem, AssignError> {
        self.read_with_retry("least_served", || self.store.least_served(pool, 1))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AssignError::PoolExhausted {
                pool: pool.clone(),
                attempts: 1,
            })
    }

    /// Batch path: read-only, natural store order, at most `batch_max_records` items.
    pub async fn get_batch_stimuli(
        &self,
        pool: &CollectionRef,
        limit: Option<usize>,
    ) -> Result<Vec<StimulusItem>, AssignError> {
        let max = limit
            .unwrap_or(self.cfg.batch_max_records)
            .min(self.cfg.batch_max_records);
        let items = self
            .read_with_retry("fetch_batch", || self.store.fetch_batch(pool, max))
            .await?;
        debug!(target: "assign", %pool, max, returned = items.len(), "batch served");
        Ok(items)
    }

    /// Run an idempotent read under the call timeout, retrying retryable failures with back-off.
    async fn read_with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            match bounded(self.cfg.call_timeout(), call()).await {
                Err(e) if e.is_retryable() && attempt < self.cfg.read_retries => {
                    attempt += 1;
                    count_store_error(op);
                    let delay = self.cfg.read_backoff(attempt);
                    warn!(target: "store", op, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying store read");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if !matches!(e, StoreError::PoolNotFound(_)) {
                        count_store_error(op);
                    }
                    return Err(e);
                }
                ok => return ok,
            }
        }
    }
}

fn count_store_error(op: &'static str) {
    counter!(STORE_ERRORS_TOTAL, "op" => op).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::memory::MemoryStore;
    use crate::pool::{ItemId, TiebreakKey};
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn pool() -> CollectionRef {
        CollectionRef::new("stimuli", "photodraw2")
    }

    fn item(id: &str, key: i64, served: usize) -> StimulusItem {
        let mut payload = Map::new();
        payload.insert("category".into(), json!(id));
        StimulusItem::new(id, Some(TiebreakKey::Int(key)), payload)
            .with_served_to((0..served).map(|i| ConsumerId(format!("seed{i}"))))
    }

    fn fallback(n: usize) -> FallbackSampler {
        FallbackSampler::from_objects(
            (0..n)
                .map(|i| {
                    let mut m = Map::new();
                    m.insert("_id".into(), json!(format!("local-{i}")));
                    m
                })
                .collect(),
        )
    }

    fn service_with(store: Arc<MemoryStore>, mode: AssignMode) -> AssignmentService {
        let cfg = AssignConfig {
            mode,
            ..AssignConfig::default()
        };
        AssignmentService::new(store, fallback(3), cfg)
    }

    fn req(consumer: &str) -> ConsumptionRequest {
        ConsumptionRequest::single(pool(), ConsumerId(consumer.into()))
    }

    fn served_counts(store: &MemoryStore) -> Vec<(String, usize)> {
        store
            .snapshot(&pool())
            .into_iter()
            .map(|i| (i.id.0.clone(), i.num_served()))
            .collect()
    }

    async fn abc_scenario(mode: AssignMode) {
        let store = Arc::new(MemoryStore::new());
        // A and C start unserved with A's key below C's; B's key is lowest of all.
        store.seed_pool(pool(), vec![item("A", 1, 0), item("B", 0, 1), item("C", 2, 0)]);
        let svc = service_with(store.clone(), mode);

        let first = svc.get_single_stimulus(&req("g1")).await.unwrap();
        assert_eq!(first.item.id, ItemId("A".into()));
        assert_eq!(first.provenance, Provenance::Tracked);
        assert_eq!(first.item.num_served(), 1);

        let second = svc.get_single_stimulus(&req("g2")).await.unwrap();
        assert_eq!(second.item.id, ItemId("C".into()));

        let third = svc.get_single_stimulus(&req("g3")).await.unwrap();
        assert_eq!(third.item.id, ItemId("B".into()));

        assert_eq!(
            served_counts(&store),
            vec![("A".into(), 1), ("B".into(), 2), ("C".into(), 1)]
        );
    }

    #[tokio::test]
    async fn abc_scenario_atomic() {
        abc_scenario(AssignMode::Atomic).await;
    }

    #[tokio::test]
    async fn abc_scenario_legacy() {
        abc_scenario(AssignMode::Legacy).await;
    }

    #[tokio::test]
    async fn full_pass_leaves_gap_of_at_most_one() {
        let store = Arc::new(MemoryStore::new());
        store.seed_pool(
            pool(),
            vec![item("a", 3, 2), item("b", 1, 0), item("c", 2, 1), item("d", 0, 0), item("e", 4, 0)],
        );
        let svc = service_with(store.clone(), AssignMode::Atomic);

        for i in 0..12 {
            svc.get_single_stimulus(&req(&format!("g{i}"))).await.unwrap();
        }
        let counts: Vec<usize> = served_counts(&store).into_iter().map(|(_, c)| c).collect();
        let max = counts.iter().max().unwrap();
        let min = counts.iter().min().unwrap();
        assert!(max - min <= 1, "counts {counts:?}");
    }

    #[tokio::test]
    async fn ties_are_broken_by_key_on_every_run() {
        for _ in 0..5 {
            let store = Arc::new(MemoryStore::new());
            store.seed_pool(pool(), vec![item("x", 9, 0), item("y", 2, 0), item("z", 5, 0)]);
            let svc = service_with(store, AssignMode::Atomic);
            let got = svc.get_single_stimulus(&req("g")).await.unwrap();
            assert_eq!(got.item.id, ItemId("y".into()));
        }
    }

    #[tokio::test]
    async fn absent_pool_falls_back_without_touching_other_pools() {
        let store = Arc::new(MemoryStore::new());
        let other = CollectionRef::new("stimuli", "other");
        store.seed_pool(other.clone(), vec![item("keep", 0, 0)]);
        let svc = service_with(store.clone(), AssignMode::Atomic);

        let got = svc.get_single_stimulus(&req("g1")).await.unwrap();
        assert_eq!(got.provenance, Provenance::Fallback);
        assert!(got.item.id.0.starts_with("local-"));
        assert_eq!(store.snapshot(&other)[0].num_served(), 0);
    }

    #[tokio::test]
    async fn empty_fallback_surfaces_the_pool_error() {
        let store = Arc::new(MemoryStore::new());
        let svc = AssignmentService::new(store, FallbackSampler::default(), AssignConfig::default());
        let err = svc.get_single_stimulus(&req("g1")).await.unwrap_err();
        assert!(matches!(err, AssignError::PoolNotFound(_)));
    }

    #[tokio::test]
    async fn empty_consumer_is_rejected_without_fallback() {
        let store = Arc::new(MemoryStore::new());
        store.seed_pool(pool(), vec![item("a", 0, 0)]);
        let svc = service_with(store.clone(), AssignMode::Atomic);
        let err = svc.get_single_stimulus(&req("  ")).await.unwrap_err();
        assert!(matches!(err, AssignError::Validation(_)));
        assert_eq!(store.snapshot(&pool())[0].num_served(), 0);
    }

    #[tokio::test]
    async fn batch_is_read_only_and_caps_at_pool_size() {
        let store = Arc::new(MemoryStore::new());
        let items: Vec<_> = (0..10).map(|i| item(&format!("s{i}"), i, (i % 3) as usize)).collect();
        store.seed_pool(pool(), items);
        let before = store.snapshot(&pool());
        let svc = service_with(store.clone(), AssignMode::Atomic);

        let got = svc.get_batch_stimuli(&pool(), None).await.unwrap();
        assert_eq!(got.len(), 10);
        let got = svc.get_batch_stimuli(&pool(), Some(10_000)).await.unwrap();
        assert_eq!(got.len(), 10);
        let got = svc.get_batch_stimuli(&pool(), Some(4)).await.unwrap();
        assert_eq!(got.len(), 4);

        assert_eq!(store.snapshot(&pool()), before);
    }

    #[tokio::test]
    async fn request_key_replays_instead_of_consuming_again() {
        let store = Arc::new(MemoryStore::new());
        store.seed_pool(pool(), vec![item("a", 0, 0), item("b", 1, 0)]);
        let svc = service_with(store.clone(), AssignMode::Atomic);
        let r = req("g1").with_request_key("g1-trial-0");

        let first = svc.get_single_stimulus(&r).await.unwrap();
        let again = svc.get_single_stimulus(&r).await.unwrap();
        assert_eq!(first.provenance, Provenance::Tracked);
        assert_eq!(again.provenance, Provenance::Replay);
        assert_eq!(again.item.id, first.item.id);
        assert_eq!(served_counts(&store), vec![("a".into(), 1), ("b".into(), 0)]);
    }

    #[tokio::test]
    async fn request_keys_are_scoped_to_the_consumer() {
        let store = Arc::new(MemoryStore::new());
        store.seed_pool(pool(), vec![item("s0", 0, 0), item("s1", 1, 0)]);
        let svc = service_with(store.clone(), AssignMode::Atomic);

        let alice = svc
            .get_single_stimulus(&req("alice").with_request_key("trial-1"))
            .await
            .unwrap();
        let bob = svc
            .get_single_stimulus(&req("bob").with_request_key("trial-1"))
            .await
            .unwrap();

        assert_eq!(alice.provenance, Provenance::Tracked);
        assert_eq!(bob.provenance, Provenance::Tracked);
        assert_eq!(alice.item.id, ItemId("s0".into()));
        assert_eq!(bob.item.id, ItemId("s1".into()));
        assert_eq!(bob.item.served_to(), &[ConsumerId("bob".into())]);
        assert_eq!(served_counts(&store), vec![("s0".into(), 1), ("s1".into(), 1)]);
    }

    /// Store whose claims always lose, to exercise the retry bound.
    struct AlwaysConflict(MemoryStore);

    #[async_trait::async_trait]
    impl StimulusStore for AlwaysConflict {
        async fn least_served(&self, p: &CollectionRef, n: usize) -> Result<Vec<StimulusItem>, StoreError> {
            self.0.least_served(p, n).await
        }
        async fn mark_consumed(&self, p: &CollectionRef, i: &ItemId, c: &ConsumerId) -> Result<(), StoreError> {
            self.0.mark_consumed(p, i, c).await
        }
        async fn claim(&self, _p: &CollectionRef, _c: &Claim) -> Result<ClaimOutcome, StoreError> {
            Ok(ClaimOutcome::Conflict)
        }
        async fn find_claimed(
            &self,
            p: &CollectionRef,
            c: &ConsumerId,
            k: &str,
        ) -> Result<Option<StimulusItem>, StoreError> {
            self.0.find_claimed(p, c, k).await
        }
        async fn fetch_batch(&self, p: &CollectionRef, m: usize) -> Result<Vec<StimulusItem>, StoreError> {
            self.0.fetch_batch(p, m).await
        }
        fn backend(&self) -> &'static str {
            "always-conflict"
        }
    }

    #[tokio::test]
    async fn bounded_claim_retries_end_in_exhaustion() {
        let inner = MemoryStore::new();
        inner.seed_pool(pool(), vec![item("a", 0, 0)]);
        let cfg = AssignConfig {
            max_claim_attempts: 3,
            ..AssignConfig::default()
        };
        let svc = AssignmentService::new(Arc::new(AlwaysConflict(inner)), fallback(1), cfg);

        let err = svc.assign_tracked(&req("g1")).await.unwrap_err();
        assert!(matches!(err, AssignError::PoolExhausted { attempts: 3, .. }));

        let degraded = svc.get_single_stimulus(&req("g1")).await.unwrap();
        assert_eq!(degraded.provenance, Provenance::Fallback);
    }

    /// Store that times out the first `fail_first` reads.
    struct Flaky {
        inner: MemoryStore,
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl StimulusStore for Flaky {
        async fn least_served(&self, p: &CollectionRef, n: usize) -> Result<Vec<StimulusItem>, StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                return Err(StoreError::Timeout(Duration::from_millis(1)));
            }
            self.inner.least_served(p, n).await
        }
        async fn mark_consumed(&self, p: &CollectionRef, i: &ItemId, c: &ConsumerId) -> Result<(), StoreError> {
            self.inner.mark_consumed(p, i, c).await
        }
        async fn claim(&self, p: &CollectionRef, c: &Claim) -> Result<ClaimOutcome, StoreError> {
            self.inner.claim(p, c).await
        }
        async fn find_claimed(
            &self,
            p: &CollectionRef,
            c: &ConsumerId,
            k: &str,
        ) -> Result<Option<StimulusItem>, StoreError> {
            self.inner.find_claimed(p, c, k).await
        }
        async fn fetch_batch(&self, p: &CollectionRef, m: usize) -> Result<Vec<StimulusItem>, StoreError> {
            self.inner.fetch_batch(p, m).await
        }
        fn backend(&self) -> &'static str {
            "flaky"
        }
    }

    fn flaky(fail_first: u32) -> Flaky {
        let inner = MemoryStore::new();
        inner.seed_pool(pool(), vec![item("a", 0, 0)]);
        Flaky {
            inner,
            fail_first,
            calls: AtomicU32::new(0),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_read_failures_are_retried() {
        let svc = AssignmentService::new(Arc::new(flaky(2)), fallback(1), AssignConfig::default());
        let got = svc.get_single_stimulus(&req("g1")).await.unwrap();
        assert_eq!(got.provenance, Provenance::Tracked);
        assert_eq!(got.item.id, ItemId("a".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_store_falls_back_after_retries() {
        let svc = AssignmentService::new(Arc::new(flaky(100)), fallback(2), AssignConfig::default());
        let got = svc.get_single_stimulus(&req("g1")).await.unwrap();
        assert_eq!(got.provenance, Provenance::Fallback);

        let err = svc.assign_tracked(&req("g1")).await.unwrap_err();
        assert!(matches!(err, AssignError::Store(StoreError::Timeout(_))));
    }
}
