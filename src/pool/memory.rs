// src/pool/memory.rs
//! In-process document store. Backs the test suite and `backend = "memory"` runs.
//!
//! Each operation takes the lock once, so a claim's check and write happen together,
//! the same guarantee the Mongo backend gets from a filtered `update_one`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{
    Claim, ClaimOutcome, CollectionRef, ConsumerId, ItemId, RecordStore, StimulusItem, StimulusStore,
};
use crate::error::StoreError;

#[derive(Debug, Default)]
pub struct MemoryStore {
    pools: RwLock<HashMap<CollectionRef, Vec<StimulusItem>>>,
    records: RwLock<HashMap<CollectionRef, Vec<Map<String, Value>>>>,
    next_record_id: AtomicU64,
}

/// One pool in a seed file.
#[derive(Debug, Deserialize)]
struct SeedPool {
    dbname: String,
    colname: String,
    items: Vec<StimulusItem>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load pools from a JSON array of `{dbname, colname, items: [...]}`.
    pub fn from_seed_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading pool seed from {}", path.display()))?;
        let seeds: Vec<SeedPool> = serde_json::from_str(&content)
            .with_context(|| format!("parsing pool seed {}", path.display()))?;
        let store = Self::new();
        for s in seeds {
            store.seed_pool(CollectionRef::new(s.dbname, s.colname), s.items);
        }
        Ok(store)
    }

    /// Replace a pool's contents. Insertion order becomes the natural batch order.
    pub fn seed_pool(&self, pool: CollectionRef, items: Vec<StimulusItem>) {
        self.pools.write().insert(pool, items);
    }

    /// Current items of a pool in natural order (empty when absent).
    pub fn snapshot(&self, pool: &CollectionRef) -> Vec<StimulusItem> {
        self.pools.read().get(pool).cloned().unwrap_or_default()
    }

    pub fn records(&self, target: &CollectionRef) -> Vec<Map<String, Value>> {
        self.records.read().get(target).cloned().unwrap_or_default()
    }

    pub fn pool_names(&self) -> Vec<CollectionRef> {
        let mut v: Vec<_> = self.pools.read().keys().cloned().collect();
        v.sort();
        v
    }
}

#[async_trait::async_trait]
impl StimulusStore for MemoryStore {
    async fn least_served(&self, pool: &CollectionRef, n: usize) -> Result<Vec<StimulusItem>, StoreError> {
        let guard = self.pools.read();
        let items = match guard.get(pool) {
            Some(items) if !items.is_empty() => items,
            _ => return Err(StoreError::PoolNotFound(pool.clone())),
        };
        let mut ranked: Vec<&StimulusItem> = items.iter().collect();
        ranked.sort_by(|a, b| a.rank_cmp(b));
        Ok(ranked.into_iter().take(n).cloned().collect())
    }

    async fn mark_consumed(
        &self,
        pool: &CollectionRef,
        item: &ItemId,
        consumer: &ConsumerId,
    ) -> Result<(), StoreError> {
        let mut guard = self.pools.write();
        let found = guard
            .get_mut(pool)
            .and_then(|items| items.iter_mut().find(|it| &it.id == item));
        match found {
            Some(it) => {
                it.record_consumer(consumer, None);
                Ok(())
            }
            None => Err(StoreError::ItemNotFound {
                pool: pool.clone(),
                item: item.clone(),
            }),
        }
    }

    async fn claim(&self, pool: &CollectionRef, claim: &Claim) -> Result<ClaimOutcome, StoreError> {
        let mut guard = self.pools.write();
        let items = guard.get_mut(pool).map(Vec::as_mut_slice).unwrap_or_default();
        if let Some(key) = claim.request_key.as_deref() {
            if items.iter().any(|it| it.claimed_by(&claim.consumer, key)) {
                return Ok(ClaimOutcome::Duplicate);
            }
        }
        let Some(it) = items.iter_mut().find(|it| it.id == claim.item) else {
            return Err(StoreError::ItemNotFound {
                pool: pool.clone(),
                item: claim.item.clone(),
            });
        };
        if it.num_served() != claim.observed_served {
            return Ok(ClaimOutcome::Conflict);
        }
        it.record_consumer(&claim.consumer, claim.request_key.as_deref());
        Ok(ClaimOutcome::Claimed(it.clone()))
    }

    async fn find_claimed(
        &self,
        pool: &CollectionRef,
        consumer: &ConsumerId,
        request_key: &str,
    ) -> Result<Option<StimulusItem>, StoreError> {
        let guard = self.pools.read();
        Ok(guard.get(pool).and_then(|items| {
            items
                .iter()
                .find(|it| it.claimed_by(consumer, request_key))
                .cloned()
        }))
    }

    async fn fetch_batch(&self, pool: &CollectionRef, max: usize) -> Result<Vec<StimulusItem>, StoreError> {
        let guard = self.pools.read();
        Ok(guard
            .get(pool)
            .map(|items| items.iter().take(max).cloned().collect())
            .unwrap_or_default())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, target: &CollectionRef, mut doc: Map<String, Value>) -> Result<String, StoreError> {
        let id = match doc.get("_id") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => {
                let id = format!("rec-{}", self.next_record_id.fetch_add(1, Ordering::Relaxed));
                doc.insert("_id".into(), Value::String(id.clone()));
                id
            }
        };
        self.records.write().entry(target.clone()).or_default().push(doc);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TiebreakKey;
    use serde_json::json;

    fn pool() -> CollectionRef {
        CollectionRef::new("stimuli", "photodraw2")
    }

    fn item(id: &str, key: i64, served: usize) -> StimulusItem {
        StimulusItem::new(id, Some(TiebreakKey::Int(key)), Map::new())
            .with_served_to((0..served).map(|i| ConsumerId(format!("seed{i}"))))
    }

    fn gid(s: &str) -> ConsumerId {
        ConsumerId(s.into())
    }

    #[tokio::test]
    async fn least_served_on_absent_or_empty_pool_is_not_found() {
        let store = MemoryStore::new();
        let err = store.least_served(&pool(), 1).await.unwrap_err();
        assert!(matches!(err, StoreError::PoolNotFound(_)));

        store.seed_pool(pool(), vec![]);
        let err = store.least_served(&pool(), 1).await.unwrap_err();
        assert!(matches!(err, StoreError::PoolNotFound(_)));
    }

    #[tokio::test]
    async fn least_served_returns_whole_pool_when_n_is_larger() {
        let store = MemoryStore::new();
        store.seed_pool(pool(), vec![item("a", 2, 1), item("b", 1, 0)]);
        let got = store.least_served(&pool(), 50).await.unwrap();
        let ids: Vec<_> = got.iter().map(|i| i.id.0.clone()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn mark_consumed_is_monotonic_and_not_idempotent() {
        let store = MemoryStore::new();
        store.seed_pool(pool(), vec![item("a", 0, 2)]);
        let id = ItemId("a".into());

        store.mark_consumed(&pool(), &id, &gid("g1")).await.unwrap();
        let after = store.snapshot(&pool());
        assert_eq!(after[0].num_served(), 3);
        assert_eq!(after[0].served_to().last(), Some(&gid("g1")));

        // Same pair again appends a duplicate entry.
        store.mark_consumed(&pool(), &id, &gid("g1")).await.unwrap();
        assert_eq!(store.snapshot(&pool())[0].num_served(), 4);
    }

    #[tokio::test]
    async fn mark_consumed_unknown_item_errors() {
        let store = MemoryStore::new();
        store.seed_pool(pool(), vec![item("a", 0, 0)]);
        let err = store
            .mark_consumed(&pool(), &ItemId("zzz".into()), &gid("g1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ItemNotFound { .. }));
    }

    #[tokio::test]
    async fn claim_succeeds_once_per_observed_count() {
        let store = MemoryStore::new();
        store.seed_pool(pool(), vec![item("a", 0, 0)]);
        let claim = |consumer: &str| Claim {
            item: ItemId("a".into()),
            observed_served: 0,
            consumer: gid(consumer),
            request_key: None,
        };

        let first = store.claim(&pool(), &claim("g1")).await.unwrap();
        match first {
            ClaimOutcome::Claimed(it) => assert_eq!(it.num_served(), 1),
            other => panic!("expected claim, got {other:?}"),
        }
        let second = store.claim(&pool(), &claim("g2")).await.unwrap();
        assert_eq!(second, ClaimOutcome::Conflict);
        assert_eq!(store.snapshot(&pool())[0].served_to(), &[gid("g1")]);
    }

    #[tokio::test]
    async fn find_claimed_matches_request_key() {
        let store = MemoryStore::new();
        store.seed_pool(pool(), vec![item("a", 0, 0), item("b", 1, 0)]);
        let claim = Claim {
            item: ItemId("b".into()),
            observed_served: 0,
            consumer: gid("g1"),
            request_key: Some("req-42".into()),
        };
        store.claim(&pool(), &claim).await.unwrap();

        let hit = store.find_claimed(&pool(), &gid("g1"), "req-42").await.unwrap();
        assert_eq!(hit.map(|i| i.id), Some(ItemId("b".into())));
        assert!(store.find_claimed(&pool(), &gid("g1"), "other").await.unwrap().is_none());
        // Same key from a different consumer is a different request.
        assert!(store.find_claimed(&pool(), &gid("g2"), "req-42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_with_a_held_key_is_a_duplicate_anywhere_in_the_pool() {
        let store = MemoryStore::new();
        store.seed_pool(pool(), vec![item("a", 0, 0), item("b", 1, 0)]);
        let claim = |item: &str, consumer: &str| Claim {
            item: ItemId(item.into()),
            observed_served: 0,
            consumer: gid(consumer),
            request_key: Some("retry-7".into()),
        };

        assert!(matches!(
            store.claim(&pool(), &claim("a", "g1")).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        // Different item, same consumer and key: refused, nothing recorded.
        assert_eq!(
            store.claim(&pool(), &claim("b", "g1")).await.unwrap(),
            ClaimOutcome::Duplicate
        );
        assert_eq!(store.snapshot(&pool())[1].num_served(), 0);
        // Another consumer may use the same key.
        assert!(matches!(
            store.claim(&pool(), &claim("b", "g2")).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn fetch_batch_keeps_natural_order_and_absent_is_empty() {
        let store = MemoryStore::new();
        assert!(store.fetch_batch(&pool(), 10).await.unwrap().is_empty());

        store.seed_pool(pool(), vec![item("z", 0, 3), item("a", 1, 0)]);
        let got = store.fetch_batch(&pool(), 10).await.unwrap();
        let ids: Vec<_> = got.iter().map(|i| i.id.0.clone()).collect();
        assert_eq!(ids, vec!["z", "a"]);
    }

    #[tokio::test]
    async fn insert_creates_collection_and_assigns_id() {
        let store = MemoryStore::new();
        let target = CollectionRef::new("photodraw", "kiddraw");
        let mut doc = Map::new();
        doc.insert("eventType".into(), json!("stroke"));

        let id = store.insert(&target, doc).await.unwrap();
        let rows = store.records(&target);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["_id"], json!(id));
        assert_eq!(rows[0]["eventType"], json!("stroke"));
    }

    #[tokio::test]
    async fn insert_reports_a_caller_supplied_id() {
        let store = MemoryStore::new();
        let target = CollectionRef::new("photodraw", "kiddraw");
        let mut doc = Map::new();
        doc.insert("_id".into(), json!("trial-0001"));

        let id = store.insert(&target, doc).await.unwrap();
        assert_eq!(id, "trial-0001");
        assert_eq!(store.records(&target)[0]["_id"], json!("trial-0001"));
    }

    #[test]
    fn seed_file_loads_pools() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.json");
        std::fs::write(
            &path,
            r#"[{"dbname":"stimuli","colname":"photodraw2","items":[
                {"_id":"a","shuffler_ind":0,"games":[],"category":"cat"},
                {"_id":"b","shuffler_ind":1,"games":["g0"],"category":"dog"}
            ]}]"#,
        )
        .unwrap();

        let store = MemoryStore::from_seed_file(&path).unwrap();
        assert_eq!(store.pool_names(), vec![pool()]);
        let items = store.snapshot(&pool());
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].num_served(), 1);
    }
}
