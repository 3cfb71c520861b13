// src/pool/mod.rs
//! Stimulus pool primitives: item model, collection references, and the
//! async store seam the assignment service talks to.
//!
//! Two backends implement [`StimulusStore`]: [`memory::MemoryStore`] for tests and
//! local runs, and [`mongo::MongoStore`] for deployments.

pub mod interleave;
pub mod memory;
pub mod mongo;

use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// A `(database, collection)` pair. Used for stimulus pools and results collections alike.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionRef {
    pub database: String,
    pub collection: String,
}

impl CollectionRef {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.database, self.collection)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of whoever consumed an item (the session's game id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(pub String);

impl ConsumerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Secondary sort key for equally-served items. Numbers order before strings and
/// compare by value whether stored as integer or double, matching how the
/// document store compares mixed BSON types. NaN sorts below every other number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TiebreakKey {
    Int(i64),
    Float(f64),
    Text(String),
}

impl TiebreakKey {
    fn cmp_numeric(a: f64, b: f64) -> Ordering {
        match (a.is_nan(), b.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        }
    }
}

impl Ord for TiebreakKey {
    fn cmp(&self, other: &Self) -> Ordering {
        use TiebreakKey::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Int(a), Float(b)) => Self::cmp_numeric(*a as f64, *b),
            (Float(a), Int(b)) => Self::cmp_numeric(*a, *b as f64),
            (Float(a), Float(b)) => Self::cmp_numeric(*a, *b),
            (Text(a), Text(b)) => a.cmp(b),
            (Text(_), _) => Ordering::Greater,
            (_, Text(_)) => Ordering::Less,
        }
    }
}

impl PartialOrd for TiebreakKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TiebreakKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TiebreakKey {}

/// Stored form of a request key. Keys are scoped to the consumer that sent them, so
/// two participants reusing the same key never see each other's items.
pub fn claim_tag(consumer: &ConsumerId, request_key: &str) -> String {
    format!("{}\u{0}{}", consumer.as_str(), request_key)
}

/// One drawable prompt in a pool.
///
/// `num_served` is never stored on the struct: it is always `served_to.len()`,
/// so the count and the consumption log cannot drift apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredStimulus", into = "StoredStimulus")]
pub struct StimulusItem {
    pub id: ItemId,
    pub payload: Map<String, Value>,
    pub tiebreak_key: Option<TiebreakKey>,
    served_to: Vec<ConsumerId>,
    claim_keys: Vec<String>,
}

impl StimulusItem {
    pub fn new(id: impl Into<String>, tiebreak_key: Option<TiebreakKey>, payload: Map<String, Value>) -> Self {
        Self {
            id: ItemId(id.into()),
            payload,
            tiebreak_key,
            served_to: Vec::new(),
            claim_keys: Vec::new(),
        }
    }

    /// Builder used by seeds and tests to start an item with prior consumptions.
    pub fn with_served_to(mut self, consumers: impl IntoIterator<Item = ConsumerId>) -> Self {
        self.served_to = consumers.into_iter().collect();
        self
    }

    pub fn num_served(&self) -> usize {
        self.served_to.len()
    }

    pub fn served_to(&self) -> &[ConsumerId] {
        &self.served_to
    }

    pub fn claim_keys(&self) -> &[String] {
        &self.claim_keys
    }

    /// Whether `consumer` already claimed this item under `request_key`.
    pub fn claimed_by(&self, consumer: &ConsumerId, request_key: &str) -> bool {
        let tag = claim_tag(consumer, request_key);
        self.claim_keys.iter().any(|k| *k == tag)
    }

    /// Record one consumption event. The only mutation an item ever sees.
    pub(crate) fn record_consumer(&mut self, consumer: &ConsumerId, request_key: Option<&str>) {
        self.served_to.push(consumer.clone());
        if let Some(key) = request_key {
            self.claim_keys.push(claim_tag(consumer, key));
        }
    }

    /// Drop consumptions recorded after the first `len`; the log is append-only, so
    /// this recovers the item as it stood at an earlier write.
    pub(crate) fn truncate_served(&mut self, len: usize) {
        self.served_to.truncate(len);
    }

    /// Least-served ordering: `(num_served, tiebreak_key, id)`, missing keys first.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        self.num_served()
            .cmp(&other.num_served())
            .then_with(|| self.tiebreak_key.cmp(&other.tiebreak_key))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Store layout of an item; field names follow the collections the experiment
/// bulk-loads (`games`, `numGames`, `shuffler_ind`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredStimulus {
    #[serde(rename = "_id")]
    id: ItemId,
    #[serde(default)]
    games: Vec<ConsumerId>,
    // Written for readers of the raw collection; ignored on the way in.
    #[serde(rename = "numGames", default)]
    num_games: usize,
    #[serde(rename = "shuffler_ind", default, skip_serializing_if = "Option::is_none")]
    shuffler_ind: Option<TiebreakKey>,
    #[serde(rename = "claimKeys", default, skip_serializing)]
    claim_keys: Vec<String>,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

impl From<StoredStimulus> for StimulusItem {
    fn from(s: StoredStimulus) -> Self {
        Self {
            id: s.id,
            payload: s.payload,
            tiebreak_key: s.shuffler_ind,
            served_to: s.games,
            claim_keys: s.claim_keys,
        }
    }
}

impl From<StimulusItem> for StoredStimulus {
    fn from(it: StimulusItem) -> Self {
        Self {
            num_games: it.served_to.len(),
            id: it.id,
            games: it.served_to,
            shuffler_ind: it.tiebreak_key,
            claim_keys: it.claim_keys,
            payload: it.payload,
        }
    }
}

/// Conditional consumption: applies only while the item still has `observed_served` entries.
#[derive(Debug, Clone)]
pub struct Claim {
    pub item: ItemId,
    pub observed_served: usize,
    pub consumer: ConsumerId,
    pub request_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The item as it stands after the claim was recorded.
    Claimed(StimulusItem),
    /// Another consumer changed the item between read and claim.
    Conflict,
    /// The consumer already holds a claim under the same request key somewhere in the pool.
    Duplicate,
}

#[async_trait::async_trait]
pub trait StimulusStore: Send + Sync {
    /// Up to `n` items by least-served order. `PoolNotFound` when absent or empty.
    async fn least_served(&self, pool: &CollectionRef, n: usize) -> Result<Vec<StimulusItem>, StoreError>;

    /// Unconditional append + increment. Repeating the call appends again.
    async fn mark_consumed(
        &self,
        pool: &CollectionRef,
        item: &ItemId,
        consumer: &ConsumerId,
    ) -> Result<(), StoreError>;

    /// Atomic find-and-increment filtered on the observed count.
    async fn claim(&self, pool: &CollectionRef, claim: &Claim) -> Result<ClaimOutcome, StoreError>;

    /// Item `consumer` previously claimed under `request_key`, if any.
    async fn find_claimed(
        &self,
        pool: &CollectionRef,
        consumer: &ConsumerId,
        request_key: &str,
    ) -> Result<Option<StimulusItem>, StoreError>;

    /// Up to `max` items in natural store order. Read-only; absent pools give an empty list.
    async fn fetch_batch(&self, pool: &CollectionRef, max: usize) -> Result<Vec<StimulusItem>, StoreError>;

    fn backend(&self) -> &'static str;
}

#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Append one schema-free document, creating the collection on first use.
    /// Returns the id the store assigned.
    async fn insert(&self, target: &CollectionRef, doc: Map<String, Value>) -> Result<String, StoreError>;
}

/// Bound a store call; expiry becomes the retryable [`StoreError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
