// src/pool/mongo.rs
//! MongoDB backend. One [`mongodb::Client`] per process, opened with
//! [`connect_with_retry`] before the router is served and closed at shutdown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use mongodb::bson::{self, doc, oid::ObjectId, Bson, Document};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{error, info};

use super::{
    claim_tag, Claim, ClaimOutcome, CollectionRef, ConsumerId, ItemId, RecordStore, StimulusItem,
    StimulusStore,
};
use crate::error::StoreError;

#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    /// Pools whose unique `claimKeys` index is known to exist.
    keyed_pools: Arc<Mutex<HashSet<CollectionRef>>>,
}

/// Keep dialing until the server answers a ping. Logs every failure and sleeps `delay`
/// between attempts; there is no upper bound on attempts.
pub async fn connect_with_retry(uri: &str, delay: Duration) -> MongoStore {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        match MongoStore::connect(uri).await {
            Ok(store) => {
                info!(target: "store", attempt, "connected successfully to mongodb");
                return store;
            }
            Err(e) => {
                error!(target: "store", attempt, error = %e, retry_in_ms = delay.as_millis() as u64, "error connecting to mongodb");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

impl MongoStore {
    /// Single connection attempt. `Client::with_uri_str` is lazy, so ping to prove reachability.
    pub async fn connect(uri: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await.map_err(connection_error)?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(connection_error)?;
        Ok(Self {
            client,
            keyed_pools: Arc::default(),
        })
    }

    pub async fn close(self) {
        self.client.shutdown().await;
    }

    fn collection(&self, target: &CollectionRef) -> Collection<Document> {
        self.client
            .database(&target.database)
            .collection::<Document>(&target.collection)
    }

    /// A request key may sit on at most one item per pool. The index is partial so
    /// items that never saw a keyed claim stay out of it.
    async fn ensure_claim_index(&self, pool: &CollectionRef) -> Result<(), StoreError> {
        if self.keyed_pools.lock().contains(pool) {
            return Ok(());
        }
        let model = IndexModel::builder()
            .keys(doc! { "claimKeys": 1 })
            .options(
                IndexOptions::builder()
                    .name(CLAIM_KEY_INDEX.to_string())
                    .unique(true)
                    .partial_filter_expression(doc! { "claimKeys": { "$type": "string" } })
                    .build(),
            )
            .build();
        self.collection(pool)
            .create_index(model)
            .await
            .map_err(operation_error)?;
        info!(target: "store", %pool, "claim key index ready");
        self.keyed_pools.lock().insert(pool.clone());
        Ok(())
    }
}

const CLAIM_KEY_INDEX: &str = "claimKeys_unique";

#[async_trait::async_trait]
impl StimulusStore for MongoStore {
    async fn least_served(&self, pool: &CollectionRef, n: usize) -> Result<Vec<StimulusItem>, StoreError> {
        // Rank on the size of the log itself, never on the stored counter.
        let pipeline = vec![
            doc! { "$addFields": { "numGames": { "$size": { "$ifNull": ["$games", []] } } } },
            doc! { "$sort": { "numGames": 1, "shuffler_ind": 1, "_id": 1 } },
            doc! { "$limit": to_i64(n) },
        ];
        let cursor = self
            .collection(pool)
            .aggregate(pipeline)
            .await
            .map_err(operation_error)?;
        let docs: Vec<Document> = cursor.try_collect().await.map_err(operation_error)?;
        if docs.is_empty() {
            return Err(StoreError::PoolNotFound(pool.clone()));
        }
        docs.into_iter().map(item_from_document).collect()
    }

    async fn mark_consumed(
        &self,
        pool: &CollectionRef,
        item: &ItemId,
        consumer: &ConsumerId,
    ) -> Result<(), StoreError> {
        let res = self
            .collection(pool)
            .update_one(
                doc! { "_id": id_to_bson(item) },
                doc! { "$push": { "games": consumer.as_str() }, "$inc": { "numGames": 1 } },
            )
            .await
            .map_err(operation_error)?;
        if res.matched_count == 0 {
            return Err(StoreError::ItemNotFound {
                pool: pool.clone(),
                item: item.clone(),
            });
        }
        Ok(())
    }

    async fn claim(&self, pool: &CollectionRef, claim: &Claim) -> Result<ClaimOutcome, StoreError> {
        let coll = self.collection(pool);
        let id = id_to_bson(&claim.item);
        let mut push = doc! { "games": claim.consumer.as_str() };
        if let Some(key) = &claim.request_key {
            self.ensure_claim_index(pool).await?;
            push.insert("claimKeys", claim_tag(&claim.consumer, key));
        }
        let res = match coll
            .update_one(
                claim_filter(id.clone(), claim.observed_served),
                doc! { "$push": push, "$inc": { "numGames": 1 } },
            )
            .await
        {
            Ok(res) => res,
            Err(e) if is_duplicate_key(&e) => return Ok(ClaimOutcome::Duplicate),
            Err(e) => return Err(operation_error(e)),
        };
        if res.matched_count == 0 {
            // Distinguish a lost race from a vanished item.
            let exists = coll
                .find_one(doc! { "_id": id })
                .await
                .map_err(operation_error)?;
            return match exists {
                Some(_) => Ok(ClaimOutcome::Conflict),
                None => Err(StoreError::ItemNotFound {
                    pool: pool.clone(),
                    item: claim.item.clone(),
                }),
            };
        }

        let mut claimed = coll
            .find_one(doc! { "_id": id_to_bson(&claim.item) })
            .await
            .map_err(operation_error)?
            .map(item_from_document)
            .transpose()?
            .ok_or_else(|| StoreError::ItemNotFound {
                pool: pool.clone(),
                item: claim.item.clone(),
            })?;
        // Another claim may have landed between our update and the re-read; report
        // the state our own write produced.
        claimed.truncate_served(claim.observed_served + 1);
        Ok(ClaimOutcome::Claimed(claimed))
    }

    async fn find_claimed(
        &self,
        pool: &CollectionRef,
        consumer: &ConsumerId,
        request_key: &str,
    ) -> Result<Option<StimulusItem>, StoreError> {
        self.collection(pool)
            .find_one(doc! { "claimKeys": claim_tag(consumer, request_key) })
            .await
            .map_err(operation_error)?
            .map(item_from_document)
            .transpose()
    }

    async fn fetch_batch(&self, pool: &CollectionRef, max: usize) -> Result<Vec<StimulusItem>, StoreError> {
        let cursor = self
            .collection(pool)
            .find(doc! {})
            .limit(to_i64(max))
            .await
            .map_err(operation_error)?;
        let docs: Vec<Document> = cursor.try_collect().await.map_err(operation_error)?;
        docs.into_iter().map(item_from_document).collect()
    }

    fn backend(&self) -> &'static str {
        "mongo"
    }
}

#[async_trait::async_trait]
impl RecordStore for MongoStore {
    async fn insert(&self, target: &CollectionRef, doc: Map<String, Value>) -> Result<String, StoreError> {
        let document = bson::to_document(&doc).map_err(|e| StoreError::Operation(e.to_string()))?;
        // Collections are created implicitly on first insert.
        let res = self
            .collection(target)
            .insert_one(document)
            .await
            .map_err(operation_error)?;
        Ok(bson_id_to_string(&res.inserted_id))
    }
}

fn connection_error(e: mongodb::error::Error) -> StoreError {
    StoreError::Connection(e.to_string())
}

fn operation_error(e: mongodb::error::Error) -> StoreError {
    use mongodb::error::ErrorKind;
    match *e.kind {
        ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) | ErrorKind::ConnectionPoolCleared { .. } => {
            StoreError::Connection(e.to_string())
        }
        _ => StoreError::Operation(e.to_string()),
    }
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    matches!(&*e.kind, ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == 11000)
}

/// Match the item only while its log still has `observed` entries. A missing `games`
/// field ranks as empty in `least_served`, so it must also count as empty here.
fn claim_filter(id: Bson, observed: usize) -> Document {
    if observed == 0 {
        doc! {
            "_id": id,
            "$or": [ { "games": { "$size": 0 } }, { "games": { "$exists": false } } ],
        }
    } else {
        doc! { "_id": id, "games": { "$size": to_i64(observed) } }
    }
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Ids that look like ObjectIds are queried as such; anything else as a plain string.
fn id_to_bson(id: &ItemId) -> Bson {
    ObjectId::parse_str(&id.0)
        .map(Bson::ObjectId)
        .unwrap_or_else(|_| Bson::String(id.0.clone()))
}

fn bson_id_to_string(b: &Bson) -> String {
    match b {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn item_from_document(mut doc: Document) -> Result<StimulusItem, StoreError> {
    let id = doc
        .remove("_id")
        .map(|b| bson_id_to_string(&b))
        .ok_or_else(|| StoreError::Operation("stimulus document without _id".into()))?;
    let mut json = Bson::Document(doc).into_relaxed_extjson();
    if let Value::Object(map) = &mut json {
        map.insert("_id".into(), Value::String(id));
    }
    serde_json::from_value(json).map_err(|e| StoreError::Operation(format!("malformed stimulus: {e}")))
}
