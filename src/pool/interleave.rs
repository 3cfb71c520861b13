// src/pool/interleave.rs
//! Store wrapper that hands control back to the scheduler around every call.
//!
//! The in-memory backend completes each operation under one lock acquisition, so
//! concurrent requests never overlap between a read and the write that follows
//! it. Wrapping it in [`Interleaved`] restores the gaps a networked store has,
//! which is what the pool simulator and the concurrency tests need to exercise
//! claim conflicts.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Claim, ClaimOutcome, CollectionRef, ConsumerId, ItemId, RecordStore, StimulusItem, StimulusStore};
use crate::error::StoreError;

pub struct Interleaved<S> {
    inner: S,
    yields: usize,
}

impl<S> Interleaved<S> {
    /// `yields` scheduler yields before and after each delegated call.
    pub fn new(inner: S, yields: usize) -> Self {
        Self { inner, yields }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn pause(&self) {
        for _ in 0..self.yields {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl<S: StimulusStore> StimulusStore for Interleaved<S> {
    async fn least_served(&self, pool: &CollectionRef, n: usize) -> Result<Vec<StimulusItem>, StoreError> {
        self.pause().await;
        let res = self.inner.least_served(pool, n).await;
        self.pause().await;
        res
    }

    async fn mark_consumed(
        &self,
        pool: &CollectionRef,
        item: &ItemId,
        consumer: &ConsumerId,
    ) -> Result<(), StoreError> {
        self.pause().await;
        self.inner.mark_consumed(pool, item, consumer).await
    }

    async fn claim(&self, pool: &CollectionRef, claim: &Claim) -> Result<ClaimOutcome, StoreError> {
        self.pause().await;
        self.inner.claim(pool, claim).await
    }

    async fn find_claimed(
        &self,
        pool: &CollectionRef,
        consumer: &ConsumerId,
        request_key: &str,
    ) -> Result<Option<StimulusItem>, StoreError> {
        self.pause().await;
        self.inner.find_claimed(pool, consumer, request_key).await
    }

    async fn fetch_batch(&self, pool: &CollectionRef, max: usize) -> Result<Vec<StimulusItem>, StoreError> {
        self.inner.fetch_batch(pool, max).await
    }

    fn backend(&self) -> &'static str {
        self.inner.backend()
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for Interleaved<S> {
    async fn insert(&self, target: &CollectionRef, doc: Map<String, Value>) -> Result<String, StoreError> {
        self.inner.insert(target, doc).await
    }
}
