// src/fallback.rs
//! Degraded-mode stimulus source: a static candidate list sampled uniformly at random.
//! Nothing sampled here is recorded anywhere, so it carries no fairness guarantee.

use std::path::Path;

use anyhow::{Context, Result};
use rand::seq::IndexedRandom;
use rand::Rng;
use serde_json::{Map, Value};

use crate::pool::StimulusItem;

#[derive(Debug, Clone, Default)]
pub struct FallbackSampler {
    candidates: Vec<StimulusItem>,
}

impl FallbackSampler {
    /// Candidates from raw objects. Ids come from `_id` / `id`, else `fallback-<index>`.
    pub fn from_objects(objects: Vec<Map<String, Value>>) -> Self {
        let candidates = objects
            .into_iter()
            .enumerate()
            .map(|(i, mut obj)| {
                let id = obj
                    .remove("_id")
                    .or_else(|| obj.remove("id"))
                    .map(|v| match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| format!("fallback-{i}"));
                StimulusItem::new(id, None, obj)
            })
            .collect();
        Self { candidates }
    }

    /// Load a JSON array of stimulus objects.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading fallback stimuli from {}", path.display()))?;
        let objects: Vec<Map<String, Value>> = serde_json::from_str(&data)
            .with_context(|| format!("parsing fallback stimuli {}", path.display()))?;
        Ok(Self::from_objects(objects))
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn candidates(&self) -> &[StimulusItem] {
        &self.candidates
    }

    pub fn sample(&self) -> Option<StimulusItem> {
        self.sample_with(&mut rand::rng())
    }

    pub fn sample_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<StimulusItem> {
        self.candidates.choose(rng).cloned()
    }
}
