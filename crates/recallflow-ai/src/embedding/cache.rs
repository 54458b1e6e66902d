use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use super::{EmbeddingProvider, ensure_vector_count};
use crate::error::Result;

#[derive(Default)]
struct CacheSlots {
    vectors: HashMap<String, Vec<f32>>,
    /// Keys in insertion order; the front is evicted first.
    order: VecDeque<String>,
}

/// Bounded vector cache keyed by `sha256(model ":" text)`.
pub struct EmbeddingCache {
    slots: RwLock<CacheSlots>,
    capacity: usize,
}

impl EmbeddingCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(CacheSlots::default()),
            capacity,
        }
    }

    fn key(text: &str, model: &str) -> String {
        let digest = Sha256::new()
            .chain_update(model.as_bytes())
            .chain_update(b":")
            .chain_update(text.as_bytes())
            .finalize();
        hex::encode(digest)
    }

    pub fn get(&self, text: &str, model: &str) -> Option<Vec<f32>> {
        self.slots.read().vectors.get(&Self::key(text, model)).cloned()
    }

    pub fn put(&self, text: &str, model: &str, vector: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        let key = Self::key(text, model);
        let mut slots = self.slots.write();
        if slots.vectors.insert(key.clone(), vector).is_some() {
            return;
        }
        slots.order.push_back(key);
        while slots.order.len() > self.capacity {
            if let Some(oldest) = slots.order.pop_front() {
                slots.vectors.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Embedding provider decorator that serves repeated texts from an
/// [`EmbeddingCache`].
pub struct CachedEmbedding {
    inner: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
}

impl CachedEmbedding {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, max_entries: usize) -> Self {
        Self {
            inner,
            cache: EmbeddingCache::new(max_entries),
        }
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.inner.model_name();
        if let Some(hit) = self.cache.get(text, model) {
            return Ok(hit);
        }
        let embedding = self.inner.embed(text).await?;
        self.cache.put(text, model, embedding.clone());
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.inner.model_name().to_string();
        let mut slots: Vec<Option<Vec<f32>>> =
            texts.iter().map(|t| self.cache.get(t, &model)).collect();

        let missing: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.is_none().then_some(i))
            .collect();

        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let fetched = self.inner.embed_batch(&batch).await?;
            ensure_vector_count(batch.len(), &fetched)?;
            for (idx, embedding) in missing.into_iter().zip(fetched) {
                self.cache.put(&texts[idx], &model, embedding.clone());
                slots[idx] = Some(embedding);
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}
