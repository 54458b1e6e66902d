use async_trait::async_trait;

use crate::error::{AiError, Result};

/// Turns memory contents into vectors for the long-term store.
///
/// The engine never inspects the vectors; it only hands them to
/// [`MemoryStore`](crate::memory::MemoryStore) alongside their records.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// One vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;

    /// Identifier used to key cached vectors.
    fn model_name(&self) -> &str;
}

/// Fail with [`AiError::EmbeddingCountMismatch`] unless `vectors` has
/// exactly `expected` entries.
pub fn ensure_vector_count(expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() == expected {
        Ok(())
    } else {
        Err(AiError::EmbeddingCountMismatch {
            expected,
            actual: vectors.len(),
        })
    }
}
