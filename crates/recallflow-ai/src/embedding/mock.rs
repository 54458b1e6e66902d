//! Deterministic embedding provider for tests and offline tooling.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::EmbeddingProvider;
use crate::error::{AiError, Result};

/// Hash-derived embeddings with injectable failures.
#[derive(Debug, Default)]
pub struct MockEmbedding {
    dimension: usize,
    /// Number of vectors to drop from every batch response.
    batch_shortfall: usize,
    /// Texts containing this marker fail to embed.
    fail_marker: Option<String>,
    calls: AtomicUsize,
}

impl MockEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ..Default::default()
        }
    }

    /// Return `shortfall` fewer vectors than requested from `embed_batch`.
    pub fn with_batch_shortfall(mut self, shortfall: usize) -> Self {
        self.batch_shortfall = shortfall;
        self
    }

    /// Fail any text containing `marker`.
    pub fn failing_on(mut self, marker: impl Into<String>) -> Self {
        self.fail_marker = Some(marker.into());
        self
    }

    /// Number of provider calls served (single and batch).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(marker) = &self.fail_marker
            && text.contains(marker.as_str())
        {
            return Err(AiError::Embedding(format!("mock embedding refused: {text}")));
        }
        let digest = Sha256::digest(text.as_bytes());
        Ok((0..self.dimension)
            .map(|i| digest[i % digest.len()] as f32 / 255.0)
            .collect())
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.vector_for(text)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut vectors = texts
            .iter()
            .map(|t| self.vector_for(t))
            .collect::<Result<Vec<_>>>()?;
        let keep = vectors.len().saturating_sub(self.batch_shortfall);
        vectors.truncate(keep);
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vectors_are_deterministic() {
        let provider = MockEmbedding::new(8);
        let a = provider.embed("same text").await.unwrap();
        let b = provider.embed("same text").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[tokio::test]
    async fn shortfall_drops_vectors() {
        let provider = MockEmbedding::new(4).with_batch_shortfall(1);
        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let vectors = provider.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 2);
    }

    #[tokio::test]
    async fn marker_text_fails() {
        let provider = MockEmbedding::new(4).failing_on("secret");
        assert!(provider.embed("my secret").await.is_err());
        assert!(provider.embed("public").await.is_ok());
    }
}
