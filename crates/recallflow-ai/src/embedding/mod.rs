//! Embedding providers and utilities.

mod cache;
mod mock;
mod provider;

pub use cache::{CachedEmbedding, EmbeddingCache};
pub use mock::MockEmbedding;
pub use provider::{EmbeddingProvider, ensure_vector_count};
