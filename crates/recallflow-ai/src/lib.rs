//! RecallFlow AI - conversational memory for LLM agents
//!
//! This crate provides:
//! - Protocol-safe sliding window over chat history (tool calls never split)
//! - LLM compression of old turns into a synthetic tool-call summary
//! - Model limit registry with provider/date-suffix fallback lookup
//! - Single-flight background extraction of long-term memories
//! - Conflict detection and resolution between overlapping memories
//! - Budgeted recall and re-injection of memories into context

pub mod embedding;
pub mod error;
pub mod llm;
pub mod memory;

// Re-export commonly used types
pub use embedding::{CachedEmbedding, EmbeddingCache, EmbeddingProvider};
pub use error::{AiError, Result};
pub use llm::{LlmClient, Message, Role, ToolCall};
pub use memory::{
    ContextGuard, ExtractionCoordinator, MemoryConfig, MemoryEngine, MemoryEngineParts,
    MemoryRecord, MemoryScope, MemoryType, ModelLimitRegistry,
};
