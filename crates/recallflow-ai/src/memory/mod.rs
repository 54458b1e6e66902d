//! Conversational memory engine.
//!
//! - **Short-term**: keeps the live history protocol-valid and under the
//!   model's token limit (sliding window, then LLM compression).
//! - **Long-term**: extracts durable facts from chat history, reconciles them
//!   with what is already stored, and recalls them within a token budget.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          MemoryEngine                             │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                   │
//! │  before_model_call ──▶ ContextGuard                               │
//! │                        ├── SlidingWindowEngine  (drop old turns)  │
//! │                        └── CompressionEngine    (LLM summary)     │
//! │                                                                   │
//! │  extract_if_needed ──▶ ExtractionCoordinator (single-flight)      │
//! │                        extractor → resolver → embed → store       │
//! │                                                                   │
//! │  on_session_end ─────▶ TransitionService / final flush            │
//! │                        candidate ∪ similar existing → resolve     │
//! │                                                                   │
//! │  recall_with_budget ─▶ RecallService + ContextBudgetManager       │
//! │                        → recall_memory tool call + result         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

mod budget;
mod compression;
mod config;
mod conflict;
mod engine;
mod extraction;
mod hook;
mod model_limits;
mod recall;
mod record;
mod sliding_window;
mod store;
mod tokens;
mod tool_pairing;
mod transition;

pub use budget::{
    BudgetConfig, ContextBudgetManager, DEFAULT_MEMORY_BUDGET_RATIO, DEFAULT_MIN_MEMORY_BUDGET,
    DEFAULT_RECORD_OVERHEAD_TOKENS, DEFAULT_RESERVED_FOR_GENERATION_RATIO,
};
pub use compression::{
    COMPRESS_TOOL_NAME, COMPRESSED_HISTORY_FOOTER, COMPRESSED_HISTORY_HEADER, CompressionConfig,
    CompressionEngine, CompressionResult, middle_truncate,
};
pub use config::MemoryConfig;
pub use conflict::{
    BatchResolution, ConflictConfig, ConflictGroup, ConflictResolver, ConflictStrategy,
    DEFAULT_TOPIC, Resolution,
};
pub use engine::{MemoryEngine, MemoryEngineParts};
pub use extraction::{
    EmbeddingMode, ExtractionConfig, ExtractionCoordinator, ExtractionHandle, ExtractionMode,
    ExtractionPhase, ExtractionState, LlmMemoryExtractor, MemoryExtractor,
};
pub use hook::{ContextGuard, PreparedContext};
pub use model_limits::{
    DEFAULT_MAX_INPUT_TOKENS, DEFAULT_MAX_OUTPUT_TOKENS, ModelLimitRegistry, ModelLimits,
    ModelLimitsSource, ResolvedModelLimits,
};
pub use recall::{RECALL_HEADER, RECALL_TOOL_NAME, RecallConfig, RecallService};
pub use record::{MemoryRecord, MemoryScope, MemoryType};
pub use sliding_window::{DEFAULT_MAX_TURNS, SlidingWindowConfig, SlidingWindowEngine};
pub use store::{ChatHistoryStore, InMemoryChatHistoryStore, InMemoryMemoryStore, MemoryStore};
pub use tokens::{HeuristicTokenizer, ROLE_OVERHEAD_TOKENS, TokenCounter, Tokenizer};
pub use tool_pairing::{
    clean_split_at_or_before, has_unresolved_tool_calls, is_clean_split, pending_tool_calls,
    safe_cut_points,
};
pub use transition::{TransitionConfig, TransitionService};
