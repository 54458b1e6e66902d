//! Runtime-facing facade over the memory components.

use std::sync::Arc;

use super::budget::ContextBudgetManager;
use super::compression::CompressionEngine;
use super::config::MemoryConfig;
use super::conflict::ConflictResolver;
use super::extraction::{ExtractionCoordinator, ExtractionHandle, MemoryExtractor};
use super::hook::{ContextGuard, PreparedContext};
use super::record::{MemoryRecord, MemoryScope};
use super::recall::RecallService;
use super::sliding_window::SlidingWindowEngine;
use super::store::{ChatHistoryStore, MemoryStore};
use super::transition::TransitionService;
use crate::embedding::EmbeddingProvider;
use crate::llm::{LlmClient, Message};

/// Collaborators the engine is built from.
pub struct MemoryEngineParts {
    pub extractor: Arc<dyn MemoryExtractor>,
    pub history: Arc<dyn ChatHistoryStore>,
    pub store: Arc<dyn MemoryStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    /// Summarizer for compression and merge synthesis; `None` disables both.
    pub llm: Option<Arc<dyn LlmClient>>,
}

/// Everything the surrounding agent loop calls into.
pub struct MemoryEngine {
    config: MemoryConfig,
    guard: ContextGuard,
    coordinator: ExtractionCoordinator,
    transition: Option<TransitionService>,
    recall: RecallService,
}

impl MemoryEngine {
    /// Engine whose session end uses the coordinator's final flush.
    pub fn new(config: MemoryConfig, parts: MemoryEngineParts) -> Self {
        Self::build(config, parts, false)
    }

    /// Engine whose session end reconciles against stored memory.
    pub fn with_transition(config: MemoryConfig, parts: MemoryEngineParts) -> Self {
        Self::build(config, parts, true)
    }

    fn build(config: MemoryConfig, parts: MemoryEngineParts, use_transition: bool) -> Self {
        let resolver = ConflictResolver::new(config.conflict.clone(), parts.llm.clone());

        let guard = ContextGuard::new(
            SlidingWindowEngine::new(config.window.clone()),
            CompressionEngine::new(config.compression.clone(), parts.llm.clone()),
        );

        let coordinator = ExtractionCoordinator::new(
            config.extraction.clone(),
            parts.extractor.clone(),
            parts.history,
            parts.store.clone(),
            parts.embedder.clone(),
        )
        .with_resolver(resolver.clone());

        let transition = use_transition.then(|| {
            TransitionService::new(
                config.transition.clone(),
                parts.extractor,
                resolver,
                parts.store.clone(),
                parts.embedder,
            )
        });

        let recall = RecallService::new(
            config.recall.clone(),
            parts.store,
            ContextBudgetManager::new(config.budget.clone()),
        );

        Self {
            config,
            guard,
            coordinator,
            transition,
            recall,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &ExtractionCoordinator {
        &self.coordinator
    }

    /// Slide and compress the live history before a model call.
    pub async fn before_model_call(&self, messages: Vec<Message>) -> PreparedContext {
        self.guard.prepare(messages).await
    }

    pub async fn extract_if_needed(&self, scope: &MemoryScope) -> Option<ExtractionHandle> {
        self.coordinator.extract_if_needed(scope).await
    }

    pub async fn recall_with_budget(
        &self,
        query: &str,
        scope: &MemoryScope,
        messages: &[Message],
        system_prompt: &str,
    ) -> Vec<MemoryRecord> {
        self.recall
            .recall_with_budget(query, scope, messages, system_prompt)
            .await
    }

    pub fn format_as_tool_messages(&self, records: &[MemoryRecord]) -> Vec<Message> {
        RecallService::format_as_tool_messages(records)
    }

    /// Close a session. Never fails; returns records the transition saved
    /// (always empty for coordinator-only engines).
    pub async fn on_session_end(
        &self,
        scope: &MemoryScope,
        session_messages: &[Message],
    ) -> Vec<MemoryRecord> {
        match &self.transition {
            Some(transition) => {
                let timeout = self.config.extraction.wait_timeout();
                // Let a running batch finish so both paths do not extract the same turns.
                self.coordinator.wait_for_completion(scope, timeout).await;
                transition.on_session_end(scope, session_messages).await
            }
            None => {
                if !self.coordinator.on_session_end(scope).await {
                    tracing::warn!(scope = %scope, "Session closed before final extraction finished");
                }
                Vec::new()
            }
        }
    }
}
