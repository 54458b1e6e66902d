//! Background extraction of long-term memories from chat history.
//!
//! [`ExtractionCoordinator`] keeps one `(last_extracted_index, in_flight)`
//! pair per scope. A trigger reserves the in-flight slot under the scope's
//! lock, so concurrent triggers collapse into the running task instead of
//! queueing. The index only moves after the batch is fully persisted.
//!
//! ```text
//!   IDLE ──trigger──▶ EXTRACTING ──success──▶ IDLE (index advanced)
//!                         │
//!                         └──failure, panic──▶ IDLE (index unchanged)
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::Instrument;

use super::compression::format_conversation_for_summary;
use super::conflict::{ConflictResolver, ConflictStrategy};
use super::record::{MemoryRecord, MemoryScope, MemoryType};
use super::store::{ChatHistoryStore, MemoryStore};
use crate::embedding::{EmbeddingProvider, ensure_vector_count};
use crate::error::{AiError, Result};
use crate::llm::{CompletionRequest, LlmClient, Message, Role};

pub const EXTRACTION_PROMPT: &str = include_str!("templates/extraction_prompt.md");

pub const DEFAULT_MAX_BUFFER_TURNS: usize = 10;
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;

/// Stored neighbours checked for an exact duplicate in full-session mode.
const DUPLICATE_LOOKUP_K: usize = 5;

/// Which messages the extractor sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Only the unextracted suffix.
    #[default]
    RollingBuffer,
    /// The whole session, so the extractor has full context. Candidates
    /// whose content is already stored are dropped.
    FullSession,
}

/// How candidate records are embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingMode {
    #[default]
    Batched,
    PerRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// User turns to accumulate before extraction triggers.
    #[serde(default = "default_max_buffer_turns")]
    pub max_buffer_turns: usize,
    #[serde(default)]
    pub mode: ExtractionMode,
    #[serde(default = "default_true")]
    pub run_in_background: bool,
    #[serde(default = "default_true")]
    pub extract_on_session_end: bool,
    #[serde(default)]
    pub embedding_mode: EmbeddingMode,
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    /// Resolve conflicts among a batch's own candidates before saving.
    #[serde(default)]
    pub resolve_strategy: Option<ConflictStrategy>,
}

fn default_max_buffer_turns() -> usize {
    DEFAULT_MAX_BUFFER_TURNS
}

fn default_true() -> bool {
    true
}

fn default_wait_timeout_ms() -> u64 {
    DEFAULT_WAIT_TIMEOUT_MS
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_buffer_turns: default_max_buffer_turns(),
            mode: ExtractionMode::default(),
            run_in_background: true,
            extract_on_session_end: true,
            embedding_mode: EmbeddingMode::default(),
            wait_timeout_ms: default_wait_timeout_ms(),
            resolve_strategy: None,
        }
    }
}

impl ExtractionConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Turns messages into candidate memory records.
#[async_trait]
pub trait MemoryExtractor: Send + Sync {
    async fn extract(&self, scope: &MemoryScope, messages: &[Message])
    -> Result<Vec<MemoryRecord>>;
}

#[derive(Debug, Deserialize)]
struct ExtractedItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    importance: Option<f64>,
}

/// Extractor that asks an LLM for a JSON array of memories.
pub struct LlmMemoryExtractor {
    llm: Arc<dyn LlmClient>,
    temperature: f32,
    model: Option<String>,
}

impl LlmMemoryExtractor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            temperature: 0.0,
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Parse the model's answer. Unknown types and blank contents are dropped.
    pub fn parse_response(scope: &MemoryScope, text: &str) -> Result<Vec<MemoryRecord>> {
        let body = strip_code_fence(text);
        if body.is_empty() {
            return Ok(Vec::new());
        }
        let start = body.find('[');
        let end = body.rfind(']');
        let json = match (start, end) {
            (Some(start), Some(end)) if start < end => &body[start..=end],
            _ => {
                return Err(AiError::InvalidFormat(
                    "extraction response is not a JSON array".to_string(),
                ));
            }
        };

        let items: Vec<ExtractedItem> = serde_json::from_str(json)?;
        let records = items
            .into_iter()
            .filter_map(|item| {
                let content = item.content.trim();
                if content.is_empty() {
                    return None;
                }
                let memory_type = match item.kind.parse::<MemoryType>() {
                    Ok(t) => t,
                    Err(_) => {
                        tracing::debug!(kind = %item.kind, "Dropping memory with unknown type");
                        return None;
                    }
                };
                let mut record = MemoryRecord::new(scope.clone(), memory_type, content);
                if let Some(importance) = item.importance {
                    record = record.with_importance(importance);
                }
                Some(record)
            })
            .collect();
        Ok(records)
    }
}

#[async_trait]
impl MemoryExtractor for LlmMemoryExtractor {
    async fn extract(
        &self,
        scope: &MemoryScope,
        messages: &[Message],
    ) -> Result<Vec<MemoryRecord>> {
        let transcript = format_conversation_for_summary(messages);
        let mut request = CompletionRequest::new(vec![
            Message::system(EXTRACTION_PROMPT),
            Message::user(transcript),
        ])
        .with_temperature(self.temperature);
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }

        let text = self.llm.complete_text(request).await?;
        Self::parse_response(scope, &text)
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Phase of a scope's extraction state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionPhase {
    Idle,
    Extracting,
}

/// Snapshot of one scope's extraction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionState {
    /// Last history position persisted as memory; `-1` before the first batch.
    pub last_extracted_index: i64,
    pub phase: ExtractionPhase,
}

/// Handle on a running extraction batch.
#[derive(Debug, Clone)]
pub struct ExtractionHandle {
    done: watch::Receiver<bool>,
}

impl ExtractionHandle {
    /// True once the batch finished or its task is gone.
    pub fn is_done(&self) -> bool {
        *self.done.borrow() || self.done.has_changed().is_err()
    }

    /// Resolve once the batch has finished, successfully or not.
    pub async fn wait(mut self) {
        // A dropped sender means the task is gone.
        let _ = self.done.wait_for(|done| *done).await;
    }
}

#[derive(Debug)]
struct ScopeState {
    last_extracted_index: i64,
    in_flight: Option<ExtractionHandle>,
}

impl ScopeState {
    fn running(&self) -> Option<&ExtractionHandle> {
        self.in_flight.as_ref().filter(|h| !h.is_done())
    }
}

/// Returns the scope to idle when a batch ends, including by panic or drop.
struct BatchGuard {
    slot: Arc<Mutex<ScopeState>>,
    done: watch::Sender<bool>,
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.slot.lock().in_flight = None;
        self.done.send_replace(true);
    }
}

struct CoordinatorInner {
    config: ExtractionConfig,
    extractor: Arc<dyn MemoryExtractor>,
    history: Arc<dyn ChatHistoryStore>,
    store: Arc<dyn MemoryStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    resolver: Option<ConflictResolver>,
    scopes: DashMap<String, Arc<Mutex<ScopeState>>>,
}

/// Single-flight, per-scope extraction pipeline.
#[derive(Clone)]
pub struct ExtractionCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ExtractionCoordinator {
    pub fn new(
        config: ExtractionConfig,
        extractor: Arc<dyn MemoryExtractor>,
        history: Arc<dyn ChatHistoryStore>,
        store: Arc<dyn MemoryStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                extractor,
                history,
                store,
                embedder,
                resolver: None,
                scopes: DashMap::new(),
            }),
        }
    }

    /// Resolve in-batch conflicts with `resolver` when
    /// [`ExtractionConfig::resolve_strategy`] is set.
    ///
    /// Must be called before the coordinator is cloned or used.
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.resolver = Some(resolver);
        } else {
            tracing::warn!("Coordinator already shared, conflict resolver ignored");
        }
        self
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.inner.config
    }

    pub fn state(&self, scope: &MemoryScope) -> ExtractionState {
        let slot = self.inner.slot(scope);
        let state = slot.lock();
        ExtractionState {
            last_extracted_index: state.last_extracted_index,
            phase: if state.running().is_some() {
                ExtractionPhase::Extracting
            } else {
                ExtractionPhase::Idle
            },
        }
    }

    pub fn is_extracting(&self, scope: &MemoryScope) -> bool {
        self.state(scope).phase == ExtractionPhase::Extracting
    }

    /// True when idle and the unextracted suffix holds at least
    /// `max_buffer_turns` user turns.
    pub async fn should_extract(&self, scope: &MemoryScope) -> bool {
        let last_index = {
            let slot = self.inner.slot(scope);
            let state = slot.lock();
            if state.running().is_some() {
                return false;
            }
            state.last_extracted_index
        };

        let pending = match self.inner.history.load_unextracted(scope).await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!(scope = %scope, error = %err, "Failed to load chat history");
                return false;
            }
        };

        let user_turns = pending
            .iter()
            .filter(|(idx, msg)| *idx as i64 > last_index && msg.role == Role::User)
            .count();
        user_turns >= self.inner.config.max_buffer_turns.max(1)
    }

    /// Start a batch unless one is already running for `scope`.
    ///
    /// Returns the new batch's handle, or `None` when a batch was already in
    /// flight. In foreground mode the batch has finished when this returns.
    /// The batch always runs on its own task, so dropping this future never
    /// cancels it.
    pub async fn trigger_extraction(&self, scope: &MemoryScope) -> Option<ExtractionHandle> {
        let slot = self.inner.slot(scope);
        let (guard, handle, last_index) = {
            let mut state = slot.lock();
            if state.running().is_some() {
                tracing::debug!(scope = %scope, "Extraction already in flight, skipping trigger");
                return None;
            }
            let (tx, rx) = watch::channel(false);
            let handle = ExtractionHandle { done: rx };
            state.in_flight = Some(handle.clone());
            let guard = BatchGuard {
                slot: Arc::clone(&slot),
                done: tx,
            };
            (guard, handle, state.last_extracted_index)
        };

        let inner = Arc::clone(&self.inner);
        let task_scope = scope.clone();
        let span = tracing::info_span!("memory_extraction", scope = %scope);
        let task = tokio::spawn(
            async move {
                inner.run_batch(&task_scope, &guard.slot, last_index).await;
                drop(guard);
            }
            .instrument(span),
        );

        if !self.inner.config.run_in_background
            && let Err(err) = task.await
        {
            tracing::error!(scope = %scope, error = %err, "Memory extraction task died");
        }
        Some(handle)
    }

    /// Trigger a batch if [`should_extract`](Self::should_extract) says so.
    pub async fn extract_if_needed(&self, scope: &MemoryScope) -> Option<ExtractionHandle> {
        if self.should_extract(scope).await {
            self.trigger_extraction(scope).await
        } else {
            None
        }
    }

    /// Wait up to `timeout` for the in-flight batch of `scope`.
    ///
    /// Returns false on timeout; the batch keeps running and still applies
    /// its result. Dropping the returned future stops waiting without
    /// affecting the batch.
    pub async fn wait_for_completion(&self, scope: &MemoryScope, timeout: Duration) -> bool {
        let handle = {
            let slot = self.inner.slot(scope);
            let state = slot.lock();
            state.running().cloned()
        };
        let Some(handle) = handle else {
            return true;
        };

        match tokio::time::timeout(timeout, handle.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    scope = %scope,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for memory extraction"
                );
                false
            }
        }
    }

    /// Final flush for a closing session.
    ///
    /// Returns false if a wait timed out.
    pub async fn on_session_end(&self, scope: &MemoryScope) -> bool {
        if !self.inner.config.extract_on_session_end {
            return true;
        }
        let timeout = self.inner.config.wait_timeout();
        if !self.wait_for_completion(scope, timeout).await {
            return false;
        }
        self.trigger_extraction(scope).await;
        self.wait_for_completion(scope, timeout).await
    }
}

impl CoordinatorInner {
    fn slot(&self, scope: &MemoryScope) -> Arc<Mutex<ScopeState>> {
        self.scopes
            .entry(scope.key())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ScopeState {
                    last_extracted_index: -1,
                    in_flight: None,
                }))
            })
            .clone()
    }

    async fn run_batch(&self, scope: &MemoryScope, slot: &Mutex<ScopeState>, last_index: i64) {
        match self.process(scope, last_index).await {
            Ok(Some(position)) => {
                let mut state = slot.lock();
                state.last_extracted_index = state.last_extracted_index.max(position);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(scope = %scope, error = %err, "Memory extraction batch aborted");
            }
        }
    }

    /// Run one batch. Returns the last processed position on success.
    async fn process(&self, scope: &MemoryScope, last_index: i64) -> Result<Option<i64>> {
        let pending: Vec<(usize, Message)> = self
            .history
            .load_unextracted(scope)
            .await?
            .into_iter()
            .filter(|(idx, msg)| *idx as i64 > last_index && !msg.is_system())
            .collect();

        let Some(last_position) = pending.last().map(|(idx, _)| *idx as i64) else {
            tracing::debug!("Nothing to extract");
            return Ok(None);
        };

        let input: Vec<Message> = match self.config.mode {
            ExtractionMode::RollingBuffer => pending.into_iter().map(|(_, msg)| msg).collect(),
            ExtractionMode::FullSession => self
                .history
                .load(scope)
                .await?
                .into_iter()
                .filter(|msg| !msg.is_system())
                .collect(),
        };

        let mut records = self.extractor.extract(scope, &input).await?;

        if let (Some(resolver), Some(strategy)) = (&self.resolver, self.config.resolve_strategy)
            && records.len() > 1
        {
            records = resolver.resolve_batch(records, strategy).await.kept;
        }

        if self.config.mode == ExtractionMode::FullSession {
            records = self.drop_already_stored(scope, records).await?;
        }

        if !records.is_empty() {
            let embeddings = self.embed(&records).await?;
            ensure_vector_count(records.len(), &embeddings)?;
            self.store.save_all(&records, &embeddings).await?;
        }

        if let Err(err) = self.history.mark_extracted(scope, last_position).await {
            tracing::warn!(error = %err, "Failed to persist extraction watermark");
        }

        tracing::info!(
            records = records.len(),
            messages = input.len(),
            last_position,
            "Memory extraction batch saved"
        );
        Ok(Some(last_position))
    }

    async fn drop_already_stored(
        &self,
        scope: &MemoryScope,
        records: Vec<MemoryRecord>,
    ) -> Result<Vec<MemoryRecord>> {
        let mut fresh = Vec::with_capacity(records.len());
        for record in records {
            let stored = self
                .store
                .recall_similar(scope, &record.content, DUPLICATE_LOOKUP_K)
                .await?;
            if stored.iter().any(|r| r.content_hash == record.content_hash) {
                tracing::debug!(content = %record.content, "Memory already stored, skipping");
                continue;
            }
            fresh.push(record);
        }
        Ok(fresh)
    }

    async fn embed(&self, records: &[MemoryRecord]) -> Result<Vec<Vec<f32>>> {
        match self.config.embedding_mode {
            EmbeddingMode::Batched => {
                let texts: Vec<String> = records.iter().map(|r| r.content.clone()).collect();
                self.embedder.embed_batch(&texts).await
            }
            EmbeddingMode::PerRecord => {
                try_join_all(records.iter().map(|r| self.embedder.embed(&r.content))).await
            }
        }
    }
}
