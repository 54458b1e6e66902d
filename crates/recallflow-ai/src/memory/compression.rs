//! LLM-backed compression of old conversation turns.
//!
//! When the context approaches the model limit, everything but the most
//! recent turns is replaced by a summary. The summary is injected as a
//! synthetic `memory_compress` tool call followed by its tool result, so
//! downstream consumers only ever see ordinary role-tagged messages.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::sliding_window::{rejoin, split_system};
use super::tokens::TokenCounter;
use super::tool_pairing::{clean_split_at_or_before, pending_tool_calls, safe_cut_points};
use crate::llm::{CompletionRequest, LlmClient, Message, Role, ToolCall};

pub const COMPRESSION_PROMPT: &str = include_str!("templates/compression_prompt.md");

/// Name of the synthetic tool call carrying a compressed summary.
pub const COMPRESS_TOOL_NAME: &str = "memory_compress";
pub const COMPRESSED_HISTORY_HEADER: &str = "[COMPRESSED CONVERSATION HISTORY]";
pub const COMPRESSED_HISTORY_FOOTER: &str = "[END OF COMPRESSED HISTORY]";

pub const DEFAULT_COMPRESSION_TRIGGER_THRESHOLD: f64 = 0.8;
pub const DEFAULT_KEEP_RECENT_TURNS: usize = 5;
pub const DEFAULT_MIN_SUMMARY_TOKENS: usize = 500;
pub const DEFAULT_MAX_SUMMARY_TOKENS: usize = 4_000;

const SUMMARY_TRUNCATE_CHARS: usize = 4_000;
const TOOL_ARGS_TRUNCATE_CHARS: usize = 200;

/// Compression configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Fraction of `max_context_tokens` at which compression triggers.
    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: f64,
    /// Number of most recent turns kept verbatim.
    #[serde(default = "default_keep_recent_turns")]
    pub keep_recent_turns: usize,
    #[serde(default = "default_min_summary_tokens")]
    pub min_summary_tokens: usize,
    #[serde(default = "default_max_summary_tokens")]
    pub max_summary_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Model override for the summarizer; `None` uses the client's model.
    #[serde(default)]
    pub summary_model: Option<String>,
}

fn default_max_context_tokens() -> usize {
    super::model_limits::DEFAULT_MAX_INPUT_TOKENS
}

fn default_trigger_threshold() -> f64 {
    DEFAULT_COMPRESSION_TRIGGER_THRESHOLD
}

fn default_keep_recent_turns() -> usize {
    DEFAULT_KEEP_RECENT_TURNS
}

fn default_min_summary_tokens() -> usize {
    DEFAULT_MIN_SUMMARY_TOKENS
}

fn default_max_summary_tokens() -> usize {
    DEFAULT_MAX_SUMMARY_TOKENS
}

fn default_temperature() -> f32 {
    0.3
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            trigger_threshold: default_trigger_threshold(),
            keep_recent_turns: default_keep_recent_turns(),
            min_summary_tokens: default_min_summary_tokens(),
            max_summary_tokens: default_max_summary_tokens(),
            temperature: default_temperature(),
            summary_model: None,
        }
    }
}

impl CompressionConfig {
    fn trigger_tokens(&self) -> usize {
        (self.max_context_tokens as f64 * self.trigger_threshold) as usize
    }

    /// Summary size: a tenth of the context, clamped to the configured bounds.
    pub fn summary_target_tokens(&self) -> usize {
        let min = self.min_summary_tokens.min(self.max_summary_tokens);
        (self.max_context_tokens / 10).clamp(min, self.max_summary_tokens)
    }
}

/// Outcome of a compression attempt.
#[derive(Debug, Clone)]
pub struct CompressionResult {
    /// History after compression (the input when nothing was compressed).
    pub messages: Vec<Message>,
    /// Number of messages folded into the summary.
    pub compressed_count: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub summary: Option<String>,
}

impl CompressionResult {
    fn unchanged(messages: Vec<Message>, tokens: usize) -> Self {
        Self {
            messages,
            compressed_count: 0,
            tokens_before: tokens,
            tokens_after: tokens,
            summary: None,
        }
    }

    pub fn applied(&self) -> bool {
        self.compressed_count > 0
    }
}

/// Replaces old turns with an LLM summary.
#[derive(Clone, Default)]
pub struct CompressionEngine {
    config: CompressionConfig,
    counter: TokenCounter,
    summarizer: Option<Arc<dyn LlmClient>>,
}

impl CompressionEngine {
    pub fn new(config: CompressionConfig, summarizer: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            config,
            counter: TokenCounter::default(),
            summarizer,
        }
    }

    pub fn with_counter(mut self, counter: TokenCounter) -> Self {
        self.counter = counter;
        self
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// True once `current_tokens` reaches the trigger threshold and a
    /// summarizer is available.
    pub fn should_compress(&self, current_tokens: usize) -> bool {
        self.summarizer.is_some()
            && self.config.max_context_tokens > 0
            && current_tokens >= self.config.trigger_tokens()
    }

    /// Summarize everything but the most recent turns.
    ///
    /// Any failure (no summarizer, nothing to compress, LLM error, blank
    /// summary) returns the input unchanged.
    pub async fn compress(&self, messages: Vec<Message>) -> CompressionResult {
        let tokens_before = self.counter.count_messages(&messages);

        let Some(summarizer) = self.summarizer.as_ref() else {
            return CompressionResult::unchanged(messages, tokens_before);
        };

        let (system, rest) = split_system(messages);
        if rest.len() < 2 {
            return CompressionResult::unchanged(rejoin(system, rest), tokens_before);
        }

        let mut split = self.keep_split(&rest);
        let keep_tokens = self.counter.count_messages(&rest[split..]);
        if keep_tokens >= self.config.trigger_tokens() {
            let chain_start = active_chain_start(&rest);
            tracing::debug!(
                keep_tokens,
                chain_start,
                "Recent turns alone exceed trigger, keeping only the active chain"
            );
            split = split.max(chain_start);
        }

        if split == 0 {
            return CompressionResult::unchanged(rejoin(system, rest), tokens_before);
        }

        let target_tokens = self.config.summary_target_tokens();
        let transcript = format_conversation_for_summary(&rest[..split]);
        let summary = match self
            .summarize(summarizer.as_ref(), &transcript, target_tokens)
            .await
        {
            Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
            Ok(_) => {
                tracing::warn!("Summarizer returned empty summary, skipping compression");
                return CompressionResult::unchanged(rejoin(system, rest), tokens_before);
            }
            Err(err) => {
                tracing::warn!(error = %err, "Summarizer failed, skipping compression");
                return CompressionResult::unchanged(rejoin(system, rest), tokens_before);
            }
        };

        let mut compressed = Vec::with_capacity(rest.len() - split + 3);
        compressed.extend(system);
        compressed.extend(build_summary_pair(&summary, split));
        compressed.extend(rest.into_iter().skip(split));

        let tokens_after = self.counter.count_messages(&compressed);
        tracing::info!(
            compressed_count = split,
            tokens_before,
            tokens_after,
            "Compressed conversation history"
        );

        CompressionResult {
            messages: compressed,
            compressed_count: split,
            tokens_before,
            tokens_after,
            summary: Some(summary),
        }
    }

    /// Index in `rest` where the kept recent turns begin.
    fn keep_split(&self, rest: &[Message]) -> usize {
        let keep = self.config.keep_recent_turns;
        if keep == 0 {
            return active_chain_start(rest);
        }
        let cut_points = safe_cut_points(rest);
        if cut_points.len() <= keep {
            return 0;
        }
        cut_points[cut_points.len() - keep]
    }

    async fn summarize(
        &self,
        llm: &dyn LlmClient,
        transcript: &str,
        target_tokens: usize,
    ) -> crate::error::Result<String> {
        let prompt = COMPRESSION_PROMPT.replace("{target_tokens}", &target_tokens.to_string());
        let mut request =
            CompletionRequest::new(vec![Message::system(prompt), Message::user(transcript)])
                .with_temperature(self.config.temperature)
                .with_max_tokens(target_tokens as u32);
        if let Some(model) = &self.config.summary_model {
            request = request.with_model(model.clone());
        }
        llm.complete_text(request).await
    }
}

/// Start of the conversation chain that is still in progress: the last turn,
/// or the first unanswered tool call when no turn boundary exists.
fn active_chain_start(rest: &[Message]) -> usize {
    if let Some(&last) = safe_cut_points(rest).last() {
        return last;
    }

    let pending = pending_tool_calls(rest);
    let chain = rest
        .iter()
        .position(|m| m.tool_calls().iter().any(|c| pending.contains(&c.id)))
        .unwrap_or(rest.len().saturating_sub(1));

    clean_split_at_or_before(rest, chain)
}

fn build_summary_pair(summary: &str, compressed_count: usize) -> [Message; 2] {
    let call_id = format!("{}_{}", COMPRESS_TOOL_NAME, uuid::Uuid::new_v4().simple());
    let call = ToolCall::new(
        call_id.clone(),
        COMPRESS_TOOL_NAME,
        json!({ "compressed_messages": compressed_count }),
    );
    [
        Message::assistant_with_tool_calls(None, vec![call]),
        Message::tool_result(
            call_id,
            format!("{COMPRESSED_HISTORY_HEADER}\n{summary}\n{COMPRESSED_HISTORY_FOOTER}"),
        ),
    ]
}

/// Format conversation transcript for the summarization LLM call.
pub(crate) fn format_conversation_for_summary(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        let role_label = match msg.role {
            Role::System => "SYSTEM",
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
            Role::Tool => "TOOL",
        };

        if !msg.content.is_empty() {
            let content = middle_truncate(&msg.content, SUMMARY_TRUNCATE_CHARS);
            out.push_str(&format!("[{}] {}\n\n", role_label, content));
        }

        for call in msg.tool_calls() {
            let args_display = middle_truncate(&call.arguments.to_string(), TOOL_ARGS_TRUNCATE_CHARS);
            out.push_str(&format!("  → tool_call: {}({})\n", call.name, args_display));
        }
    }
    out
}

/// Keep head + tail of a string, inserting a truncation marker in the middle.
pub fn middle_truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }

    let marker = format!(
        "\n... [{} chars truncated] ...\n",
        s.len().saturating_sub(max_len)
    );
    if max_len <= marker.len() {
        return s[..char_boundary(s, max_len, false)].to_string();
    }

    let available = max_len - marker.len();
    let head_end = char_boundary(s, available / 2, false);
    let tail_start = char_boundary(s, s.len() - (available - available / 2), true);

    format!("{}{}{}", &s[..head_end], marker, &s[tail_start..])
}

/// Nearest char boundary to `pos`, searching forward when `up` is set.
fn char_boundary(s: &str, mut pos: usize, up: bool) -> usize {
    pos = pos.min(s.len());
    while !s.is_char_boundary(pos) {
        if up {
            pos += 1;
        } else {
            pos -= 1;
        }
    }
    pos
}
