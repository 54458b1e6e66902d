//! Token counting for text and message lists.
//!
//! The default [`HeuristicTokenizer`] estimates one token per four bytes,
//! which is what the context limits are calibrated against. Plug in a real
//! tokenizer through the [`Tokenizer`] trait when exact counts matter.

use std::fmt;
use std::sync::Arc;

use crate::llm::Message;

const CHARS_PER_TOKEN: usize = 4;
/// Fixed per-message cost for role markers and delimiters.
pub const ROLE_OVERHEAD_TOKENS: usize = 4;

/// Counts tokens in a piece of text.
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Byte-length estimator: `ceil(len / 4)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn count(&self, text: &str) -> usize {
        text.len().div_ceil(CHARS_PER_TOKEN)
    }
}

/// Message-aware token counter.
///
/// Adds [`ROLE_OVERHEAD_TOKENS`] per message and counts tool-call ids, names,
/// and serialized arguments alongside the content.
#[derive(Clone)]
pub struct TokenCounter {
    tokenizer: Arc<dyn Tokenizer>,
}

impl fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCounter").finish_non_exhaustive()
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new(Arc::new(HeuristicTokenizer))
    }
}

impl TokenCounter {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { tokenizer }
    }

    pub fn count_text(&self, text: &str) -> usize {
        self.tokenizer.count(text)
    }

    pub fn count_message(&self, msg: &Message) -> usize {
        let mut tokens = self.tokenizer.count(&msg.content);
        for call in msg.tool_calls() {
            tokens += self.tokenizer.count(&call.id);
            tokens += self.tokenizer.count(&call.name);
            tokens += self.tokenizer.count(&call.arguments.to_string());
        }
        if let Some(id) = &msg.tool_call_id {
            tokens += self.tokenizer.count(id);
        }
        tokens + ROLE_OVERHEAD_TOKENS
    }

    pub fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count_message(m)).sum()
    }
}
