//! Pre-model-call guard: sliding window, then compression.

use super::compression::CompressionEngine;
use super::sliding_window::SlidingWindowEngine;
use super::tokens::TokenCounter;
use crate::llm::Message;

/// History ready to send, plus what the guard did to it.
#[derive(Debug, Clone)]
pub struct PreparedContext {
    pub messages: Vec<Message>,
    pub slid: bool,
    pub compressed: bool,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Keeps the working set under the model limit before every model call.
#[derive(Clone, Default)]
pub struct ContextGuard {
    window: SlidingWindowEngine,
    compression: CompressionEngine,
    counter: TokenCounter,
}

impl ContextGuard {
    pub fn new(window: SlidingWindowEngine, compression: CompressionEngine) -> Self {
        Self {
            window,
            compression,
            counter: TokenCounter::default(),
        }
    }

    pub fn with_counter(mut self, counter: TokenCounter) -> Self {
        self.counter = counter;
        self
    }

    pub fn window(&self) -> &SlidingWindowEngine {
        &self.window
    }

    pub fn compression(&self) -> &CompressionEngine {
        &self.compression
    }

    pub async fn prepare(&self, messages: Vec<Message>) -> PreparedContext {
        let tokens_before = self.counter.count_messages(&messages);

        let mut slid = false;
        let mut messages = messages;
        if self.window.should_slide(&messages) {
            let before = messages.len();
            messages = self.window.slide(messages);
            slid = messages.len() < before;
        }

        let mut compressed = false;
        let current = self.counter.count_messages(&messages);
        if self.compression.should_compress(current) {
            let result = self.compression.compress(messages).await;
            compressed = result.applied();
            messages = result.messages;
        }

        let tokens_after = self.counter.count_messages(&messages);
        if slid || compressed {
            tracing::debug!(slid, compressed, tokens_before, tokens_after, "Context prepared");
        }

        PreparedContext {
            messages,
            slid,
            compressed,
            tokens_before,
            tokens_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::llm::{MockLlmClient, MockStep};
    use crate::memory::compression::CompressionConfig;
    use crate::memory::sliding_window::SlidingWindowConfig;

    fn conversation(turns: usize, size: usize) -> Vec<Message> {
        let mut msgs = vec![Message::system("sys")];
        for i in 0..turns {
            msgs.push(Message::user(format!("q{i} {}", "x".repeat(size))));
            msgs.push(Message::assistant(format!("a{i} {}", "y".repeat(size))));
        }
        msgs
    }

    #[tokio::test]
    async fn small_history_passes_through() {
        let guard = ContextGuard::default();
        let msgs = conversation(3, 10);
        let prepared = guard.prepare(msgs.clone()).await;
        assert!(!prepared.slid);
        assert!(!prepared.compressed);
        assert_eq!(prepared.messages, msgs);
        assert_eq!(prepared.tokens_before, prepared.tokens_after);
    }

    #[tokio::test]
    async fn slides_on_turn_limit() {
        let guard = ContextGuard::new(
            SlidingWindowEngine::new(SlidingWindowConfig {
                max_turns: 4,
                ..SlidingWindowConfig::default()
            }),
            CompressionEngine::default(),
        );
        let prepared = guard.prepare(conversation(6, 10)).await;
        assert!(prepared.slid);
        assert_eq!(prepared.messages.len(), 1 + 8);
        assert!(prepared.tokens_after < prepared.tokens_before);
    }

    #[tokio::test]
    async fn compresses_when_window_alone_is_not_enough() {
        let llm = MockLlmClient::from_steps("s", vec![MockStep::text("earlier questions answered")]);
        let guard = ContextGuard::new(
            SlidingWindowEngine::new(SlidingWindowConfig {
                max_turns: 100,
                auto_protect: false,
                ..SlidingWindowConfig::default()
            }),
            CompressionEngine::new(
                CompressionConfig {
                    max_context_tokens: 2_000,
                    keep_recent_turns: 2,
                    ..CompressionConfig::default()
                },
                Some(Arc::new(llm)),
            ),
        );

        let prepared = guard.prepare(conversation(20, 200)).await;

        assert!(!prepared.slid);
        assert!(prepared.compressed);
        assert_eq!(prepared.messages.len(), 1 + 2 + 4);
    }
}
