//! Scripted LLM client for engine tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CompletionRequest, CompletionResponse, FinishReason, LlmClient, Role, TokenUsage};
use crate::error::{AiError, Result};

/// What a scripted call produces.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Fail(String),
}

/// One scripted reply, optionally delayed.
#[derive(Debug, Clone)]
pub struct MockStep {
    pub delay: Duration,
    pub reply: MockReply,
}

impl MockStep {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: MockReply::Text(content.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: MockReply::Fail(message.into()),
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = Duration::from_millis(delay_ms);
        self
    }
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<MockStep>,
    seen: Vec<CompletionRequest>,
}

/// Replays [`MockStep`]s in order and records every request.
///
/// Once the script runs out the client echoes the last user message.
/// Clones share the script and the request log.
#[derive(Debug, Clone, Default)]
pub struct MockLlmClient {
    model: String,
    state: Arc<Mutex<MockState>>,
}

impl MockLlmClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self::from_steps(model, Vec::new())
    }

    pub fn from_steps(model: impl Into<String>, steps: Vec<MockStep>) -> Self {
        Self {
            model: model.into(),
            state: Arc::new(Mutex::new(MockState {
                script: steps.into(),
                seen: Vec::new(),
            })),
        }
    }

    pub async fn push_step(&self, step: MockStep) {
        self.state.lock().await.script.push_back(step);
    }

    /// Requests received so far, oldest first.
    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.state.lock().await.seen.clone()
    }
}

fn text_response(text: String) -> CompletionResponse {
    let usage = TokenUsage {
        prompt_tokens: 0,
        completion_tokens: text.len().div_ceil(4) as u32,
    };
    CompletionResponse {
        content: Some(text),
        finish_reason: FinishReason::Stop,
        usage: Some(usage),
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn provider(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let step = {
            let mut state = self.state.lock().await;
            state.seen.push(request.clone());
            state.script.pop_front()
        };

        let Some(step) = step else {
            let echo = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map_or_else(|| "mock-ok".to_string(), |m| format!("mock-echo: {}", m.content));
            return Ok(text_response(echo));
        };

        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }

        match step.reply {
            MockReply::Text(text) => Ok(text_response(text)),
            MockReply::Fail(message) => Err(AiError::Llm(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;

    #[tokio::test]
    async fn replays_script_then_echoes() {
        let client = MockLlmClient::from_steps("m", vec![MockStep::text("  scripted  ")]);
        let request = || CompletionRequest::new(vec![Message::user("ping")]);

        assert_eq!(client.complete_text(request()).await.unwrap(), "scripted");
        assert_eq!(client.complete_text(request()).await.unwrap(), "mock-echo: ping");
    }

    #[tokio::test]
    async fn failures_are_llm_errors_and_requests_are_logged() {
        let client = MockLlmClient::from_steps("m", vec![MockStep::error("boom")]);

        let result = client
            .complete(CompletionRequest::new(vec![Message::user("first")]).with_temperature(0.1))
            .await;

        assert!(matches!(result, Err(AiError::Llm(ref msg)) if msg == "boom"));
        let requests = client.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].temperature, Some(0.1));
    }

    #[tokio::test]
    async fn clones_share_the_script() {
        let client = MockLlmClient::new("m");
        let clone = client.clone();
        clone.push_step(MockStep::text("from clone")).await;

        let text = client
            .complete_text(CompletionRequest::new(vec![Message::user("x")]))
            .await
            .unwrap();
        assert_eq!(text, "from clone");
        assert_eq!(clone.requests().await.len(), 1);
    }
}
