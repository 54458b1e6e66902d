//! LLM module - provider-agnostic client abstraction used by summarization,
//! merge synthesis and memory extraction.

mod client;
mod mock_client;

pub use client::{
    CompletionRequest, CompletionResponse, FinishReason, LlmClient, Message, Role, TokenUsage,
    ToolCall,
};
pub use mock_client::{MockLlmClient, MockReply, MockStep};
