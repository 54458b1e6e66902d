//! Retrieval of long-term memories and their re-injection into context.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::budget::ContextBudgetManager;
use super::record::{MemoryRecord, MemoryScope};
use super::store::MemoryStore;
use crate::llm::{Message, ToolCall};

/// Name of the synthetic tool call carrying recalled memories.
pub const RECALL_TOOL_NAME: &str = "recall_memory";
pub const RECALL_HEADER: &str = "Relevant long-term memories:";
pub const DEFAULT_MAX_RECALL_RECORDS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallConfig {
    #[serde(default = "default_max_records")]
    pub default_max_records: usize,
}

fn default_max_records() -> usize {
    DEFAULT_MAX_RECALL_RECORDS
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            default_max_records: default_max_records(),
        }
    }
}

pub struct RecallService {
    config: RecallConfig,
    store: Arc<dyn MemoryStore>,
    budget: ContextBudgetManager,
}

impl RecallService {
    pub fn new(config: RecallConfig, store: Arc<dyn MemoryStore>, budget: ContextBudgetManager) -> Self {
        Self {
            config,
            store,
            budget,
        }
    }

    /// Most similar records for `query`. Never fails; errors yield nothing.
    pub async fn recall(
        &self,
        query: &str,
        scope: &MemoryScope,
        max_records: usize,
    ) -> Vec<MemoryRecord> {
        if query.trim().is_empty() || scope.is_empty() || max_records == 0 {
            return Vec::new();
        }
        match self.store.recall_similar(scope, query, max_records).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(scope = %scope, error = %err, "Memory recall failed");
                Vec::new()
            }
        }
    }

    /// Recall twice the default count and keep what fits the memory budget
    /// left by the live context.
    pub async fn recall_with_budget(
        &self,
        query: &str,
        scope: &MemoryScope,
        messages: &[Message],
        system_prompt: &str,
    ) -> Vec<MemoryRecord> {
        let candidates = self
            .recall(query, scope, self.config.default_max_records * 2)
            .await;
        if candidates.is_empty() {
            return candidates;
        }
        let budget = self.budget.calculate_available_budget(messages, system_prompt);
        let selected = self.budget.select_within_budget(candidates, budget);
        tracing::debug!(selected = selected.len(), budget, "Recalled memories within budget");
        selected
    }

    /// Render records as a `recall_memory` tool call and its result.
    pub fn format_as_tool_messages(records: &[MemoryRecord]) -> Vec<Message> {
        if records.is_empty() {
            return Vec::new();
        }

        let mut body = String::from(RECALL_HEADER);
        for record in records {
            body.push_str(&format!("\n- [{}] {}", record.memory_type, record.content));
        }

        let call_id = format!("{}_{}", RECALL_TOOL_NAME, uuid::Uuid::new_v4().simple());
        vec![
            Message::assistant_with_tool_calls(
                None,
                vec![ToolCall::new(
                    call_id.clone(),
                    RECALL_TOOL_NAME,
                    json!({ "count": records.len() }),
                )],
            ),
            Message::tool_result(call_id, body),
        ]
    }
}
