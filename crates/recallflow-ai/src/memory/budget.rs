//! Token budget for re-injected long-term memory.

use serde::{Deserialize, Serialize};

use super::record::MemoryRecord;
use super::tokens::TokenCounter;
use crate::llm::Message;

pub const DEFAULT_MEMORY_BUDGET_RATIO: f64 = 0.2;
pub const DEFAULT_RESERVED_FOR_GENERATION_RATIO: f64 = 0.3;
/// Floor for the memory budget, even when the context is already full.
pub const DEFAULT_MIN_MEMORY_BUDGET: usize = 200;
/// Per-record formatting cost (type tag, bullet, newline).
pub const DEFAULT_RECORD_OVERHEAD_TOKENS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Share of the free context given to memory.
    #[serde(default = "default_memory_budget_ratio")]
    pub memory_budget_ratio: f64,
    /// Share of the whole context held back for the model's answer.
    #[serde(default = "default_reserved_ratio")]
    pub reserved_for_generation_ratio: f64,
    #[serde(default = "default_min_memory_budget")]
    pub min_memory_budget: usize,
    #[serde(default = "default_record_overhead_tokens")]
    pub record_overhead_tokens: usize,
}

fn default_max_context_tokens() -> usize {
    super::model_limits::DEFAULT_MAX_INPUT_TOKENS
}

fn default_memory_budget_ratio() -> f64 {
    DEFAULT_MEMORY_BUDGET_RATIO
}

fn default_reserved_ratio() -> f64 {
    DEFAULT_RESERVED_FOR_GENERATION_RATIO
}

fn default_min_memory_budget() -> usize {
    DEFAULT_MIN_MEMORY_BUDGET
}

fn default_record_overhead_tokens() -> usize {
    DEFAULT_RECORD_OVERHEAD_TOKENS
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            memory_budget_ratio: default_memory_budget_ratio(),
            reserved_for_generation_ratio: default_reserved_ratio(),
            min_memory_budget: default_min_memory_budget(),
            record_overhead_tokens: default_record_overhead_tokens(),
        }
    }
}

/// Computes the memory budget and picks records that fit it.
#[derive(Debug, Clone, Default)]
pub struct ContextBudgetManager {
    config: BudgetConfig,
    counter: TokenCounter,
}

impl ContextBudgetManager {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            counter: TokenCounter::default(),
        }
    }

    pub fn with_counter(mut self, counter: TokenCounter) -> Self {
        self.counter = counter;
        self
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Tokens available for memory given the live context.
    ///
    /// `(max - used - reserved) * memory_ratio`, never below `min_memory_budget`.
    pub fn calculate_available_budget(&self, messages: &[Message], system_prompt: &str) -> usize {
        let used = self.counter.count_text(system_prompt) + self.counter.count_messages(messages);
        let max = self.config.max_context_tokens as f64;
        let reserved = max * self.config.reserved_for_generation_ratio;
        let available_for_all = max - used as f64 - reserved;
        let memory_budget = available_for_all * self.config.memory_budget_ratio;

        let budget = if memory_budget.is_finite() && memory_budget > 0.0 {
            (memory_budget as usize).max(self.config.min_memory_budget)
        } else {
            self.config.min_memory_budget
        };

        tracing::debug!(used, budget, "Calculated memory budget");
        budget
    }

    pub fn estimate_record_tokens(&self, record: &MemoryRecord) -> usize {
        self.counter.count_text(&record.content) + self.config.record_overhead_tokens
    }

    /// Highest-scoring records whose estimated size fits `budget`.
    ///
    /// The best candidate is returned even when it alone exceeds the budget,
    /// so a positive budget with any candidate never yields an empty result.
    pub fn select_within_budget(
        &self,
        mut candidates: Vec<MemoryRecord>,
        budget: usize,
    ) -> Vec<MemoryRecord> {
        if candidates.is_empty() || budget == 0 {
            return Vec::new();
        }

        candidates.sort_by(|a, b| b.score().total_cmp(&a.score()));

        let mut selected = Vec::new();
        let mut running = 0usize;
        for record in candidates {
            let tokens = self.estimate_record_tokens(&record);
            if running + tokens <= budget {
                running += tokens;
                selected.push(record);
            } else if selected.is_empty() {
                tracing::debug!(
                    tokens,
                    budget,
                    "Top memory exceeds budget on its own, including it anyway"
                );
                selected.push(record);
                break;
            } else {
                break;
            }
        }
        selected
    }
}
