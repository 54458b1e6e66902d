use anyhow::Result;
use recallflow_ai::memory::{ContextBudgetManager, MemoryConfig, TokenCounter};
use serde_json::json;

use crate::cli::BudgetArgs;
use crate::commands::shared::read_transcript;
use crate::output::{OutputFormat, key_value_table, print_json, print_table};

pub fn run(config: &MemoryConfig, args: BudgetArgs, format: OutputFormat) -> Result<()> {
    let messages = read_transcript(&args.transcript)?;
    let manager = ContextBudgetManager::new(config.budget.clone());
    let counter = TokenCounter::default();

    let used = counter.count_text(&args.system_prompt) + counter.count_messages(&messages);
    let budget = manager.calculate_available_budget(&messages, &args.system_prompt);

    if format.is_json() {
        return print_json(&json!({
            "max_context_tokens": config.budget.max_context_tokens,
            "used_tokens": used,
            "memory_budget": budget,
        }));
    }

    print_table(key_value_table([
        ("Max context tokens", config.budget.max_context_tokens),
        ("Used tokens", used),
        ("Memory budget", budget),
    ]));
    Ok(())
}
