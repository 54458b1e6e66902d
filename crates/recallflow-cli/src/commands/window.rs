use anyhow::Result;
use recallflow_ai::memory::{
    MemoryConfig, SlidingWindowEngine, TokenCounter, pending_tool_calls, safe_cut_points,
};
use serde::Serialize;

use crate::cli::WindowArgs;
use crate::commands::shared::read_transcript;
use crate::output::{OutputFormat, key_value_table, print_json, print_table};

#[derive(Debug, Serialize)]
struct WindowReport {
    messages: usize,
    turns: usize,
    tokens: usize,
    pending_tool_calls: Vec<String>,
    should_slide: bool,
    over_compression_trigger: bool,
    kept_messages: usize,
    kept_turns: usize,
    tokens_after: usize,
}

pub fn run(config: &MemoryConfig, args: WindowArgs, format: OutputFormat) -> Result<()> {
    let messages = read_transcript(&args.transcript)?;
    let engine = SlidingWindowEngine::new(config.window.clone());
    let counter = TokenCounter::default();

    let tokens = counter.count_messages(&messages);
    let should_slide = engine.should_slide(&messages);
    let kept = if should_slide {
        engine.slide(messages.clone())
    } else {
        messages.clone()
    };

    if args.apply {
        return print_json(&kept);
    }

    let compression = &config.compression;
    let compression_trigger =
        (compression.max_context_tokens as f64 * compression.trigger_threshold) as usize;

    let report = WindowReport {
        messages: messages.len(),
        turns: safe_cut_points(&messages).len(),
        tokens,
        pending_tool_calls: pending_tool_calls(&messages),
        should_slide,
        over_compression_trigger: tokens >= compression_trigger,
        kept_messages: kept.len(),
        kept_turns: safe_cut_points(&kept).len(),
        tokens_after: counter.count_messages(&kept),
    };
    tracing::debug!(?report, "Window report");

    if format.is_json() {
        return print_json(&report);
    }

    let pending = if report.pending_tool_calls.is_empty() {
        "-".to_string()
    } else {
        report.pending_tool_calls.join(", ")
    };
    print_table(key_value_table([
        ("Messages", report.messages.to_string()),
        ("Turns", report.turns.to_string()),
        ("Tokens", report.tokens.to_string()),
        ("Pending tool calls", pending),
        ("Should slide", report.should_slide.to_string()),
        ("Over compression trigger", report.over_compression_trigger.to_string()),
        ("Kept messages", report.kept_messages.to_string()),
        ("Kept turns", report.kept_turns.to_string()),
        ("Tokens after", report.tokens_after.to_string()),
    ]));
    Ok(())
}
