use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use recallflow_ai::memory::ConflictStrategy;

use crate::output::OutputFormat;

#[derive(Parser)]
#[command(name = "recallflow")]
#[command(version, about = "RecallFlow - conversational memory engine inspector")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Memory engine config (TOML); defaults apply when omitted or missing
    #[arg(long, global = true, env = "RECALLFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Size token limits for this model
    #[arg(long, global = true, env = "RECALLFLOW_MODEL")]
    pub model: Option<String>,

    /// Extra model limits (TOML `[models."name"]` tables)
    #[arg(long, global = true)]
    pub models_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve the token limits of a model name
    Limits {
        /// Model name, e.g. `openai/gpt-4o-2024-08-06`
        model: String,
    },

    /// Inspect sliding window and compression decisions for a transcript
    Window(WindowArgs),

    /// Compute the long-term memory token budget for a transcript
    Budget(BudgetArgs),

    /// Group memory records by topic and optionally resolve conflicts
    Topics(TopicsArgs),
}

#[derive(Args)]
pub struct WindowArgs {
    /// JSON array of chat messages
    pub transcript: PathBuf,

    /// Print the windowed transcript instead of the report
    #[arg(long)]
    pub apply: bool,
}

#[derive(Args)]
pub struct BudgetArgs {
    /// JSON array of chat messages
    pub transcript: PathBuf,

    /// System prompt counted against the budget
    #[arg(long, default_value = "")]
    pub system_prompt: String,
}

#[derive(Args)]
pub struct TopicsArgs {
    /// JSON array of `{type, content, importance?, created_at?, id?}` objects
    pub records: PathBuf,

    /// Resolve each conflict group offline with this strategy
    /// (newest-wins, importance-based, merge, newest-with-merge)
    #[arg(long, value_parser = parse_strategy)]
    pub strategy: Option<ConflictStrategy>,

    /// Tenant the records belong to
    #[arg(long, default_value = "default")]
    pub tenant: String,

    /// User the records belong to
    #[arg(long, default_value = "default")]
    pub user: String,
}

fn parse_strategy(value: &str) -> Result<ConflictStrategy, String> {
    value.parse().map_err(|err: recallflow_ai::AiError| err.to_string())
}
