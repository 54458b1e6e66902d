//! Sliding window over short-term conversation history.
//!
//! Drops the oldest turns when the history grows past a turn limit or a token
//! threshold. Cuts only ever land on safe cut points (a user message reached
//! with no tool call awaiting its result), so a tool call is never separated
//! from its result. The leading system message is always kept verbatim.
//!
//! # Example
//!
//! ```
//! use recallflow_ai::llm::Message;
//! use recallflow_ai::memory::{SlidingWindowConfig, SlidingWindowEngine};
//!
//! let engine = SlidingWindowEngine::new(SlidingWindowConfig {
//!     max_turns: 2,
//!     ..SlidingWindowConfig::default()
//! });
//!
//! let history = vec![
//!     Message::system("You are helpful."),
//!     Message::user("one"),
//!     Message::assistant("1"),
//!     Message::user("two"),
//!     Message::assistant("2"),
//!     Message::user("three"),
//!     Message::assistant("3"),
//! ];
//!
//! assert!(engine.should_slide(&history));
//! let kept = engine.slide(history);
//! assert_eq!(kept.len(), 5);
//! assert_eq!(kept[1].content, "two");
//! ```

use serde::{Deserialize, Serialize};

use super::tokens::TokenCounter;
use super::tool_pairing::{has_unresolved_tool_calls, safe_cut_points};
use crate::llm::Message;

/// Default maximum number of turns before the window slides.
pub const DEFAULT_MAX_TURNS: usize = 20;
/// Default fraction of `max_tokens` that triggers a slide.
pub const DEFAULT_WINDOW_TRIGGER_THRESHOLD: f64 = 0.8;
/// Default fraction of `max_tokens` the kept slice must fit under.
pub const DEFAULT_WINDOW_TARGET_THRESHOLD: f64 = 0.6;

/// Sliding window configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    /// Slide once the number of turns exceeds this.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Keep exactly this many trailing turns instead of fitting to the
    /// token target.
    #[serde(default)]
    pub keep_turns: Option<usize>,
    /// Model context size the thresholds are relative to.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: f64,
    #[serde(default = "default_target_threshold")]
    pub target_threshold: f64,
    /// Also slide when the token count crosses the trigger threshold.
    #[serde(default = "default_true")]
    pub auto_protect: bool,
}

fn default_max_turns() -> usize {
    DEFAULT_MAX_TURNS
}

fn default_max_tokens() -> usize {
    super::model_limits::DEFAULT_MAX_INPUT_TOKENS
}

fn default_trigger_threshold() -> f64 {
    DEFAULT_WINDOW_TRIGGER_THRESHOLD
}

fn default_target_threshold() -> f64 {
    DEFAULT_WINDOW_TARGET_THRESHOLD
}

fn default_true() -> bool {
    true
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            keep_turns: None,
            max_tokens: default_max_tokens(),
            trigger_threshold: default_trigger_threshold(),
            target_threshold: default_target_threshold(),
            auto_protect: true,
        }
    }
}

impl SlidingWindowConfig {
    fn trigger_tokens(&self) -> usize {
        (self.max_tokens as f64 * self.trigger_threshold) as usize
    }

    fn target_tokens(&self) -> usize {
        (self.max_tokens as f64 * self.target_threshold) as usize
    }
}

/// Truncates history to protocol-safe boundaries.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindowEngine {
    config: SlidingWindowConfig,
    counter: TokenCounter,
}

impl SlidingWindowEngine {
    pub fn new(config: SlidingWindowConfig) -> Self {
        Self::with_counter(config, TokenCounter::default())
    }

    pub fn with_counter(config: SlidingWindowConfig, counter: TokenCounter) -> Self {
        Self { config, counter }
    }

    pub fn config(&self) -> &SlidingWindowConfig {
        &self.config
    }

    /// Whether the history should be truncated now.
    ///
    /// Always false while a tool call is waiting for its result.
    pub fn should_slide(&self, messages: &[Message]) -> bool {
        if has_unresolved_tool_calls(messages) {
            return false;
        }

        let turns = safe_cut_points(messages).len();
        if turns > self.config.max_turns {
            return true;
        }

        self.config.auto_protect
            && self.counter.count_messages(messages) > self.config.trigger_tokens()
    }

    /// Drop the oldest turns, keeping the system message.
    ///
    /// Returns the input unchanged when there is no safe cut point.
    pub fn slide(&self, messages: Vec<Message>) -> Vec<Message> {
        let (system, rest) = split_system(messages);
        let cut_points = safe_cut_points(&rest);

        if cut_points.is_empty() {
            tracing::debug!("No safe cut point, window left unchanged");
            return rejoin(system, rest);
        }

        let total_turns = cut_points.len();
        let keep = match self.config.keep_turns {
            Some(n) => n.clamp(1, total_turns),
            None => self.fit_turns(system.as_ref(), &rest, &cut_points),
        };
        let cut = cut_points[total_turns - keep];

        tracing::debug!(
            total_turns,
            kept_turns = keep,
            dropped_messages = cut,
            "Sliding conversation window"
        );

        let kept = rest.into_iter().skip(cut).collect();
        rejoin(system, kept)
    }

    /// Largest turn count (up to `max_turns`) whose slice fits the token target.
    fn fit_turns(&self, system: Option<&Message>, rest: &[Message], cut_points: &[usize]) -> usize {
        let total_turns = cut_points.len();
        let start = total_turns.min(self.config.max_turns.max(1));
        let target = self.config.target_tokens();
        let system_tokens = system.map_or(0, |m| self.counter.count_message(m));

        for keep in (1..=start).rev() {
            let cut = cut_points[total_turns - keep];
            let tokens = system_tokens + self.counter.count_messages(&rest[cut..]);
            if tokens <= target {
                return keep;
            }
        }
        1
    }
}

/// Split off the leading system message, if any.
pub(crate) fn split_system(messages: Vec<Message>) -> (Option<Message>, Vec<Message>) {
    let mut iter = messages.into_iter().peekable();
    let system = iter.next_if(Message::is_system);
    (system, iter.collect())
}

pub(crate) fn rejoin(system: Option<Message>, rest: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::with_capacity(rest.len() + 1);
    out.extend(system);
    out.extend(rest);
    out
}
