//! Engine configuration loaded from TOML.
//!
//! Every field has a default, so an empty document (or a missing file) is a
//! valid configuration:
//!
//! ```toml
//! [window]
//! max_turns = 30
//!
//! [extraction]
//! mode = "full_session"
//! embedding_mode = "per_record"
//!
//! [transition]
//! default_strategy = "newest_wins"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::budget::BudgetConfig;
use super::compression::CompressionConfig;
use super::conflict::ConflictConfig;
use super::extraction::ExtractionConfig;
use super::model_limits::ModelLimitRegistry;
use super::recall::RecallConfig;
use super::sliding_window::SlidingWindowConfig;
use super::transition::TransitionConfig;
use crate::error::{AiError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub window: SlidingWindowConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub transition: TransitionConfig,
    #[serde(default)]
    pub recall: RecallConfig,
    #[serde(default)]
    pub conflict: ConflictConfig,
}

impl MemoryConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Memory config not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Defaults with every token limit sized to `model`'s input window.
    pub fn for_model(registry: &ModelLimitRegistry, model: &str) -> Self {
        let mut config = Self::default();
        config.apply_context_window(registry.max_input_tokens(model));
        config
    }

    pub fn apply_context_window(&mut self, max_input_tokens: usize) {
        self.window.max_tokens = max_input_tokens;
        self.compression.max_context_tokens = max_input_tokens;
        self.budget.max_context_tokens = max_input_tokens;
    }

    /// Reject ratios outside `(0, 1]` and inverted window thresholds.
    pub fn validate(&self) -> Result<()> {
        let ratios = [
            ("window.trigger_threshold", self.window.trigger_threshold),
            ("window.target_threshold", self.window.target_threshold),
            ("compression.trigger_threshold", self.compression.trigger_threshold),
            ("budget.memory_budget_ratio", self.budget.memory_budget_ratio),
        ];
        for (name, value) in ratios {
            if !(value > 0.0 && value <= 1.0) {
                return Err(AiError::Config(format!("{name} must be in (0, 1], got {value}")));
            }
        }

        let reserved = self.budget.reserved_for_generation_ratio;
        if !(0.0..1.0).contains(&reserved) {
            return Err(AiError::Config(format!(
                "budget.reserved_for_generation_ratio must be in [0, 1), got {reserved}"
            )));
        }

        if self.window.target_threshold > self.window.trigger_threshold {
            return Err(AiError::Config(
                "window.target_threshold must not exceed window.trigger_threshold".to_string(),
            ));
        }

        if self.compression.min_summary_tokens > self.compression.max_summary_tokens {
            return Err(AiError::Config(
                "compression.min_summary_tokens must not exceed max_summary_tokens".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::conflict::ConflictStrategy;
    use crate::memory::extraction::{EmbeddingMode, ExtractionMode};
    use std::io::Write;

    #[test]
    fn empty_document_gives_defaults() {
        let config = MemoryConfig::from_toml_str("").unwrap();
        assert_eq!(config.window.max_turns, 20);
        assert_eq!(config.window.max_tokens, 128_000);
        assert_eq!(config.compression.keep_recent_turns, 5);
        assert_eq!(config.budget.min_memory_budget, 200);
        assert_eq!(config.budget.record_overhead_tokens, 10);
        assert_eq!(config.extraction.max_buffer_turns, 10);
        assert!(config.extraction.run_in_background);
        assert_eq!(config.transition.similar_top_k, 3);
        assert_eq!(config.transition.default_strategy, ConflictStrategy::NewestWithMerge);
        assert_eq!(config.recall.default_max_records, 5);
    }

    #[test]
    fn sections_override_selected_fields() {
        let config = MemoryConfig::from_toml_str(
            r#"
            [window]
            max_turns = 30
            keep_turns = 8

            [extraction]
            mode = "full_session"
            embedding_mode = "per_record"
            run_in_background = false

            [transition]
            default_strategy = "newest_wins"
            "#,
        )
        .unwrap();

        assert_eq!(config.window.max_turns, 30);
        assert_eq!(config.window.keep_turns, Some(8));
        assert_eq!(config.window.trigger_threshold, 0.8);
        assert_eq!(config.extraction.mode, ExtractionMode::FullSession);
        assert_eq!(config.extraction.embedding_mode, EmbeddingMode::PerRecord);
        assert!(!config.extraction.run_in_background);
        assert_eq!(config.transition.default_strategy, ConflictStrategy::NewestWins);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            MemoryConfig::from_toml_str("[window]\ntrigger_threshold = 1.5"),
            Err(AiError::Config(_))
        ));
        assert!(matches!(
            MemoryConfig::from_toml_str("[window]\ntarget_threshold = 0.9"),
            Err(AiError::Config(_))
        ));
        assert!(matches!(
            MemoryConfig::from_toml_str("[window\n"),
            Err(AiError::Toml(_))
        ));
    }

    #[test]
    fn load_from_path_handles_missing_and_present_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert_eq!(MemoryConfig::load_from_path(&missing).unwrap().window.max_turns, 20);

        let path = dir.path().join("memory.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[recall]\ndefault_max_records = 9").unwrap();
        assert_eq!(MemoryConfig::load_from_path(&path).unwrap().recall.default_max_records, 9);
    }

    #[test]
    fn for_model_sizes_token_limits() {
        let registry = ModelLimitRegistry::with_builtin();
        let config = MemoryConfig::for_model(&registry, "anthropic/claude-sonnet-4-5");
        assert_eq!(config.window.max_tokens, 200_000);
        assert_eq!(config.compression.max_context_tokens, 200_000);
        assert_eq!(config.budget.max_context_tokens, 200_000);

        let unknown = MemoryConfig::for_model(&registry, "mystery");
        assert_eq!(unknown.budget.max_context_tokens, 128_000);
    }
}
