//! Model token limits and registry.
//!
//! [`ModelLimitRegistry`] maps model names to their input/output token limits.
//! It is constructed explicitly and filled once, either from the built-in
//! table ([`ModelLimitRegistry::with_builtin`]) or from a TOML document
//! ([`ModelLimitRegistry::load_toml`]), then shared read-only.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Input limit returned for models nothing in the registry matches.
pub const DEFAULT_MAX_INPUT_TOKENS: usize = 128_000;
/// Output limit returned for models nothing in the registry matches.
pub const DEFAULT_MAX_OUTPUT_TOKENS: usize = 4_096;

const DEFAULT_LIMITS: ModelLimits =
    ModelLimits::new(DEFAULT_MAX_INPUT_TOKENS, DEFAULT_MAX_OUTPUT_TOKENS);

/// Known vendor prefixes used by routers such as Bedrock (`anthropic.claude-...`).
const VENDOR_DOT_PREFIXES: &[&str] = &[
    "anthropic", "openai", "meta", "mistral", "google", "amazon", "cohere", "ai21",
];

/// One trailing date or release tag; stripped repeatedly during lookup.
static VERSION_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:[-@](?:\d{8}|\d{4}-\d{2}-\d{2})|-v\d+(?::\d+)?|-latest|-preview|-exp|-instruct|:free|:\d+)$",
    )
    .expect("version suffix pattern is valid")
});

const BUILTIN_MODELS: &[(&str, ModelLimits)] = &[
    ("claude-opus-4-6", ModelLimits::new(200_000, 32_000)),
    ("claude-sonnet-4-5", ModelLimits::new(200_000, 64_000)),
    ("claude-haiku-4-5", ModelLimits::new(200_000, 64_000)),
    ("claude-3-5-sonnet", ModelLimits::new(200_000, 8_192)),
    ("claude-3-5-haiku", ModelLimits::new(200_000, 8_192)),
    ("gpt-5", ModelLimits::new(400_000, 128_000)),
    ("gpt-5-mini", ModelLimits::new(400_000, 128_000)),
    ("gpt-5-nano", ModelLimits::new(400_000, 128_000)),
    ("gpt-4.1", ModelLimits::new(1_047_576, 32_768)),
    ("gpt-4o", ModelLimits::new(128_000, 16_384)),
    ("gpt-4o-mini", ModelLimits::new(128_000, 16_384)),
    ("o3", ModelLimits::new(200_000, 100_000)),
    ("o4-mini", ModelLimits::new(200_000, 100_000)),
    ("gemini-2.5-pro", ModelLimits::new(1_048_576, 65_536)),
    ("gemini-2.5-flash", ModelLimits::new(1_048_576, 65_536)),
    ("deepseek-chat", ModelLimits::new(64_000, 8_192)),
    ("deepseek-reasoner", ModelLimits::new(64_000, 8_192)),
];

/// Input and output token limits of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    pub max_input_tokens: usize,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: usize,
}

fn default_max_output_tokens() -> usize {
    DEFAULT_MAX_OUTPUT_TOKENS
}

impl ModelLimits {
    pub const fn new(max_input_tokens: usize, max_output_tokens: usize) -> Self {
        Self {
            max_input_tokens,
            max_output_tokens,
        }
    }
}

/// Which lookup stage produced a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLimitsSource {
    /// The name was registered as-is.
    Exact,
    /// Matched after removing a provider prefix (`openai/`, `anthropic.`).
    ProviderPrefixed,
    /// Matched after stripping date or release suffixes; holds the matched key.
    Normalized(String),
    /// Nothing matched.
    DefaultFallback,
}

/// Limits plus where they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModelLimits {
    pub limits: ModelLimits,
    pub source: ModelLimitsSource,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    models: HashMap<String, ModelLimits>,
}

/// Registry of model limits keyed by lower-cased model name.
#[derive(Debug, Clone, Default)]
pub struct ModelLimitRegistry {
    models: HashMap<String, ModelLimits>,
}

impl ModelLimitRegistry {
    /// Empty registry; every lookup falls back to the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry loaded with the built-in model table.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for (name, limits) in BUILTIN_MODELS {
            registry.register(*name, *limits);
        }
        registry
    }

    pub fn register(&mut self, model: impl AsRef<str>, limits: ModelLimits) {
        self.models
            .insert(model.as_ref().trim().to_ascii_lowercase(), limits);
    }

    /// Merge entries from a TOML document of the form
    /// `[models."name"] max_input_tokens = N`. Returns how many were added.
    pub fn load_toml(&mut self, content: &str) -> Result<usize> {
        let file: RegistryFile = toml::from_str(content)?;
        let count = file.models.len();
        for (name, limits) in file.models {
            self.register(name, limits);
        }
        tracing::debug!(count, "Loaded model limits");
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Resolve a model name: exact, then provider prefix removed, then
    /// date/release suffixes stripped one at a time, then the default.
    pub fn resolve(&self, model: &str) -> ResolvedModelLimits {
        let name = model.trim().to_ascii_lowercase();

        if let Some(limits) = self.models.get(&name) {
            return ResolvedModelLimits {
                limits: *limits,
                source: ModelLimitsSource::Exact,
            };
        }

        let bare = strip_provider(&name);
        if bare != name {
            if let Some(limits) = self.models.get(bare) {
                return ResolvedModelLimits {
                    limits: *limits,
                    source: ModelLimitsSource::ProviderPrefixed,
                };
            }
        }
        // Registered keys may themselves carry a provider prefix; the first
        // in key order wins.
        if let Some((_, limits)) = self
            .models
            .iter()
            .filter(|(key, _)| key.as_str() != name && strip_provider(key) == bare)
            .min_by(|(a, _), (b, _)| a.cmp(b))
        {
            return ResolvedModelLimits {
                limits: *limits,
                source: ModelLimitsSource::ProviderPrefixed,
            };
        }

        let mut candidate = bare.to_string();
        while let Some(m) = VERSION_SUFFIX.find(&candidate) {
            if m.start() == 0 {
                break;
            }
            candidate.truncate(m.start());
            if let Some(limits) = self.models.get(&candidate) {
                return ResolvedModelLimits {
                    limits: *limits,
                    source: ModelLimitsSource::Normalized(candidate),
                };
            }
        }

        tracing::debug!(model, "No model limits registered, using defaults");
        ResolvedModelLimits {
            limits: DEFAULT_LIMITS,
            source: ModelLimitsSource::DefaultFallback,
        }
    }

    pub fn max_input_tokens(&self, model: &str) -> usize {
        self.resolve(model).limits.max_input_tokens
    }

    pub fn max_output_tokens(&self, model: &str) -> usize {
        self.resolve(model).limits.max_output_tokens
    }
}

/// Remove a routing prefix: `openai/gpt-4o`, `anthropic:claude-x`,
/// `bedrock/anthropic.claude-x`.
fn strip_provider(name: &str) -> &str {
    let mut rest = name.rsplit('/').next().unwrap_or(name);
    if let Some((head, tail)) = rest.split_once(':')
        && !tail.is_empty()
        && head.chars().all(|c| c.is_ascii_alphabetic())
    {
        rest = tail;
    }
    if let Some((head, tail)) = rest.split_once('.')
        && VENDOR_DOT_PREFIXES.contains(&head)
    {
        rest = tail;
    }
    rest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_is_case_insensitive() {
        let registry = ModelLimitRegistry::with_builtin();
        let resolved = registry.resolve("GPT-4o");
        assert_eq!(resolved.source, ModelLimitsSource::Exact);
        assert_eq!(resolved.limits.max_input_tokens, 128_000);
    }

    #[test]
    fn provider_prefix_is_removed() {
        let registry = ModelLimitRegistry::with_builtin();
        for name in [
            "openai/gpt-4o",
            "anthropic:claude-sonnet-4-5",
            "bedrock/anthropic.claude-3-5-haiku",
        ] {
            let resolved = registry.resolve(name);
            assert_eq!(resolved.source, ModelLimitsSource::ProviderPrefixed, "{name}");
        }
    }

    #[test]
    fn registered_prefixed_key_matches_bare_name() {
        let mut registry = ModelLimitRegistry::new();
        registry.register("openrouter/acme-large", ModelLimits::new(32_000, 2_000));
        let resolved = registry.resolve("acme-large");
        assert_eq!(resolved.source, ModelLimitsSource::ProviderPrefixed);
        assert_eq!(resolved.limits.max_input_tokens, 32_000);
    }

    #[test]
    fn several_prefixed_keys_resolve_to_the_same_entry() {
        for _ in 0..16 {
            let mut registry = ModelLimitRegistry::new();
            registry.register("zeta/acme-large", ModelLimits::new(16_000, 1_000));
            registry.register("azure/acme-large", ModelLimits::new(64_000, 4_000));
            registry.register("openrouter/acme-large", ModelLimits::new(32_000, 2_000));

            let resolved = registry.resolve("vertex/acme-large");
            assert_eq!(resolved.source, ModelLimitsSource::ProviderPrefixed);
            assert_eq!(resolved.limits, ModelLimits::new(64_000, 4_000));
        }
    }

    #[test]
    fn date_and_release_suffixes_are_stripped() {
        let registry = ModelLimitRegistry::with_builtin();

        let resolved = registry.resolve("claude-3-5-sonnet-20241022");
        assert_eq!(
            resolved.source,
            ModelLimitsSource::Normalized("claude-3-5-sonnet".to_string())
        );

        let resolved = registry.resolve("gpt-4o-2024-08-06");
        assert_eq!(resolved.limits.max_input_tokens, 128_000);

        let resolved = registry.resolve("bedrock/anthropic.claude-3-5-sonnet-20241022-v2:0");
        assert_eq!(resolved.limits.max_input_tokens, 200_000);

        let resolved = registry.resolve("gemini-2.5-flash-preview");
        assert_eq!(resolved.limits.max_input_tokens, 1_048_576);
    }

    #[test]
    fn unknown_model_uses_default() {
        let registry = ModelLimitRegistry::with_builtin();
        let resolved = registry.resolve("llama-3-70b");
        assert_eq!(resolved.source, ModelLimitsSource::DefaultFallback);
        assert_eq!(registry.max_input_tokens("llama-3-70b"), DEFAULT_MAX_INPUT_TOKENS);
        assert_eq!(registry.max_output_tokens("llama-3-70b"), DEFAULT_MAX_OUTPUT_TOKENS);
    }

    #[test]
    fn empty_registry_always_falls_back() {
        let registry = ModelLimitRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.max_input_tokens("gpt-4o"), DEFAULT_MAX_INPUT_TOKENS);
    }

    #[test]
    fn load_toml_adds_entries() {
        let mut registry = ModelLimitRegistry::new();
        let added = registry
            .load_toml(
                r#"
                [models."local-llm"]
                max_input_tokens = 8192

                [models."Big-Model"]
                max_input_tokens = 1000000
                max_output_tokens = 32000
                "#,
            )
            .unwrap();

        assert_eq!(added, 2);
        assert_eq!(registry.max_input_tokens("local-llm"), 8192);
        assert_eq!(registry.max_output_tokens("local-llm"), DEFAULT_MAX_OUTPUT_TOKENS);
        assert_eq!(registry.max_output_tokens("big-model"), 32_000);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let mut registry = ModelLimitRegistry::new();
        assert!(registry.load_toml("models = [").is_err());
    }
}
