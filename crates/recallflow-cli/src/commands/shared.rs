use std::path::Path;

use anyhow::{Context, Result};
use recallflow_ai::memory::{MemoryConfig, ModelLimitRegistry};
use recallflow_ai::Message;
use serde::de::DeserializeOwned;

/// Built-in model limits plus any entries from `models_file`.
pub fn load_registry(models_file: Option<&Path>) -> Result<ModelLimitRegistry> {
    let mut registry = ModelLimitRegistry::with_builtin();
    if let Some(path) = models_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model limits {}", path.display()))?;
        let added = registry
            .load_toml(&content)
            .with_context(|| format!("Invalid model limits file {}", path.display()))?;
        tracing::debug!(added, path = %path.display(), "Registered extra model limits");
    }
    Ok(registry)
}

/// Engine config from `path` (or defaults), resized for `model` when given.
pub fn load_config(
    path: Option<&Path>,
    model: Option<&str>,
    registry: &ModelLimitRegistry,
) -> Result<MemoryConfig> {
    let mut config = match path {
        Some(path) => MemoryConfig::load_from_path(path)
            .with_context(|| format!("Invalid memory config {}", path.display()))?,
        None => MemoryConfig::default(),
    };
    if let Some(model) = model {
        config.apply_context_window(registry.max_input_tokens(model));
    }
    Ok(config)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

pub fn read_transcript(path: &Path) -> Result<Vec<Message>> {
    read_json(path)
}
