use anyhow::Result;
use recallflow_ai::memory::{ModelLimitRegistry, ModelLimitsSource};
use serde_json::json;

use crate::output::{OutputFormat, key_value_table, print_json, print_table};

pub fn run(registry: &ModelLimitRegistry, model: &str, format: OutputFormat) -> Result<()> {
    let resolved = registry.resolve(model);
    let (source, matched) = match &resolved.source {
        ModelLimitsSource::Exact => ("exact", None),
        ModelLimitsSource::ProviderPrefixed => ("provider_prefixed", None),
        ModelLimitsSource::Normalized(key) => ("normalized", Some(key.as_str())),
        ModelLimitsSource::DefaultFallback => ("default", None),
    };

    if format.is_json() {
        return print_json(&json!({
            "model": model,
            "max_input_tokens": resolved.limits.max_input_tokens,
            "max_output_tokens": resolved.limits.max_output_tokens,
            "source": source,
            "matched": matched,
        }));
    }

    print_table(key_value_table([
        ("Model", model.to_string()),
        ("Max input tokens", resolved.limits.max_input_tokens.to_string()),
        ("Max output tokens", resolved.limits.max_output_tokens.to_string()),
        ("Source", source.to_string()),
        ("Matched", matched.unwrap_or("-").to_string()),
    ]));
    Ok(())
}
