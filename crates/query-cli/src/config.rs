//! Reads the on-disk TOML model/group table into the shape
//! `query_core::selector::select` consumes. API keys are never read from
//! the TOML file itself — only resolved from the environment, at
//! selection time, via `<PROVIDER>_API_KEY` (uppercased provider id).

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use query_core::{ConfiguredModel, SelectorConfig};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ConfiguredModelToml {
    provider: String,
    model_id: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    groups: Vec<String>,
    temperature: Option<f32>,
    max_output_tokens: Option<u32>,
    system_prompt: Option<String>,
    #[serde(default)]
    extra: serde_json::Map<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct AppConfigToml {
    #[serde(default)]
    models: Vec<ConfiguredModelToml>,
    #[serde(default)]
    groups: HashMap<String, Vec<String>>,
}

/// The loaded configuration: a `SelectorConfig` plus the raw group
/// membership declared per model (folded into `groups` on load, so
/// `[[models]] groups = [...]` and a top-level `[groups]` table compose
/// rather than one shadowing the other).
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub selector: SelectorConfig,
}

fn api_key_env_for(provider: &str) -> String {
    format!("{}_API_KEY", provider.to_uppercase())
}

pub async fn load(path: &Path) -> Result<AppConfig> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config file {}", path.display()))?;
    let parsed: AppConfigToml =
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;

    let mut groups = parsed.groups;
    let mut models = HashMap::new();

    for m in parsed.models {
        let key = format!("{}:{}", m.provider, m.model_id);
        for group in &m.groups {
            groups.entry(group.clone()).or_default().push(key.clone());
        }
        models.insert(
            key,
            ConfiguredModel {
                provider: m.provider.clone(),
                model_id: m.model_id,
                enabled: m.enabled,
                api_key_env: api_key_env_for(&m.provider),
                temperature: m.temperature,
                max_output_tokens: m.max_output_tokens,
                extra: m.extra,
                system_prompt: m.system_prompt,
            },
        );
    }

    Ok(AppConfig {
        selector: SelectorConfig { models, groups },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_models_and_folds_inline_groups_into_the_group_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("query.toml");
        tokio::fs::write(
            &path,
            r#"
            [[models]]
            provider = "openai"
            model_id = "gpt-4o"
            groups = ["fast"]

            [[models]]
            provider = "anthropic"
            model_id = "claude-3-5-sonnet"
            enabled = false

            [groups]
            fast = ["anthropic:claude-3-5-sonnet"]
            "#,
        )
        .await
        .unwrap();

        let config = load(&path).await.unwrap();
        assert_eq!(config.selector.models.len(), 2);
        let openai = &config.selector.models["openai:gpt-4o"];
        assert_eq!(openai.api_key_env, "OPENAI_API_KEY");
        assert!(openai.enabled);
        assert!(!config.selector.models["anthropic:claude-3-5-sonnet"].enabled);

        let mut fast = config.selector.groups["fast"].clone();
        fast.sort();
        assert_eq!(fast, vec!["anthropic:claude-3-5-sonnet".to_string(), "openai:gpt-4o".to_string()]);
    }

    #[tokio::test]
    async fn missing_file_is_a_readable_error() {
        let result = load(Path::new("/nonexistent/query.toml")).await;
        assert!(result.is_err());
    }
}
