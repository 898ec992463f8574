//! Resolves a user-supplied selection intent plus configuration into the
//! concrete list of models a run will dispatch to.
//!
//! `select` is a pure function over its three inputs — no direct
//! `std::env::var` call, no config-file I/O. Environment lookups go
//! through the injected [`EnvLookup`] trait, grounded on the teacher's
//! `ModeRunnerConfig::from_env` but inverted: there, the config type read
//! the environment itself; here the caller decides what "environment"
//! means, which makes precedence and missing-key behavior testable
//! without mutating the process environment.

use std::collections::{HashMap, HashSet};

use crate::error::{ClassifiedError, Layer};

/// One resolved model, ready for the orchestrator to dispatch to.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub provider: String,
    pub model_id: String,
    pub enabled: bool,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub system_prompt: Option<String>,
}

impl ModelDescriptor {
    /// The `provider:modelId` identifier used in audit entries, error
    /// messages, and rate-limiter bucket keys.
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.model_id)
    }
}

/// The on-disk shape a `ModelDescriptor` is built from, as read by
/// `query-cli`'s config loader.
#[derive(Debug, Clone)]
pub struct ConfiguredModel {
    pub provider: String,
    pub model_id: String,
    pub enabled: bool,
    pub api_key_env: String,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub system_prompt: Option<String>,
}

/// The minimal configuration shape the selector needs: a model table and
/// a group table, both keyed by `provider:modelId`/group name.
#[derive(Debug, Clone, Default)]
pub struct SelectorConfig {
    pub models: HashMap<String, ConfiguredModel>,
    pub groups: HashMap<String, Vec<String>>,
}

/// How the caller asked to select models. Precedence when resolving,
/// high to low: `Explicit` > `Single` > `Group` > `Groups` > `Default`.
/// An `Explicit` list combined with a `Group`/`Groups` filter narrows to
/// the intersection rather than replacing it.
#[derive(Debug, Clone)]
pub enum SelectionIntent {
    Explicit(Vec<String>),
    Single(String),
    Group(String),
    Groups(Vec<String>),
    Default,
}

/// Injected environment lookup, so the selector stays a pure function
/// testable without mutating `std::env`.
pub trait EnvLookup: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// `std::env`-backed `EnvLookup` for production use.
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// An `EnvLookup` over a fixed map, for tests and for `query-cli`
/// snapshotting the environment once at startup.
pub struct MapEnv(pub HashMap<String, String>);

impl EnvLookup for MapEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectionResult {
    pub models: Vec<ModelDescriptor>,
    pub warnings: Vec<String>,
    pub disabled: Vec<String>,
    pub missing_key: Vec<String>,
}

fn parse_identifier(raw: &str) -> Option<(&str, &str)> {
    raw.split_once(':').filter(|(p, m)| !p.is_empty() && !m.is_empty())
}

fn resolve_group(config: &SelectorConfig, group: &str, warnings: &mut Vec<String>) -> Vec<String> {
    match config.groups.get(group) {
        Some(members) => members.clone(),
        None => {
            warnings.push(format!("group '{group}' is not defined"));
            Vec::new()
        }
    }
}

fn candidate_keys(config: &SelectorConfig, intent: &SelectionIntent, warnings: &mut Vec<String>) -> Vec<String> {
    match intent {
        SelectionIntent::Explicit(keys) => keys.clone(),
        SelectionIntent::Single(key) => vec![key.clone()],
        SelectionIntent::Group(group) => resolve_group(config, group, warnings),
        SelectionIntent::Groups(groups) => {
            let mut seen = HashSet::new();
            let mut merged = Vec::new();
            for group in groups {
                for key in resolve_group(config, group, warnings) {
                    if seen.insert(key.clone()) {
                        merged.push(key);
                    }
                }
            }
            merged
        }
        SelectionIntent::Default => config
            .models
            .iter()
            .filter(|(_, m)| m.enabled)
            .map(|(key, _)| key.clone())
            .collect(),
    }
}

/// Resolve a selection intent against configuration, producing the
/// concrete model list a run will dispatch to. Any syntactic error,
/// missing model, or missing key becomes a warning unless the intent
/// degenerates to zero models, in which case it is a fatal
/// `InvalidRequest` error.
pub fn select(
    config: &SelectorConfig,
    intent: SelectionIntent,
    env: &dyn EnvLookup,
) -> Result<SelectionResult, ClassifiedError> {
    let mut warnings = Vec::new();
    let mut disabled = Vec::new();
    let mut missing_key = Vec::new();

    let mut keys = candidate_keys(config, &intent, &mut warnings);

    // `Explicit` combined with a group filter narrows to the intersection.
    // Modelled here as: an explicit list is itself the candidate set (per
    // precedence), so the intersection case only arises when callers pass
    // both — left to `query-cli` to fold before calling `select`, since
    // `SelectionIntent` is a single enum, not a pair. `Default` draws from
    // every enabled configured model and is sorted for a deterministic
    // order, since a `HashMap` has none of its own. Every other intent's
    // keys are left exactly as given — duplicate `provider:modelId`
    // entries in an explicit list are not deduplicated; each becomes its
    // own independent task downstream.
    if matches!(intent, SelectionIntent::Default) {
        keys.sort();
    }

    let mut models = Vec::new();
    for key in &keys {
        let Some((provider, model_id)) = parse_identifier(key) else {
            warnings.push(format!("'{key}' is not a valid provider:modelId identifier"));
            continue;
        };

        let Some(configured) = config.models.get(key) else {
            warnings.push(format!("model '{key}' is not defined in configuration"));
            continue;
        };

        if !configured.enabled {
            disabled.push(key.clone());
            warnings.push(format!("model '{key}' is disabled"));
            continue;
        }

        if env.get(&configured.api_key_env).is_none() {
            missing_key.push(key.clone());
            warnings.push(format!(
                "model '{key}' has no value for environment variable '{}'",
                configured.api_key_env
            ));
            continue;
        }

        models.push(ModelDescriptor {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            enabled: configured.enabled,
            temperature: configured.temperature,
            max_output_tokens: configured.max_output_tokens,
            extra: configured.extra.clone(),
            system_prompt: configured.system_prompt.clone(),
        });
    }

    if models.is_empty() {
        return Err(ClassifiedError::new(
            crate::error::Category::InvalidRequest,
            Layer::Orchestrator,
            "selector",
            "no model names specified",
        ));
    }

    Ok(SelectionResult {
        models,
        warnings,
        disabled,
        missing_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(provider: &str, id: &str, enabled: bool, api_key_env: &str) -> ConfiguredModel {
        ConfiguredModel {
            provider: provider.to_string(),
            model_id: id.to_string(),
            enabled,
            api_key_env: api_key_env.to_string(),
            temperature: None,
            max_output_tokens: None,
            extra: serde_json::Map::new(),
            system_prompt: None,
        }
    }

    fn config_with(models: Vec<(&str, ConfiguredModel)>, groups: Vec<(&str, Vec<&str>)>) -> SelectorConfig {
        SelectorConfig {
            models: models.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            groups: groups
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into_iter().map(String::from).collect()))
                .collect(),
        }
    }

    fn env_with(pairs: &[(&str, &str)]) -> MapEnv {
        MapEnv(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    #[test]
    fn explicit_list_resolves_in_order_with_keys_present() {
        let config = config_with(
            vec![
                ("openai:m1", model("openai", "m1", true, "OPENAI_KEY")),
                ("anthropic:m2", model("anthropic", "m2", true, "ANTHROPIC_KEY")),
            ],
            vec![],
        );
        let env = env_with(&[("OPENAI_KEY", "x"), ("ANTHROPIC_KEY", "y")]);
        let result = select(
            &config,
            SelectionIntent::Explicit(vec!["openai:m1".into(), "anthropic:m2".into()]),
            &env,
        )
        .unwrap();
        assert_eq!(result.models.len(), 2);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn empty_selection_is_fatal_invalid_request() {
        let config = SelectorConfig::default();
        let env = env_with(&[]);
        let err = select(&config, SelectionIntent::Explicit(vec![]), &env).unwrap_err();
        assert_eq!(err.category(), crate::error::Category::InvalidRequest);
        assert!(err.message().contains("no model names specified"));
    }

    #[test]
    fn missing_api_key_warns_and_excludes_but_is_not_fatal_alone() {
        let config = config_with(
            vec![
                ("p1:m1", model("p1", "m1", true, "P1_KEY")),
                ("p1:m2", model("p1", "m2", true, "P1_KEY_2")),
            ],
            vec![],
        );
        let env = env_with(&[("P1_KEY", "x")]);
        let result = select(
            &config,
            SelectionIntent::Explicit(vec!["p1:m1".into(), "p1:m2".into()]),
            &env,
        )
        .unwrap();
        assert_eq!(result.models.len(), 1);
        assert_eq!(result.missing_key, vec!["p1:m2".to_string()]);
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn disabled_model_is_excluded_and_reported() {
        let config = config_with(vec![("p1:m1", model("p1", "m1", false, "P1_KEY"))], vec![]);
        let env = env_with(&[("P1_KEY", "x")]);
        let err = select(&config, SelectionIntent::Single("p1:m1".into()), &env).unwrap_err();
        assert_eq!(err.category(), crate::error::Category::InvalidRequest);
    }

    #[test]
    fn group_intent_resolves_named_members() {
        let config = config_with(
            vec![
                ("p1:m1", model("p1", "m1", true, "P1_KEY")),
                ("p1:m2", model("p1", "m2", true, "P1_KEY")),
            ],
            vec![("fast", vec!["p1:m1"])],
        );
        let env = env_with(&[("P1_KEY", "x")]);
        let result = select(&config, SelectionIntent::Group("fast".into()), &env).unwrap();
        assert_eq!(result.models.len(), 1);
        assert_eq!(result.models[0].key(), "p1:m1");
    }

    #[test]
    fn unknown_group_warns_and_degenerates_to_fatal_when_empty() {
        let config = SelectorConfig::default();
        let env = env_with(&[]);
        let err = select(&config, SelectionIntent::Group("missing".into()), &env).unwrap_err();
        assert_eq!(err.category(), crate::error::Category::InvalidRequest);
    }

    #[test]
    fn default_intent_selects_all_enabled_models() {
        let config = config_with(
            vec![
                ("p1:m1", model("p1", "m1", true, "P1_KEY")),
                ("p1:m2", model("p1", "m2", false, "P1_KEY")),
            ],
            vec![],
        );
        let env = env_with(&[("P1_KEY", "x")]);
        let result = select(&config, SelectionIntent::Default, &env).unwrap();
        assert_eq!(result.models.len(), 1);
        assert_eq!(result.models[0].key(), "p1:m1");
    }

    #[test]
    fn explicit_duplicates_are_preserved_as_independent_entries() {
        let config = config_with(vec![("p1:m1", model("p1", "m1", true, "P1_KEY"))], vec![]);
        let env = env_with(&[("P1_KEY", "x")]);
        let result = select(
            &config,
            SelectionIntent::Explicit(vec!["p1:m1".into(), "p1:m1".into()]),
            &env,
        )
        .unwrap();
        assert_eq!(result.models.len(), 2);
    }

    #[test]
    fn malformed_identifier_warns_and_is_excluded() {
        let config = SelectorConfig::default();
        let env = env_with(&[]);
        let err = select(&config, SelectionIntent::Single("not-an-identifier".into()), &env).unwrap_err();
        assert_eq!(err.category(), crate::error::Category::InvalidRequest);
    }
}
