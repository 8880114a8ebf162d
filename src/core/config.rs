//! Configuration management for the gateway.
//!
//! This module handles loading, validating and writing the declarative
//! configuration document (YAML, with environment variable expansion).
//! The document is the single source of truth: admission credential,
//! routing preferences and the ordered provider list.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Local admission credential required from callers.
    pub api_key: String,

    /// Routing preferences (timeouts, cooldown, outbound proxy).
    #[serde(default)]
    pub preferences: PreferencesConfig,

    /// Configured upstream providers. Order in the file is irrelevant to
    /// routing; `priority` decides.
    pub providers: Vec<ProviderConfig>,
}

/// Gateway-wide routing preferences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreferencesConfig {
    /// Per-upstream-attempt deadline in seconds.
    #[serde(default = "default_model_timeout")]
    pub model_timeout: f64,

    /// Cooldown window in seconds applied after an upstream fault.
    /// `0` disables cooldown entirely.
    #[serde(default = "default_cooldown_period")]
    pub cooldown_period: f64,

    /// Optional HTTP/HTTPS proxy applied to all upstream requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl Default for PreferencesConfig {
    fn default() -> Self {
        Self {
            model_timeout: default_model_timeout(),
            cooldown_period: default_cooldown_period(),
            proxy: None,
        }
    }
}

/// Configuration for a single upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    /// Unique provider identifier.
    #[serde(rename = "provider")]
    pub name: String,

    /// Upstream origin, e.g. `https://api.openai.com`.
    pub base_url: String,

    /// Upstream credential. Forwarded, never logged.
    pub api_key: String,

    /// Selection priority; larger is preferred.
    #[serde(default)]
    pub priority: i64,

    /// Hard switch. Accepts boolean-like strings ("true", "1", "yes", "on").
    #[serde(default = "default_true", deserialize_with = "de_bool_like")]
    pub enabled: bool,

    /// Relative path used to auto-discover models when `model` is empty.
    #[serde(default = "default_models_endpoint")]
    pub models_endpoint: String,

    /// Supported models: bare wildcard patterns or `{alias: upstream-id}`
    /// mappings. Empty means "discover from the upstream".
    #[serde(default, rename = "model", skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelEntry>,
}

/// One entry in a provider's `model` list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ModelEntry {
    /// A bare pattern, matched against the requested model with `*`/`?`
    /// wildcards (case-sensitive).
    Pattern(String),
    /// A single-key `{alias: upstream-id}` mapping. The alias side is
    /// matched like a pattern; on match the request body's `model` field is
    /// rewritten to the upstream id.
    Alias(BTreeMap<String, String>),
}

impl ModelEntry {
    /// The caller-visible name: the pattern itself, or the alias key.
    pub fn visible_name(&self) -> Option<&str> {
        match self {
            ModelEntry::Pattern(pattern) => Some(pattern.as_str()),
            ModelEntry::Alias(map) => map.keys().next().map(|k| k.as_str()),
        }
    }

    /// Whether the caller-visible name contains wildcard metacharacters.
    pub fn is_wildcard(&self) -> bool {
        self.visible_name()
            .map(|name| name.contains('*') || name.contains('?'))
            .unwrap_or(false)
    }
}

impl ProviderConfig {
    /// Base URL without a trailing slash.
    pub fn normalized_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Models endpoint with a guaranteed leading slash.
    pub fn normalized_models_endpoint(&self) -> String {
        let endpoint = self.models_endpoint.trim();
        if endpoint.starts_with('/') {
            endpoint.to_string()
        } else {
            format!("/{}", endpoint)
        }
    }
}

fn default_model_timeout() -> f64 {
    20.0
}

fn default_cooldown_period() -> f64 {
    300.0
}

fn default_true() -> bool {
    true
}

fn default_models_endpoint() -> String {
    "/v1/models".to_string()
}

/// Accept booleans, numbers and boolean-like strings for `enabled`.
fn de_bool_like<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    struct BoolLike;

    impl serde::de::Visitor<'_> for BoolLike {
        type Value = bool;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a boolean or boolean-like value")
        }

        fn visit_bool<E: serde::de::Error>(self, v: bool) -> std::result::Result<bool, E> {
            Ok(v)
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<bool, E> {
            Ok(v != 0)
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<bool, E> {
            Ok(v != 0)
        }

        fn visit_f64<E: serde::de::Error>(self, v: f64) -> std::result::Result<bool, E> {
            Ok(v != 0.0)
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<bool, E> {
            match v.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                other => Err(E::custom(format!("not a boolean-like value: {other:?}"))),
            }
        }
    }

    deserializer.deserialize_any(BoolLike)
}

impl AppConfig {
    /// Load configuration from a YAML file, expanding `${VAR}` /
    /// `${VAR:-default}` environment references before parsing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let expanded = expand_env_vars(&content);

        let config: AppConfig = serde_yaml::from_str(&expanded)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the document. Called on every load and before every write.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            bail!("api_key must be a non-empty string");
        }
        if self.providers.is_empty() {
            bail!("at least one provider must be configured under 'providers'");
        }
        if self.preferences.model_timeout <= 0.0 {
            bail!("model_timeout must be greater than zero");
        }
        if self.preferences.cooldown_period < 0.0 {
            bail!("cooldown_period must be zero or greater");
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                bail!("provider name must be a non-empty string");
            }
            if !seen.insert(provider.name.as_str()) {
                bail!("duplicate provider name: {}", provider.name);
            }
            if provider.api_key.is_empty() {
                bail!("provider api_key for {} must be non-empty", provider.name);
            }
            let parsed = url::Url::parse(&provider.base_url).with_context(|| {
                format!("provider base_url for {} is not a valid URL", provider.name)
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                bail!(
                    "provider base_url for {} must be an http(s) URL",
                    provider.name
                );
            }
            if provider.models_endpoint.trim().is_empty() {
                bail!(
                    "provider models_endpoint for {} must be non-empty",
                    provider.name
                );
            }
            for entry in &provider.models {
                match entry {
                    ModelEntry::Pattern(pattern) if pattern.is_empty() => {
                        bail!("provider model entry for {} must be non-empty", provider.name)
                    }
                    ModelEntry::Alias(map) if map.len() != 1 => {
                        bail!(
                            "provider model alias for {} must be a single-key mapping",
                            provider.name
                        )
                    }
                    ModelEntry::Alias(map)
                        if map
                            .iter()
                            .any(|(alias, id)| alias.is_empty() || id.is_empty()) =>
                    {
                        bail!(
                            "provider model alias for {} must map a non-empty alias to a non-empty id",
                            provider.name
                        )
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Serialize and atomically replace the document at `path`
    /// (write-to-temp + rename on the same filesystem).
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate()?;

        let serialized = serde_yaml::to_string(self).context("failed to serialize config")?;
        let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp_path, serialized)
            .with_context(|| format!("failed to write temp config: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!("failed to replace config file: {}", path.display())
        })?;
        Ok(())
    }
}

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
fn expand_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::?-?([^}]*))?\}").unwrap();

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");

        std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
    })
    .to_string()
}
