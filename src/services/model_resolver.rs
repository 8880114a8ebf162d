//! Upstream model discovery and alias resolution.
//!
//! Providers without an explicit `model` list advertise whatever their
//! `models_endpoint` returns. Discovery runs lazily at the first request that
//! needs it and the result is cached on the provider's runtime record until
//! its configuration entry changes. Discovery failure is non-fatal: the cache
//! stays empty and the provider simply matches nothing until the next reload.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::core::http_client::ClientPool;
use crate::services::provider_pool::{ProviderPool, ProviderSpec};

/// Fetches and caches upstream model listings.
pub struct ModelResolver {
    clients: Arc<ClientPool>,
}

impl ModelResolver {
    pub fn new(clients: Arc<ClientPool>) -> Self {
        Self { clients }
    }

    /// Run discovery for every enabled provider that relies on it and has no
    /// cached result yet. Fetches run concurrently; failures leave an empty
    /// cache entry.
    pub async fn ensure_discovered(&self, pool: &ProviderPool, timeout: Duration) {
        let pending: Vec<Arc<ProviderSpec>> = pool
            .specs()
            .iter()
            .filter(|spec| spec.config.enabled)
            .filter(|spec| spec.needs_discovery())
            .filter(|spec| pool.discovered_models(&spec.config.name).is_none())
            .cloned()
            .collect();

        if pending.is_empty() {
            return;
        }

        let fetches = pending.iter().map(|spec| self.discover(spec, timeout));
        let results = futures::future::join_all(fetches).await;

        for (spec, models) in pending.iter().zip(results) {
            pool.set_discovered_models(&spec.config.name, models);
        }
    }

    /// Fetch the provider's model listing. Returns an empty list on any
    /// failure; never propagates an error.
    pub async fn discover(&self, spec: &ProviderSpec, timeout: Duration) -> Vec<String> {
        let url = format!(
            "{}{}",
            spec.config.normalized_base_url(),
            spec.config.normalized_models_endpoint()
        );
        tracing::info!(provider = %spec.config.name, url = %url, "Discovering upstream models");

        let response = self
            .clients
            .client()
            .get(url.as_str())
            .bearer_auth(&spec.config.api_key)
            .timeout(timeout)
            .send()
            .await;

        let payload: Value = match response {
            Ok(response) if response.status().is_success() => match response.json().await {
                Ok(payload) => payload,
                Err(error) => {
                    tracing::warn!(
                        provider = %spec.config.name,
                        error = %error,
                        "Model discovery returned unreadable payload"
                    );
                    return Vec::new();
                }
            },
            Ok(response) => {
                tracing::warn!(
                    provider = %spec.config.name,
                    status = response.status().as_u16(),
                    "Model discovery failed"
                );
                return Vec::new();
            }
            Err(error) => {
                tracing::warn!(
                    provider = %spec.config.name,
                    error = %error,
                    "Model discovery failed"
                );
                return Vec::new();
            }
        };

        let models = parse_model_listing(&payload);
        if models.is_empty() {
            tracing::warn!(provider = %spec.config.name, "Provider returned no models");
        } else {
            tracing::info!(
                provider = %spec.config.name,
                count = models.len(),
                "Provider models discovered"
            );
        }
        models
    }
}

/// Parse the two common listing shapes: OpenAI `{"data":[{"id":...}]}` and
/// Gemini `{"models":[{"name":"models/..."}]}`. Gemini names lose their
/// leading `models/` prefix.
pub fn parse_model_listing(payload: &Value) -> Vec<String> {
    if let Some(data) = payload.get("data").and_then(Value::as_array) {
        return data
            .iter()
            .filter_map(|entry| entry.get("id").and_then(Value::as_str))
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
    }

    if let Some(models) = payload.get("models").and_then(Value::as_array) {
        return models
            .iter()
            .filter_map(|entry| entry.get("name").and_then(Value::as_str))
            .map(|name| name.strip_prefix("models/").unwrap_or(name))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
    }

    Vec::new()
}

/// Rewrite only the top-level `model` field of a JSON body, leaving every
/// other key untouched. Non-JSON and non-object bodies pass through
/// unchanged (aliases are a JSON-body feature only).
pub fn rewrite_model_field(body: &[u8], effective_model: &str) -> Option<Vec<u8>> {
    let mut payload: Value = serde_json::from_slice(body).ok()?;
    let obj = payload.as_object_mut()?;
    if !obj.contains_key("model") {
        return None;
    }
    obj.insert("model".to_string(), Value::String(effective_model.to_string()));
    serde_json::to_vec(&payload).ok()
}
