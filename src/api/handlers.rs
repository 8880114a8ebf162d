//! Application state and the gateway's own endpoints (health, catalog).

use axum::{
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::api::auth::verify_auth;
use crate::api::models::{ModelEntryInfo, ModelList};
use crate::core::config_store::ConfigStore;
use crate::core::error::Result;
use crate::core::http_client::ClientPool;
use crate::core::request_log::RequestLogRing;
use crate::services::model_resolver::ModelResolver;
use crate::services::provider_pool::ProviderPool;

/// Shared application state.
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub clients: Arc<ClientPool>,
    pub providers: Arc<ProviderPool>,
    pub resolver: ModelResolver,
    pub request_log: Arc<RequestLogRing>,
}

impl AppState {
    pub fn new(config: Arc<ConfigStore>) -> anyhow::Result<Arc<Self>> {
        let snapshot = config.snapshot();
        let clients = Arc::new(ClientPool::new(&snapshot.preferences)?);
        let providers = Arc::new(ProviderPool::new(&snapshot));
        let resolver = ModelResolver::new(clients.clone());
        Ok(Arc::new(Self {
            config,
            clients,
            providers,
            resolver,
            request_log: Arc::new(RequestLogRing::default()),
        }))
    }

    /// Re-read the backing file and, on a swap, rebuild the dependent
    /// caches. Called by the periodic reload task and directly from tests.
    pub fn reload_config(&self) {
        if let Some(snapshot) = self.config.reload_if_changed() {
            if let Err(error) = self.clients.rebuild_if_changed(&snapshot.preferences) {
                tracing::error!(error = %error, "Keeping previous upstream client");
            }
            self.providers.rebuild(&snapshot);
        }
    }

    /// Per-attempt deadline from the active snapshot.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.config.snapshot().preferences.model_timeout)
    }
}

/// Liveness endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok"
    }))
}

/// `GET /v1/models`: the aggregated model catalog.
///
/// Iterates all enabled providers regardless of cooldown, merges explicit
/// entries (by their caller-visible name) with discovered ids, suppresses
/// duplicates and wildcard-only patterns, and returns a sorted list.
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ModelList>> {
    let snapshot = state.config.snapshot();
    verify_auth(&headers, &snapshot.api_key)?;

    state
        .resolver
        .ensure_discovered(&state.providers, state.attempt_timeout())
        .await;

    let mut ids = BTreeSet::new();
    for spec in state.providers.specs().iter() {
        if !spec.config.enabled {
            continue;
        }
        if spec.config.models.is_empty() {
            if let Some(models) = state.providers.discovered_models(&spec.config.name) {
                ids.extend(models);
            }
            continue;
        }
        for entry in &spec.config.models {
            if entry.is_wildcard() {
                continue;
            }
            if let Some(name) = entry.visible_name() {
                ids.insert(name.to_string());
            }
        }
    }

    let data = ids.into_iter().map(ModelEntryInfo::new).collect();
    Ok(Json(ModelList { data }))
}
