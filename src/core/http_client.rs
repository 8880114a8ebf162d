//! Upstream HTTP client pool.
//!
//! One pooled [`reqwest::Client`] serves all upstream traffic. It is rebuilt
//! whenever the preferences that shape it (outbound proxy, attempt timeout)
//! change; in-flight requests keep the old client alive through its internal
//! reference count, so nothing is torn down under them.
//!
//! The per-attempt deadline is applied by the proxy engine: a head deadline
//! on every send plus a separate bound on buffered body reads. Neither the
//! client nor any request carries a total timeout, which would sever
//! long-lived SSE streams; the client itself only holds a connect timeout
//! and pool tuning.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use std::sync::Mutex;
use std::time::Duration;

use super::config::PreferencesConfig;

#[derive(Debug, Clone, PartialEq)]
struct ClientSettings {
    proxy: Option<String>,
    model_timeout: f64,
}

impl ClientSettings {
    fn from_preferences(preferences: &PreferencesConfig) -> Self {
        Self {
            proxy: preferences.proxy.clone(),
            model_timeout: preferences.model_timeout,
        }
    }
}

/// Pooled upstream transport, swappable on configuration change.
pub struct ClientPool {
    client: ArcSwap<reqwest::Client>,
    settings: Mutex<ClientSettings>,
}

impl ClientPool {
    pub fn new(preferences: &PreferencesConfig) -> Result<Self> {
        let settings = ClientSettings::from_preferences(preferences);
        let client = build_client(&settings)?;
        Ok(Self {
            client: ArcSwap::from_pointee(client),
            settings: Mutex::new(settings),
        })
    }

    /// Cheap handle to the current client (clones share the pool).
    pub fn client(&self) -> reqwest::Client {
        self.client.load().as_ref().clone()
    }

    /// Rebuild the client if proxy or timeout changed. The previous client
    /// is dropped once its last in-flight request completes.
    pub fn rebuild_if_changed(&self, preferences: &PreferencesConfig) -> Result<()> {
        let desired = ClientSettings::from_preferences(preferences);
        {
            let current = self.settings.lock().unwrap_or_else(|e| e.into_inner());
            if *current == desired {
                return Ok(());
            }
        }
        let client = build_client(&desired)?;
        self.client.store(std::sync::Arc::new(client));
        *self.settings.lock().unwrap_or_else(|e| e.into_inner()) = desired;
        tracing::info!("Upstream HTTP client rebuilt after preference change");
        Ok(())
    }
}

fn build_client(settings: &ClientSettings) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs_f64(settings.model_timeout.min(10.0)))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60));

    if let Some(proxy) = settings.proxy.as_deref() {
        let proxy = reqwest::Proxy::all(proxy)
            .with_context(|| format!("invalid proxy URL: {proxy}"))?;
        builder = builder.proxy(proxy);
    }

    builder.build().context("failed to build HTTP client")
}
