//! LLM Gateway - A multi-provider reverse proxy for LLM APIs
//!
//! This library provides a reverse proxy that accepts OpenAI-, Anthropic-
//! and Gemini-shaped HTTP requests on a single endpoint and routes each
//! request to one of several configured upstream providers:
//!
//! - **Priority Routing**: Providers grouped by priority; equal-priority
//!   upstreams share load through uniform per-request shuffling
//! - **Automatic Failover**: Upstream faults (5xx, 429, timeouts, transport
//!   errors) bounce the request to the next candidate and place the failing
//!   provider into a timed cooldown
//! - **Transparent Forwarding**: Headers and bodies pass through unchanged
//!   except for credential substitution and optional model-alias rewriting
//! - **Streaming Support**: SSE responses are copied chunk by chunk, never
//!   buffered
//! - **Hot Reload**: The configuration file is polled and re-applied without
//!   restarting the process
//!
//! # Architecture
//!
//! The codebase is organized into three main layers:
//!
//! - [`core`]: Core functionality (config, errors, HTTP client, request log)
//! - [`api`]: HTTP handlers, the proxy engine and streaming support
//! - [`services`]: Business logic (provider selection, model discovery)

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{proxy_handler, AppState};
pub use core::{AppConfig, AppError, ConfigStore, Result};
pub use services::{ModelResolver, ProviderPool};

use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the gateway router: health, model catalog, and the catch-all proxy.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health_handler))
        .route("/v1/models", get(api::list_models))
        .fallback(api::proxy_handler)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
