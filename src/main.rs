//! LLM Gateway - Main entry point
//!
//! This binary loads the configuration file, assembles the application state
//! and runs the HTTP server. Invalid initial configuration and bind failures
//! exit non-zero; configuration problems after startup only log.

use anyhow::{Context, Result};
use clap::Parser;
use llm_gateway_rust::core::CONFIG_WATCH_INTERVAL_SECS;
use llm_gateway_rust::{build_router, AppState, ConfigStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Unified API gateway for LLM providers.
#[derive(Parser, Debug)]
#[command(name = "llm-gateway", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(long, env = "GATEWAY_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Bind host
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Bind port
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    init_tracing();

    let args = Args::parse();

    let store = Arc::new(
        ConfigStore::load(&args.config)
            .with_context(|| format!("failed to load config from {}", args.config.display()))?,
    );
    let state = AppState::new(store)?;

    {
        let snapshot = state.config.snapshot();
        tracing::info!(
            config = %args.config.display(),
            providers = snapshot.providers.len(),
            "Configuration loaded"
        );
        for provider in &snapshot.providers {
            tracing::info!(
                provider = %provider.name,
                priority = provider.priority,
                enabled = provider.enabled,
                models = provider.models.len(),
                "  - provider registered"
            );
        }
    }

    // Periodic config reload: swaps the snapshot and rebuilds dependent
    // caches when the file's mtime advances and the new content validates.
    let reload_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(CONFIG_WATCH_INTERVAL_SECS));
        interval.tick().await;
        loop {
            interval.tick().await;
            reload_state.reload_config();
        }
    });

    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", args.host, args.port))?;
    tracing::info!("Starting LLM gateway on {}", addr);
    tracing::info!("Model catalog: GET /v1/models");
    tracing::info!("All other paths proxy to the configured providers");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Initialize tracing from `RUST_LOG`, falling back to `LOG_LEVEL`
/// (default INFO). Noisy HTTP library targets stay at warn either way.
fn init_tracing() {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        std::env::var("LOG_LEVEL")
            .map(|level| level.to_lowercase())
            .unwrap_or_else(|_| "info".to_string())
    });
    let filter_str = format!("{base_filter},hyper=warn,h2=warn,reqwest=warn");

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter_str))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %error, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received");
}
