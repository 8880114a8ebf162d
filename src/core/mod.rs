//! Core functionality for the gateway.
//!
//! This module contains fundamental components used throughout the
//! application:
//! - Configuration document and snapshot store (hot reload)
//! - Upstream HTTP client pool
//! - Error handling
//! - Header hygiene for transparent forwarding
//! - Request log ring

pub mod config;
pub mod config_store;
pub mod error;
pub mod header_policy;
pub mod http_client;
pub mod request_log;

// Re-export commonly used types
pub use config::{AppConfig, ModelEntry, PreferencesConfig, ProviderConfig};
pub use config_store::{ConfigStore, CONFIG_WATCH_INTERVAL_SECS};
pub use error::{AppError, ProviderFailure, Result};
pub use http_client::ClientPool;
pub use request_log::{RequestLogRecord, RequestLogRing, REQUEST_LOG_CAPACITY};
