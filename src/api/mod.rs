//! API layer for the gateway.
//!
//! This module contains the admission check, the gateway's own endpoints
//! (health, model catalog), the proxy engine and streaming support.

pub mod auth;
pub mod handlers;
pub mod models;
pub mod proxy;
pub mod streaming;

// Re-export commonly used types
pub use auth::verify_auth;
pub use handlers::{health_handler, list_models, AppState};
pub use models::{ModelEntryInfo, ModelList};
pub use proxy::proxy_handler;
