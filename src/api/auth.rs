//! Caller admission check.
//!
//! Every proxied request and the model catalog require the configured local
//! credential, presented either as `X-API-Key: <key>` or as
//! `Authorization: Bearer <key>`. Comparison goes through SHA-256 digests so
//! the check does not leak key length or content through timing. The local
//! credential is never forwarded upstream.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::core::error::{AppError, Result};

/// Hash an API key using SHA-256.
pub fn hash_key(key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

/// Extract the caller's credential: `x-api-key` takes priority, then a
/// Bearer `Authorization` header.
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(value.trim());
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Verify the caller's admission credential against the configured one.
pub fn verify_auth(headers: &HeaderMap, expected_api_key: &str) -> Result<()> {
    let provided = extract_api_key(headers).ok_or(AppError::Unauthorized)?;
    if hash_key(provided) == hash_key(expected_api_key) {
        Ok(())
    } else {
        Err(AppError::Unauthorized)
    }
}
