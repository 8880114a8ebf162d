//! Wire types for the gateway's own endpoints.

use serde::{Deserialize, Serialize};

/// Response shape of `GET /v1/models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub data: Vec<ModelEntryInfo>,
}

/// One catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelEntryInfo {
    pub id: String,
    pub name: String,
}

impl ModelEntryInfo {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
        }
    }
}
