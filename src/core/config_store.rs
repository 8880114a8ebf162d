//! In-memory configuration snapshot with hot reload.
//!
//! The store owns the current [`AppConfig`] behind an atomic pointer swap:
//! readers grab a snapshot reference once per request and never observe a
//! partially built document. A periodic task calls [`ConfigStore::reload_if_changed`]
//! to pick up edits to the backing file without restarting the process.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::SystemTime;

use super::config::AppConfig;

/// How often the reload task polls the backing file for changes.
pub const CONFIG_WATCH_INTERVAL_SECS: u64 = 2;

/// Snapshot store for the configuration document.
pub struct ConfigStore {
    current: ArcSwap<AppConfig>,
    path: Option<PathBuf>,
    last_mtime: Mutex<Option<SystemTime>>,
}

impl ConfigStore {
    /// Create a store around an already validated configuration.
    pub fn new(config: AppConfig, path: Option<PathBuf>) -> Self {
        let last_mtime = path.as_deref().and_then(file_mtime);
        Self {
            current: ArcSwap::from_pointee(config),
            path,
            last_mtime: Mutex::new(last_mtime),
        }
    }

    /// Load the initial configuration from disk. Failure here is fatal to
    /// startup; reload failures later are not.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = AppConfig::load(&path)?;
        Ok(Self::new(config, Some(path)))
    }

    /// Current immutable snapshot. Lock-free for readers.
    pub fn snapshot(&self) -> Arc<AppConfig> {
        self.current.load_full()
    }

    /// Path of the backing file, when the store is file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Stat the backing file; if its modification time advanced, parse and
    /// validate the new content and swap the snapshot. Returns the new
    /// snapshot when a swap happened. On validation failure the previous
    /// snapshot is retained and the error is logged, never propagated as
    /// fatal.
    pub fn reload_if_changed(&self) -> Option<Arc<AppConfig>> {
        let path = self.path.as_deref()?;
        let mtime = file_mtime(path)?;

        {
            let seen = self.last_mtime.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*seen, Some(previous) if mtime <= previous) {
                return None;
            }
        }

        match AppConfig::load(path) {
            Ok(config) => {
                let snapshot = Arc::new(config);
                self.current.store(snapshot.clone());
                *self.last_mtime.lock().unwrap_or_else(|e| e.into_inner()) = Some(mtime);
                tracing::info!(
                    path = %path.display(),
                    providers = snapshot.providers.len(),
                    "Configuration reloaded"
                );
                Some(snapshot)
            }
            Err(error) => {
                // Remember the mtime so a broken file is not re-parsed every
                // poll; the next edit gets a fresh attempt.
                *self.last_mtime.lock().unwrap_or_else(|e| e.into_inner()) = Some(mtime);
                tracing::error!(
                    path = %path.display(),
                    error = %error,
                    "Failed to reload configuration; keeping previous snapshot"
                );
                None
            }
        }
    }

    /// Validate, serialize and atomically replace the backing file, then
    /// publish the document as the current snapshot.
    pub fn write(&self, config: AppConfig) -> Result<()> {
        config.validate()?;
        if let Some(path) = self.path.as_deref() {
            config.write(path)?;
            *self.last_mtime.lock().unwrap_or_else(|e| e.into_inner()) = file_mtime(path);
        }
        self.current.store(Arc::new(config));
        Ok(())
    }

    /// Replace the snapshot directly (tests and non-file-backed setups).
    pub fn replace(&self, config: AppConfig) -> Result<Arc<AppConfig>> {
        config.validate().context("rejecting invalid snapshot")?;
        let snapshot = Arc::new(config);
        self.current.store(snapshot.clone());
        Ok(snapshot)
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
