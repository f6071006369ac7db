use anyhow::{Context, Result};
use atlas_core::paths::ContentPaths;
use atlas_core::store::StoreOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long in-flight requests get to finish once shutdown starts.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub content_dir: PathBuf,
    pub data_dir: PathBuf,
    pub busy_timeout_ms: u64,
    pub nav_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let defaults = StoreOptions::default();
        Self {
            content_dir: PathBuf::from("content"),
            data_dir: PathBuf::from("data"),
            busy_timeout_ms: defaults.busy_timeout.as_millis() as u64,
            nav_timeout_ms: defaults.nav_timeout.as_millis() as u64,
        }
    }
}

impl Config {
    /// Read the TOML file at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        Self::from_toml(&text).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn paths(&self) -> ContentPaths {
        ContentPaths::new(&self.storage.content_dir, &self.storage.data_dir)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            busy_timeout: Duration::from_millis(self.storage.busy_timeout_ms),
            nav_timeout: Duration::from_millis(self.storage.nav_timeout_ms),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_secs)
    }
}
