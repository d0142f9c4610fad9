//! Service configuration via a TOML file plus environment overrides.
//!
//! The file is named by `COLLABORATOR_CONFIG`; when unset every field
//! takes its default. Environment variables win over the file:
//!
//! | Variable                 | Field            |
//! |--------------------------|------------------|
//! | `COLLABORATOR_BIND_ADDR` | `bind_addr`      |
//! | `TRANSACTOR_URL`         | `transactor_url` |
//! | `SERVER_SECRET`          | `secret`         |
//! | `SERVICE_ID`             | `service_id`     |
//! | `STORAGE_PATH`           | `storage_path`   |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::server::ServerConfig;
use crate::storage::StoreConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "COLLABORATOR_CONFIG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration of a collaborator process.
///
/// # Example
///
/// ```toml
/// bind_addr = "0.0.0.0:3078"
/// transactor_url = "ws://transactor:3333"
/// service_id = "collaborator"
/// secret = "change-me"
/// storage_path = "/var/lib/collaborator"
/// flush_interval_ms = 10000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorConfig {
    pub bind_addr: String,
    /// Base URL of the transactor; the credential is appended as a path segment
    pub transactor_url: String,
    /// Sent as `User-Agent` on transactor connections
    pub service_id: String,
    /// Shared secret for signing and verifying tokens
    pub secret: String,
    pub credential_ttl_secs: u64,
    pub storage_path: PathBuf,
    pub flush_interval_ms: u64,
    pub broadcast_capacity: usize,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            bind_addr: server.bind_addr,
            transactor_url: "ws://127.0.0.1:3333".to_string(),
            service_id: "collaborator".to_string(),
            secret: "secret".to_string(),
            credential_ttl_secs: 60,
            storage_path: StoreConfig::default().path,
            flush_interval_ms: server.flush_interval.as_millis() as u64,
            broadcast_capacity: server.broadcast_capacity,
        }
    }
}

impl CollaboratorConfig {
    /// Load from the file named by `COLLABORATOR_CONFIG` (if any), then
    /// apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overwrite fields for which `lookup` yields a value.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("COLLABORATOR_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("TRANSACTOR_URL") {
            self.transactor_url = v;
        }
        if let Some(v) = lookup("SERVER_SECRET") {
            self.secret = v;
        }
        if let Some(v) = lookup("SERVICE_ID") {
            self.service_id = v;
        }
        if let Some(v) = lookup("STORAGE_PATH") {
            self.storage_path = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::Invalid("secret must not be empty".into()));
        }
        if self.service_id.is_empty() {
            return Err(ConfigError::Invalid("service_id must not be empty".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid("flush_interval_ms must be positive".into()));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid("broadcast_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr.clone(),
            broadcast_capacity: self.broadcast_capacity,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.storage_path.clone(),
            ..StoreConfig::default()
        }
    }

    pub fn credential_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_ttl_secs)
    }
}
