//! Session configuration
//!
//! A plain serde structure holding every option the engine recognizes. Files
//! are TOML; missing keys fall back to [`SessionConfig::default`].

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "broker-session";
const CONFIG_FILE: &str = "session.toml";
const MAX_CLIENT_ID_LEN: usize = u16::MAX as usize;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Client identifier sent in the connect handshake; empty means generate one
    pub client_id: String,

    /// Discard subscriptions and in-flight state on terminal disconnect
    pub clean_session: bool,

    /// Idle time after which a liveness request is sent; 0 disables keepalive
    pub keep_alive_ms: u64,

    /// How long to wait for the liveness response before declaring the link lost
    pub keep_alive_grace_ms: u64,

    /// Retransmissions allowed per handshake step before `DeliveryFailed`
    pub max_retries: u32,

    /// Deadline for each handshake step of an outgoing publish
    pub retry_interval_ms: u64,

    /// Capacity of the dispatcher work queue
    pub work_queue_capacity: usize,

    /// Number of handler worker threads
    pub worker_count: usize,

    /// Longest the read path may block on a full work queue
    pub dispatch_timeout_ms: u64,

    /// Timeout for connect, subscribe, unsubscribe and disconnect handshakes
    pub handshake_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_session: true,
            keep_alive_ms: 30_000,
            keep_alive_grace_ms: 5_000,
            max_retries: 3,
            retry_interval_ms: 5_000,
            work_queue_capacity: 64,
            worker_count: 2,
            dispatch_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    /// Default config file location (`<config dir>/broker-session/session.toml`)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Loads and validates a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading session config from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded session config from {}", path.display());
        Ok(config)
    }

    /// Loads the file at [`default_path`](Self::default_path), or defaults if it does not exist
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(path)
        } else {
            debug!(
                "No config file at {}, using default settings",
                path.display()
            );
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(format!("Failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(ConfigError::Invalid(format!(
                "client_id is {} bytes, maximum is {}",
                self.client_id.len(),
                MAX_CLIENT_ID_LEN
            )));
        }
        if self.work_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "work_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.work_queue_capacity > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid(format!(
                "work_queue_capacity is {}, maximum is {}",
                self.work_queue_capacity,
                tokio::sync::Semaphore::MAX_PERMITS
            )));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.retry_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "handshake_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.keep_alive_ms > 0 && self.keep_alive_grace_ms == 0 {
            return Err(ConfigError::Invalid(
                "keep_alive_grace_ms must be greater than 0 when keepalive is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// The configured client id, or a generated `session-<timestamp>-<pid>` id
    pub fn resolved_client_id(&self) -> String {
        if self.client_id.is_empty() {
            format!(
                "session-{}-{}",
                chrono::Local::now().format("%Y%m%d%H%M%S%3f"),
                std::process::id()
            )
        } else {
            self.client_id.clone()
        }
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_ms > 0).then(|| Duration::from_millis(self.keep_alive_ms))
    }

    pub fn keep_alive_grace(&self) -> Duration {
        Duration::from_millis(self.keep_alive_grace_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
