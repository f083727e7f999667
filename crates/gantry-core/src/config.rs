//! Executor configuration

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Full configuration for one gantryd instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    /// Address the control plane listens on
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Backend transport ("tcp" or "memory")
    #[serde(default = "default_backend_network")]
    pub backend_network: String,

    /// Backend dial string (host:port for tcp, ignored for memory)
    #[serde(default)]
    pub backend_address: String,

    /// Owner tag stamped on every container this executor creates.
    /// Containers carrying this tag are destroyed at boot.
    #[serde(default = "default_owner_name")]
    pub container_owner_name: String,

    /// CPU-share ceiling that a cpu_percent of 100 maps to
    #[serde(default = "default_max_cpu_shares")]
    pub container_max_cpu_shares: u64,

    /// How long a reservation may sit unclaimed before it is pruned
    #[serde(default = "default_pruning_interval_secs")]
    pub registry_pruning_interval_secs: u64,

    /// Grace window between the drain signal and forced cancellation
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Whether actions may run as root inside containers
    #[serde(default)]
    pub allow_privileged: bool,

    /// UDP address of the log sink
    #[serde(default = "default_log_sink_address")]
    pub log_sink_address: String,

    /// Shared secret the log envelope is signed with
    #[serde(default)]
    pub log_sink_shared_secret: String,

    /// Directory the download cache lives in
    #[serde(default = "default_cache_directory")]
    pub cache_directory: PathBuf,

    /// Download cache size ceiling in bytes
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size_bytes: u64,

    /// Number of downloads allowed in flight at once
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,

    /// Total callback delivery attempts before giving up
    #[serde(default = "default_callback_retries")]
    pub callback_retries: u32,

    /// First callback backoff; doubled on every subsequent attempt
    #[serde(default = "default_callback_backoff_ms")]
    pub callback_backoff_base_ms: u64,

    /// Run-dispatcher worker tasks
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            backend_network: default_backend_network(),
            backend_address: String::new(),
            container_owner_name: default_owner_name(),
            container_max_cpu_shares: default_max_cpu_shares(),
            registry_pruning_interval_secs: default_pruning_interval_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            allow_privileged: false,
            log_sink_address: default_log_sink_address(),
            log_sink_shared_secret: String::new(),
            cache_directory: default_cache_directory(),
            max_cache_size_bytes: default_max_cache_size(),
            download_concurrency: default_download_concurrency(),
            callback_retries: default_callback_retries(),
            callback_backoff_base_ms: default_callback_backoff_ms(),
            worker_count: default_worker_count(),
        }
    }
}

impl ExecutorConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.container_owner_name.is_empty() {
            return Err(ConfigError::Missing("container_owner_name".into()));
        }
        if self.container_max_cpu_shares == 0 {
            return Err(ConfigError::Invalid {
                key: "container_max_cpu_shares".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.download_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "download_concurrency".into(),
                reason: "must allow at least one download".into(),
            });
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid {
                key: "worker_count".into(),
                reason: "must have at least one worker".into(),
            });
        }
        match self.backend_network.as_str() {
            "tcp" if self.backend_address.is_empty() => Err(ConfigError::Missing(
                "backend_address (required for tcp backends)".into(),
            )),
            "tcp" | "memory" => Ok(()),
            other => Err(ConfigError::Invalid {
                key: "backend_network".into(),
                reason: format!("unknown transport '{other}'"),
            }),
        }
    }

    pub fn pruning_interval(&self) -> Duration {
        Duration::from_secs(self.registry_pruning_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn callback_backoff_base(&self) -> Duration {
        Duration::from_millis(self.callback_backoff_base_ms)
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:1700".to_string()
}

fn default_backend_network() -> String {
    "memory".to_string()
}

fn default_owner_name() -> String {
    "gantry".to_string()
}

fn default_max_cpu_shares() -> u64 {
    1024
}

fn default_pruning_interval_secs() -> u64 {
    600
}

fn default_drain_timeout_secs() -> u64 {
    900
}

fn default_log_sink_address() -> String {
    "127.0.0.1:3456".to_string()
}

fn default_cache_directory() -> PathBuf {
    PathBuf::from("/var/lib/gantry/cache")
}

fn default_max_cache_size() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_download_concurrency() -> usize {
    5
}

fn default_callback_retries() -> u32 {
    3
}

fn default_callback_backoff_ms() -> u64 {
    500
}

fn default_worker_count() -> usize {
    8
}
