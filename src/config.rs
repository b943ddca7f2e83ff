//! Configuration types for feedpipe

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::error::{Error, Result};

/// Download behavior configuration (directories, adapter selection, confirmation)
///
/// Groups settings related to how admitted items are handed to backend adapters.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Root directory for per-item working directories (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Adapter used for items whose source does not name one (default: "local")
    #[serde(default = "default_adapter")]
    pub default_adapter: String,

    /// How long a pause/unpause/remove call waits for the backend-confirmed
    /// event before reporting failed-to-confirm (default: 10s)
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout: Duration,

    /// Tracker/peer hints forwarded to adapters at task creation
    #[serde(default)]
    pub tracker_hints: Vec<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            default_adapter: default_adapter(),
            confirm_timeout: default_confirm_timeout(),
            tracker_hints: Vec::new(),
        }
    }
}

/// Rule sandbox resource budgets
///
/// Every budget applies to a single hook call, never to a whole source cycle,
/// so one broken rule cannot starve its siblings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock budget for compiling one rule script (default: 500ms)
    #[serde(default = "default_compile_timeout")]
    pub compile_timeout: Duration,

    /// Wall-clock budget for one `validate` call (default: 3s)
    #[serde(default = "default_validate_timeout")]
    pub validate_timeout: Duration,

    /// Wall-clock budget for one `describe` call (default: 3s)
    #[serde(default = "default_describe_timeout")]
    pub describe_timeout: Duration,

    /// Operation count limit per script evaluation (default: 1,000,000)
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,

    /// Concurrent `validate`/`describe` calls per cycle (default: 8)
    ///
    /// Bounds sandbox-context fan-out so one large feed cannot exhaust
    /// blocking threads.
    #[serde(default = "default_eval_concurrency")]
    pub eval_concurrency: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            compile_timeout: default_compile_timeout(),
            validate_timeout: default_validate_timeout(),
            describe_timeout: default_describe_timeout(),
            max_operations: default_max_operations(),
            eval_concurrency: default_eval_concurrency(),
        }
    }
}

/// Retry behavior for transient backend/transport failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts after the initial try (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 500ms)
    #[serde(default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Upper bound on any single retry delay (default: 30s)
    #[serde(default = "default_max_delay")]
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each failed attempt (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Randomize each delay up to 2x to avoid synchronized retries (default: true)
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Scheduler configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Supervisor loop interval — how often cron due-ness is evaluated (default: 1s)
    #[serde(default = "default_tick_interval")]
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
        }
    }
}

/// RPC downloader backend configuration (aria2-style JSON-RPC engine)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcBackendConfig {
    /// JSON-RPC endpoint, e.g. "http://127.0.0.1:6800/jsonrpc"
    pub endpoint: String,

    /// RPC secret token, sent as "token:<secret>" when set
    #[serde(default)]
    pub secret: Option<String>,

    /// Backend status poll interval (default: 1s)
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
}

/// Persistence configuration (database and content store locations)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path (default: "./feedpipe.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Content store root for completed files (default: "./library")
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            store_root: default_store_root(),
        }
    }
}

/// Main configuration for feedpipe
///
/// All sections have sensible defaults; `Config::default()` yields a working
/// single-machine setup using the in-process local fetch adapter.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Download and adapter settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Rule sandbox budgets
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Optional RPC backend; when absent only the local adapter is registered
    #[serde(default)]
    pub rpc_backend: Option<RpcBackendConfig>,

    /// Retry behavior for transient transport failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Database and content store locations
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Validate the configuration, returning the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.download.default_adapter.is_empty() {
            return Err(Error::Config {
                message: "default_adapter must not be empty".to_string(),
                key: Some("download.default_adapter".to_string()),
            });
        }

        if self.sandbox.eval_concurrency == 0 {
            return Err(Error::Config {
                message: "eval_concurrency must be at least 1".to_string(),
                key: Some("sandbox.eval_concurrency".to_string()),
            });
        }

        if self.sandbox.validate_timeout.is_zero() || self.sandbox.describe_timeout.is_zero() {
            return Err(Error::Config {
                message: "hook timeouts must be non-zero".to_string(),
                key: Some("sandbox".to_string()),
            });
        }

        if self.scheduler.tick_interval.is_zero() {
            return Err(Error::Config {
                message: "tick_interval must be non-zero".to_string(),
                key: Some("scheduler.tick_interval".to_string()),
            });
        }

        if let Some(rpc) = &self.rpc_backend
            && rpc.endpoint.is_empty()
        {
            return Err(Error::Config {
                message: "rpc endpoint must not be empty".to_string(),
                key: Some("rpc_backend.endpoint".to_string()),
            });
        }

        Ok(())
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_adapter() -> String {
    "local".to_string()
}

fn default_confirm_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_compile_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_validate_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_describe_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_max_operations() -> u64 {
    1_000_000
}

fn default_eval_concurrency() -> usize {
    8
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./feedpipe.db")
}

fn default_store_root() -> PathBuf {
    PathBuf::from("./library")
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_eval_concurrency_is_rejected() {
        let mut config = Config::default();
        config.sandbox.eval_concurrency = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("eval_concurrency"));
    }

    #[test]
    fn empty_rpc_endpoint_is_rejected() {
        let mut config = Config::default();
        config.rpc_backend = Some(RpcBackendConfig {
            endpoint: String::new(),
            secret: None,
            poll_interval: Duration::from_secs(1),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_deserializes_with_all_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.download.default_adapter, "local");
        assert_eq!(config.sandbox.eval_concurrency, 8);
        assert!(config.rpc_backend.is_none());
    }
}
