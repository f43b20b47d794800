//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Validation rounds older than this are considered complete even if some
/// workers never reported back.
pub const VALIDATION_CEILING: Duration = Duration::from_secs(12);

/// Dispatch core configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Port the HTTP/WebSocket surface listens on.
    pub bind_port: u16,
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Ceiling after which a validation round counts as complete.
    pub validation_ceiling: Duration,
    /// How long a proven (worker, signature) pair skips validation.
    pub whitelist_ttl: Duration,
    /// How long a failed (worker, signature) pair is refused.
    pub blacklist_ttl: Duration,
    /// Interval of the sync wait reconciliation scan.
    pub sync_reconcile_interval: Duration,
    /// Interval of the expiry / rebroadcast / GC sweep.
    pub sweep_interval: Duration,
    /// Queued tasks are re-announced when their last broadcast is older than this.
    pub rebroadcast_interval: Duration,
    /// Polls only surface tasks created within this window.
    pub poll_window: Duration,
    /// Expiry applied to new tasks that do not carry their own.
    pub default_task_expiry: Duration,
    /// Terminal async tasks are deleted once older than this.
    pub async_retention: Duration,
    /// A worker counts as connected for this long after its last poll.
    pub worker_presence_window: Duration,
    /// Optional webhook receiving async completions.
    pub completion_url: Option<String>,
    /// Bearer token for `completion_url`.
    pub completion_token: Option<SecretString>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            bind_port: 8080,
            db_path: PathBuf::from("./data/task-dispatch.db"),
            validation_ceiling: VALIDATION_CEILING,
            whitelist_ttl: Duration::from_secs(6 * 3600),
            blacklist_ttl: Duration::from_secs(300),
            sync_reconcile_interval: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(10),
            rebroadcast_interval: Duration::from_secs(30),
            poll_window: Duration::from_secs(3600),
            default_task_expiry: Duration::from_secs(600),
            async_retention: Duration::from_secs(24 * 3600),
            worker_presence_window: Duration::from_secs(60),
            completion_url: None,
            completion_token: None,
        }
    }
}

impl DispatchConfig {
    /// Build from `DISPATCH_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_port: env_parse("DISPATCH_PORT").unwrap_or(defaults.bind_port),
            db_path: std::env::var("DISPATCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            validation_ceiling: env_parse("DISPATCH_VALIDATION_CEILING_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.validation_ceiling),
            whitelist_ttl: env_secs("DISPATCH_WHITELIST_TTL_SECS")
                .unwrap_or(defaults.whitelist_ttl),
            blacklist_ttl: env_secs("DISPATCH_BLACKLIST_TTL_SECS")
                .unwrap_or(defaults.blacklist_ttl),
            sync_reconcile_interval: env_parse("DISPATCH_SYNC_RECONCILE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.sync_reconcile_interval),
            sweep_interval: env_secs("DISPATCH_SWEEP_INTERVAL_SECS")
                .unwrap_or(defaults.sweep_interval),
            rebroadcast_interval: env_secs("DISPATCH_REBROADCAST_SECS")
                .unwrap_or(defaults.rebroadcast_interval),
            poll_window: env_secs("DISPATCH_POLL_WINDOW_SECS").unwrap_or(defaults.poll_window),
            default_task_expiry: env_secs("DISPATCH_TASK_EXPIRY_SECS")
                .unwrap_or(defaults.default_task_expiry),
            async_retention: env_secs("DISPATCH_ASYNC_RETENTION_SECS")
                .unwrap_or(defaults.async_retention),
            worker_presence_window: env_secs("DISPATCH_WORKER_PRESENCE_SECS")
                .unwrap_or(defaults.worker_presence_window),
            completion_url: std::env::var("DISPATCH_COMPLETION_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            completion_token: std::env::var("DISPATCH_COMPLETION_TOKEN")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
        }
    }

    /// Reject settings that would stall the sweeps or disable validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("DISPATCH_VALIDATION_CEILING_MS", self.validation_ceiling),
            ("DISPATCH_SYNC_RECONCILE_MS", self.sync_reconcile_interval),
            ("DISPATCH_SWEEP_INTERVAL_SECS", self.sweep_interval),
            ("DISPATCH_REBROADCAST_SECS", self.rebroadcast_interval),
            ("DISPATCH_TASK_EXPIRY_SECS", self.default_task_expiry),
        ];
        for (key, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        if self.completion_token.is_some() && self.completion_url.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "DISPATCH_COMPLETION_URL".to_string(),
                hint: "DISPATCH_COMPLETION_TOKEN is set but there is no URL to send it to"
                    .to_string(),
            });
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}
