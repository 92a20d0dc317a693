//! Configuration file parser for the feedsync service.
//!
//! The config file is optional. A missing file yields `Config::default()`.
//! Unknown top-level keys are accepted by serde but logged as warnings, since
//! they are usually typos of a real section name.
use chrono::Duration;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level service configuration.
///
/// Every section uses `#[serde(default)]` so any subset of keys can be given.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database path (`:memory:` for an ephemeral store).
    pub database_path: String,
    pub server: ServerConfig,
    pub fetch: FetchConfig,
    pub schedule: ScheduleConfig,
    pub hub: HubConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the hub callback listener binds to.
    pub listen: String,
    /// Public base URL hubs use to reach us, e.g. `https://feeds.example.com`.
    /// Push subscriptions are disabled while this is empty.
    pub callback_base: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_body_bytes: usize,
    /// Hosts (and their subdomains) that refuse our fetches.
    pub blocked_hosts: Vec<String>,
    /// Permit localhost/private addresses. Off outside of tests.
    pub allow_private_hosts: bool,
    pub user_agent: String,
}

/// Tunables for the next-due computation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub default_interval_minutes: i64,
    pub min_interval_minutes: i64,
    pub max_interval_minutes: i64,
    /// Upper bound on next-due after a push delivery.
    pub push_recheck_hours: i64,
    pub backoff_cap_hours: u32,
    /// A feed nobody opened for this long counts as not viewed.
    pub not_viewed_after_days: i64,
    /// Not-viewed feeds idle for this long are purged.
    pub retention_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub timeout_secs: u64,
    /// Expiry bump applied after an unexpected hub response.
    pub failure_backoff_hours: i64,
    /// How long a 204 keeps the feed in PendingVerification.
    pub pending_minutes: i64,
    /// Subscriptions expiring within this window are renewed.
    pub renew_before_hours: i64,
    /// Lease applied when the hub omits `hub.lease_seconds`.
    pub default_lease_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum feeds queued per update sweep (10 Hz queue, 2 minute trigger).
    pub batch_size: usize,
    pub scan_budget_secs: u64,
    pub send_batch_size: usize,
    pub retention_scan_limit: usize,
    pub retention_task_limit: usize,
    pub purge_concurrency: usize,
    pub purge_chunk_size: usize,
    /// Enqueue at most this many feeds per OPML import step.
    pub import_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub lease_secs: i64,
    pub max_attempts: i64,
    /// Finished task names are kept this long to deduplicate re-enqueues.
    pub dedup_window_hours: i64,
    pub update_sweep_secs: u64,
    pub retention_sweep_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "feedsync.db".to_string(),
            server: ServerConfig::default(),
            fetch: FetchConfig::default(),
            schedule: ScheduleConfig::default(),
            hub: HubConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            callback_base: String::new(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_body_bytes: 2 * 1024 * 1024,
            blocked_hosts: vec!["craigslist.org".to_string()],
            allow_private_hosts: false,
            user_agent: concat!("feedsync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            default_interval_minutes: 3 * 60,
            min_interval_minutes: 30,
            max_interval_minutes: 12 * 60,
            push_recheck_hours: 6,
            backoff_cap_hours: 24 * 7,
            not_viewed_after_days: 7,
            retention_days: 90,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            failure_backoff_hours: 48,
            pending_minutes: 60,
            renew_before_hours: 24,
            default_lease_secs: 5 * 24 * 3600,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10 * 60 * 2,
            scan_budget_secs: 60,
            send_batch_size: 100,
            retention_scan_limit: 10_000,
            retention_task_limit: 100,
            purge_concurrency: 4,
            purge_chunk_size: 500,
            import_limit: 10,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval_ms: 500,
            lease_secs: 120,
            max_attempts: 5,
            dedup_window_hours: 24 * 7,
            update_sweep_secs: 120,
            retention_sweep_secs: 24 * 3600,
        }
    }
}

impl ScheduleConfig {
    pub fn default_interval(&self) -> Duration {
        Duration::minutes(self.default_interval_minutes)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::minutes(self.min_interval_minutes)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::minutes(self.max_interval_minutes)
    }

    pub fn push_recheck(&self) -> Duration {
        Duration::hours(self.push_recheck_hours)
    }

    pub fn not_viewed_after(&self) -> Duration {
        Duration::days(self.not_viewed_after_days)
    }

    pub fn retention(&self) -> Duration {
        Duration::days(self.retention_days)
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 7] = [
        "database_path",
        "server",
        "fetch",
        "schedule",
        "hub",
        "scheduler",
        "worker",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            database = %config.database_path,
            listen = %config.server.listen,
            "Loaded configuration"
        );
        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
