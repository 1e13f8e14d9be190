//! Configuration loading for index-sync.
//!
//! Layered config: defaults -> default config file -> explicit config file
//! -> `INDEX_SYNC_*` environment variables -> CLI flags (applied by caller).
//! Default file: `<config dir>/index-sync/config.toml`.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// Restart/backoff settings shared by every supervised stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    /// First restart delay
    pub min_backoff_ms: u64,

    /// Upper bound of the (pre-jitter) restart delay
    pub max_backoff_ms: u64,

    /// Jitter: each delay is randomised by +/- this fraction
    pub random_factor: f64,

    /// Consecutive failures tolerated before giving up
    pub max_restarts: u32,

    /// Uninterrupted success needed to reset the failure count
    pub recovery_ms: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            min_backoff_ms: 1_000,
            max_backoff_ms: 120_000,
            random_factor: 0.2,
            max_restarts: 180,
            recovery_ms: 300_000,
        }
    }
}

impl BackoffSettings {
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn recovery(&self) -> Duration {
        Duration::from_millis(self.recovery_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_backoff_ms == 0 {
            return Err("min_backoff_ms must be > 0".to_string());
        }
        if self.max_backoff_ms < self.min_backoff_ms {
            return Err(format!(
                "max_backoff_ms ({}) must be >= min_backoff_ms ({})",
                self.max_backoff_ms, self.min_backoff_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.random_factor) {
            return Err(format!(
                "random_factor must be 0.0-1.0, got {}",
                self.random_factor
            ));
        }
        Ok(())
    }
}

/// Change-driven update pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterSettings {
    /// Flush interval of the change queue
    pub write_interval_ms: u64,

    /// Pending keys tolerated between flushes before the pending batch is dropped
    pub max_pending_changes: usize,

    /// Concurrent enforcement / blocklist lookups
    pub retrieval_parallelism: usize,

    /// Concurrent bulk writes
    pub persistence_parallelism: usize,

    /// Operations per bulk write
    pub max_bulk_size: usize,

    /// Delay before acknowledging applied writes
    pub ack_delay_ms: u64,

    /// Entries in the last-applied write model cache
    pub cache_capacity: usize,

    /// Age after which a cached write model is ignored
    pub cache_ttl_secs: u64,

    /// Update mapping strategy ("incremental" or "full")
    pub mapper: String,

    pub backoff: BackoffSettings,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            write_interval_ms: 1_000,
            max_pending_changes: 10_000,
            retrieval_parallelism: 16,
            persistence_parallelism: 4,
            max_bulk_size: 250,
            ack_delay_ms: 1_000,
            cache_capacity: 100_000,
            cache_ttl_secs: 600,
            mapper: "incremental".to_string(),
            backoff: BackoffSettings::default(),
        }
    }
}

impl UpdaterSettings {
    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms)
    }

    pub fn ack_delay(&self) -> Duration {
        Duration::from_millis(self.ack_delay_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("write_interval_ms", self.write_interval_ms as usize),
            ("max_pending_changes", self.max_pending_changes),
            ("retrieval_parallelism", self.retrieval_parallelism),
            ("persistence_parallelism", self.persistence_parallelism),
            ("max_bulk_size", self.max_bulk_size),
            ("cache_capacity", self.cache_capacity),
        ] {
            if value == 0 {
                return Err(format!("updater.{name} must be > 0"));
            }
        }
        self.backoff.validate()
    }
}

/// Background reconciliation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundSyncSettings {
    /// Whether passes start automatically
    pub enabled: bool,

    /// Idle time between passes; also the bookmark interval while streaming
    pub quiet_period_secs: u64,

    /// Entities modified more recently than this are not reported as drift
    pub tolerance_window_secs: u64,

    /// Status events kept for health reporting
    pub keep_events: usize,

    /// Bookmark ticks without progress before a warning is recorded
    pub bookmark_stall_ticks: u32,

    pub backoff: BackoffSettings,
}

impl Default for BackgroundSyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            quiet_period_secs: 300,
            tolerance_window_secs: 1_200,
            keep_events: 50,
            bookmark_stall_ticks: 12,
            backoff: BackoffSettings::default(),
        }
    }
}

impl BackgroundSyncSettings {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_secs(self.quiet_period_secs)
    }

    pub fn tolerance_window(&self) -> Duration {
        Duration::from_secs(self.tolerance_window_secs)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.quiet_period_secs == 0 {
            return Err("background_sync.quiet_period_secs must be > 0".to_string());
        }
        if self.keep_events < 2 {
            return Err("background_sync.keep_events must be >= 2".to_string());
        }
        self.backoff.validate()
    }
}

/// Main application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JSON file holding the background sync bookmark
    #[serde(default = "default_bookmark_path")]
    pub bookmark_path: String,

    #[serde(default)]
    pub updater: UpdaterSettings,

    #[serde(default)]
    pub background_sync: BackgroundSyncSettings,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bookmark_path() -> String {
    ProjectDirs::from("", "", "index-sync")
        .map(|p| p.data_local_dir().join("bookmark.json"))
        .unwrap_or_else(|| PathBuf::from("./bookmark.json"))
        .to_string_lossy()
        .to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            bookmark_path: default_bookmark_path(),
            updater: UpdaterSettings::default(),
            background_sync: BackgroundSyncSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (<config dir>/index-sync/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (INDEX_SYNC_*, nested keys joined by `__`)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, TypesError> {
        let config_dir = ProjectDirs::from("", "", "index-sync")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("log_level", default_log_level())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("bookmark_path", default_bookmark_path())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // e.g. INDEX_SYNC_UPDATER__MAX_BULK_SIZE=500
        builder = builder.add_source(
            Environment::with_prefix("INDEX_SYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .map_err(|e| TypesError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| TypesError::Config(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), TypesError> {
        self.updater.validate().map_err(TypesError::Config)?;
        self.background_sync.validate().map_err(TypesError::Config)?;
        Ok(())
    }
}
