//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Bitmask of the sampled continuous-field categories (gases | liquids).
const CONTINUOUS_CATEGORY_MASK: u8 = 16 | 32;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Synchronization protocol settings.
    pub sync: SyncConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Tunable constants of the synchronization protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum size of one transfer chunk in bytes. Default: 65 536 (64 KiB).
    pub chunk_size_bytes: usize,
    /// Seconds between host checksum broadcasts. Default: 60.
    pub sync_check_interval_seconds: u64,
    /// Simulation ticks between periodic hard syncs. `0` disables. Default: 36 000.
    pub hard_sync_interval_ticks: u64,
    /// Seconds between host heartbeats. Default: 3.
    pub heartbeat_interval_seconds: u64,
    /// Seconds without heartbeat traffic before a peer is presumed gone. Default: 10.
    pub heartbeat_timeout_seconds: u64,
    /// Unresolved checksum mismatches tolerated before escalating to a hard sync.
    /// Default: 10.
    pub drift_error_threshold: u32,
    /// Category bitmask whose mismatches never trigger resync or escalation on
    /// their own. Default: gases | liquids.
    pub tolerated_categories: u8,
    /// Number of cells sampled per continuous-field checksum. Default: 64.
    pub continuous_sample_count: usize,
    /// Maximum hard-sync chunks sent per engine tick. Default: 4.
    pub chunks_per_tick: usize,
    /// Compressed category payloads at or below this size are sent as one
    /// message instead of a chunked transfer. Default: 65 536.
    pub single_message_threshold_bytes: usize,
    /// Directory where received hard-sync blobs are written before loading.
    pub snapshot_dir: PathBuf,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Write a JSON log file next to the console output.
    pub log_to_file: bool,
}

// --- Default implementations ---

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 65_536,
            sync_check_interval_seconds: 60,
            hard_sync_interval_ticks: 36_000,
            heartbeat_interval_seconds: 3,
            heartbeat_timeout_seconds: 10,
            drift_error_threshold: 10,
            tolerated_categories: CONTINUOUS_CATEGORY_MASK,
            continuous_sample_count: 64,
            chunks_per_tick: 4,
            single_message_threshold_bytes: 65_536,
            snapshot_dir: std::env::temp_dir().join("tether-sync"),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl SyncConfig {
    /// Interval between checksum broadcasts.
    pub fn sync_check_interval(&self) -> Duration {
        Duration::from_secs(self.sync_check_interval_seconds)
    }

    /// Interval between heartbeats.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    /// Silence after which a peer is considered disconnected.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    /// Reject values the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "chunk_size_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.chunks_per_tick == 0 {
            return Err(ConfigError::Invalid {
                field: "chunks_per_tick",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.heartbeat_timeout_seconds <= self.heartbeat_interval_seconds {
            return Err(ConfigError::Invalid {
                field: "heartbeat_timeout_seconds",
                reason: format!(
                    "timeout {}s must exceed heartbeat interval {}s",
                    self.heartbeat_timeout_seconds, self.heartbeat_interval_seconds
                ),
            });
        }
        Ok(())
    }
}

// --- Load / Save / Reload ---

const CONFIG_FILE: &str = "config.ron";

/// Read, parse and validate `path`.
fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = ron::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.sync.validate()?;
    Ok(config)
}

impl Config {
    /// Load `config.ron` from `config_dir`, writing the defaults there first
    /// if it does not exist yet.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        if !path.exists() {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Wrote default sync config to {}", path.display());
            return Ok(config);
        }

        let config = read_config(&path)?;
        log::info!(
            "Loaded sync config from {} (chunk {} B, check every {} s)",
            path.display(),
            config.sync.chunk_size_bytes,
            config.sync.sync_check_interval_seconds
        );
        Ok(config)
    }

    /// Write this config to `config_dir/config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .enumerate_arrays(false);
        let text = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Encode)?;

        let path = config_dir.join(CONFIG_FILE);
        std::fs::write(&path, text).map_err(|source| ConfigError::Write { path, source })
    }

    /// Re-read the file. `Some` only when it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = read_config(&config_dir.join(CONFIG_FILE))?;
        if fresh == *self {
            return Ok(None);
        }
        log::info!("Sync config changed on disk");
        Ok(Some(fresh))
    }
}
