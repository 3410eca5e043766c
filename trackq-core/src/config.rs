//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/trackq/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/trackq/` (~/.config/trackq/)
//! - Data: `$XDG_DATA_HOME/trackq/` (~/.local/share/trackq/)
//! - State/Logs: `$XDG_STATE_HOME/trackq/` (~/.local/state/trackq/)
//!
//! The `[tracking]` section is the configuration snapshot consumed by the
//! tracker. Snapshots are shared as `Arc<TrackingConfig>` and swapped
//! wholesale, never mutated in place.

use crate::error::{Error, Result};
use crate::request::ParameterSet;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Tracking snapshot (endpoint, sampling, overrides)
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Queue storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Delivery timers and network timeouts
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Immutable per-session view of the tracking setup.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TrackingConfig {
    /// Monotonic snapshot version; a snapshot is only adopted if newer
    #[serde(default)]
    pub version: u32,

    /// Collector domain, e.g. `https://q3.example.net`
    #[serde(default)]
    pub track_domain: String,

    /// Account identifier appended to the domain
    #[serde(default)]
    pub track_id: String,

    /// Seconds between delivery attempts (0 disables the timer)
    #[serde(default = "default_send_delay")]
    pub send_delay_secs: u64,

    /// Sampling rate: only every Nth device is tracked (0 or 1 = all)
    #[serde(default)]
    pub sampling: u32,

    /// Base URL for install-attribution requests
    #[serde(default = "default_install_attribution_url")]
    pub install_attribution_url: String,

    /// Constant parameters added to every page event
    #[serde(default)]
    pub const_global_parameters: ParameterSet,

    /// Parameters whose values name custom facts to look up
    #[serde(default)]
    pub global_parameters: ParameterSet,

    /// Per-screen overrides keyed by screen name
    #[serde(default)]
    pub screens: HashMap<String, ScreenConfig>,

    /// Collaborator facts that are merged automatically
    #[serde(default)]
    pub auto_tracked: AutoTrackConfig,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            version: 0,
            track_domain: String::new(),
            track_id: String::new(),
            send_delay_secs: default_send_delay(),
            sampling: 0,
            install_attribution_url: default_install_attribution_url(),
            const_global_parameters: ParameterSet::default(),
            global_parameters: ParameterSet::default(),
            screens: HashMap::new(),
            auto_tracked: AutoTrackConfig::default(),
        }
    }
}

fn default_send_delay() -> u64 {
    300
}

fn default_install_attribution_url() -> String {
    "https://appinstall.example.net/appinstall/v1/install".to_string()
}

/// Overrides applied when the current screen matches.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ScreenConfig {
    /// Replaces the screen name in outgoing requests
    #[serde(default)]
    pub mapping_name: Option<String>,

    /// Constant per-screen parameters
    #[serde(default)]
    pub const_parameters: ParameterSet,

    /// Per-screen parameters remapped against custom facts
    #[serde(default)]
    pub parameters: ParameterSet,
}

/// Selects which collaborator-provided custom facts end up in requests.
///
/// Both tables are mappings: each value names a custom fact (e.g.
/// `appVersion`) whose current value is sent under the given key.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct AutoTrackConfig {
    /// Facts merged into page events
    #[serde(default)]
    pub parameters: ParameterSet,

    /// Facts merged into action events
    #[serde(default)]
    pub action_parameters: ParameterSet,

    /// Expose the queue size as the `requestUrlStoreSize` fact
    #[serde(default)]
    pub request_store_size: bool,
}

impl TrackingConfig {
    /// Check if the snapshot has enough information to build requests
    pub fn is_ready(&self) -> bool {
        !self.track_domain.is_empty() && !self.track_id.is_empty()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.track_domain.is_empty() {
            return Err(Error::Config(
                "tracking.track_domain is required".to_string(),
            ));
        }
        if !self.track_domain.starts_with("http://") && !self.track_domain.starts_with("https://")
        {
            return Err(Error::Config(format!(
                "tracking.track_domain must be an http(s) URL, got {}",
                self.track_domain
            )));
        }
        if self.track_id.is_empty() {
            return Err(Error::Config("tracking.track_id is required".to_string()));
        }
        Ok(())
    }

    /// Delay between delivery attempts, `None` when the timer is disabled
    pub fn send_delay(&self) -> Option<Duration> {
        (self.send_delay_secs > 0).then(|| Duration::from_secs(self.send_delay_secs))
    }

    /// Look up the overrides for a screen
    pub fn screen(&self, name: &str) -> Option<&ScreenConfig> {
        self.screens.get(name)
    }
}

/// On-disk queue settings
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Override for the data directory (queue file, staging file, preferences)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Number of request strings kept in memory before spilling to disk
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Lines decoded per read from the backing file
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            cache_capacity: default_cache_capacity(),
            read_batch_size: default_read_batch_size(),
        }
    }
}

fn default_cache_capacity() -> usize {
    20
}

fn default_read_batch_size() -> usize {
    200
}

impl StorageConfig {
    /// Data directory, falling back to the XDG location
    pub fn resolve_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(Config::data_dir)
    }

    /// Backing file of the durable queue
    pub fn queue_path(&self) -> PathBuf {
        self.resolve_data_dir().join("tracking-requests")
    }

    /// Staging file for requests waiting on attribution
    pub fn staging_path(&self) -> PathBuf {
        self.resolve_data_dir().join("pending-requests.jsonl")
    }

    /// Preferences database (cursor, opt-out, sampling, EverID)
    pub fn preferences_path(&self) -> PathBuf {
        self.resolve_data_dir().join("preferences.db")
    }
}

/// Delivery timers and network timeouts
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// TCP connect timeout in seconds
    #[serde(default = "default_network_timeout")]
    pub connect_timeout_secs: u64,

    /// Response read timeout in seconds
    #[serde(default = "default_network_timeout")]
    pub read_timeout_secs: u64,

    /// How often the idle-flush timer fires
    #[serde(default = "default_idle_flush_interval")]
    pub idle_flush_interval_secs: u64,

    /// Inactivity window after which the queue is flushed to disk
    #[serde(default = "default_inactivity")]
    pub inactivity_secs: u64,

    /// Upper bound on teardown waiting for the in-flight worker
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_network_timeout(),
            read_timeout_secs: default_network_timeout(),
            idle_flush_interval_secs: default_idle_flush_interval(),
            inactivity_secs: default_inactivity(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_network_timeout() -> u64 {
    60
}

fn default_idle_flush_interval() -> u64 {
    30
}

fn default_inactivity() -> u64 {
    60
}

fn default_shutdown_timeout() -> u64 {
    4
}

impl DeliveryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn idle_flush_interval(&self) -> Duration {
        Duration::from_secs(self.idle_flush_interval_secs.max(1))
    }

    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load `config.toml` from the XDG config directory, or defaults if absent.
    ///
    /// The tracking section may still be incomplete afterwards; callers that
    /// need a collector check [`TrackingConfig::validate`].
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Config::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid {}: {}", path.display(), e)))?;

        if config.storage.cache_capacity == 0 {
            return Err(Error::Config(
                "storage.cache_capacity must be at least 1".to_string(),
            ));
        }
        tracing::debug!(
            path = %path.display(),
            version = config.tracking.version,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/trackq/config.toml` (~/.config/trackq/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("trackq").join("config.toml")
    }

    /// Returns the data directory path (queue file, staging file, preferences)
    ///
    /// `$XDG_DATA_HOME/trackq/` (~/.local/share/trackq/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("trackq")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/trackq/` (~/.local/state/trackq/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("trackq")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("trackq.log")
    }
}
