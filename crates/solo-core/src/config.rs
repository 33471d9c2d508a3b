use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.solod/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub store: StoreSettings,
}

impl Config {
    /// Load config from `~/.solod/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic validation for settings not expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.daemon.validate()
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".solod")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// DaemonSettings
// ---------------------------------------------------------------------------

/// Snapshot of daemon behavior read once per `start()` call — never
/// live-reloaded mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Master switch. When false, `start()` is a deliberate no-op.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// When true, channel connectors start on boot and the watchdog
    /// self-heals a stopped daemon.
    #[serde(default = "default_true")]
    pub auto_start_on_boot: bool,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Gap after which the owner is presumed dead. Keep at several
    /// multiples of the heartbeat interval (3x by default).
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
    #[serde(default)]
    pub proactive_messaging_enabled: bool,
    #[serde(default = "default_proactive_interval_ms")]
    pub proactive_interval_ms: u64,
    #[serde(default)]
    pub event_triggers_enabled: bool,
    #[serde(default = "default_true")]
    pub boot_scripts_enabled: bool,
    #[serde(default)]
    pub is_hosted_mode: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_start_on_boot: true,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            stale_threshold_ms: default_stale_threshold_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            proactive_messaging_enabled: false,
            proactive_interval_ms: default_proactive_interval_ms(),
            event_triggers_enabled: false,
            boot_scripts_enabled: true,
            is_hosted_mode: false,
        }
    }
}

impl DaemonSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "daemon.heartbeat_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.stale_threshold_ms < self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "daemon.stale_threshold_ms ({}) must be at least the heartbeat interval ({}) \
                 or every healthy owner looks stale",
                self.stale_threshold_ms, self.heartbeat_interval_ms
            )));
        }
        if self.stale_threshold_ms < self.heartbeat_interval_ms * 2 {
            tracing::warn!(
                stale_threshold_ms = self.stale_threshold_ms,
                heartbeat_interval_ms = self.heartbeat_interval_ms,
                "stale threshold below 2x heartbeat interval risks false takeovers"
            );
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_heartbeat_interval_ms() -> u64 {
    900_000
}
fn default_stale_threshold_ms() -> u64 {
    2_700_000
}
fn default_watchdog_interval_ms() -> u64 {
    120_000
}
fn default_proactive_interval_ms() -> u64 {
    1_800_000
}

// ---------------------------------------------------------------------------
// StoreSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl StoreSettings {
    /// Path with a leading `~/` expanded to the home directory.
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(rest) = self.path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.path)
    }
}

fn default_store_path() -> String {
    "~/.solod/state.db".to_string()
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}
