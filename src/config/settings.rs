//! Application configuration file
//!
//! Stored as pretty printed JSON in `<config dir>/config.json`, next to the
//! `presets` directory. Every field has a default so partial files load.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn, Level};

use crate::config::autoload::AutoloadEntry;
use crate::constants::{config, injection};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Presets applied on startup, at most one per device, in config order
    #[serde(default)]
    pub autoload: Vec<AutoloadEntry>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub injection: InjectionSettings,
}

/// Timing and buffering of injection workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionSettings {
    /// How long to wait for a worker to report that its devices are open
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    /// How long to wait for a worker to exit after asking it to stop
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Relayed events buffered before newer ones are dropped
    #[serde(default = "default_relay_capacity")]
    pub relay_capacity: usize,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_start_timeout_ms() -> u64 {
    injection::START_TIMEOUT_MS
}

fn default_stop_timeout_ms() -> u64 {
    injection::STOP_TIMEOUT_MS
}

fn default_relay_capacity() -> usize {
    injection::RELAY_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            autoload: Vec::new(),
            log_level: default_log_level(),
            injection: InjectionSettings::default(),
        }
    }
}

impl Default for InjectionSettings {
    fn default() -> Self {
        Self {
            start_timeout_ms: default_start_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            relay_capacity: default_relay_capacity(),
        }
    }
}

impl InjectionSettings {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Parse a log level name, falling back to info
pub fn parse_log_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

impl Config {
    /// `~/.config/key-mapper`
    pub fn default_dir() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(config::APP_DIR);
        path
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(config::FILENAME)
    }

    /// Load configuration from a JSON file, or defaults if it doesn't exist
    ///
    /// Nothing is written for a missing file; the first save creates it.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;

        let mut config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse JSON from {:?}", path))?;
        config.dedup_autoload();

        info!("Loaded config with {} autoload preset(s)", config.autoload.len());
        Ok(config)
    }

    /// Save configuration as JSON, creating the config directory if needed
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        let mut json = serde_json::to_string_pretty(self)
            .context("Failed to serialize config to JSON")?;
        json.push('\n');

        fs::write(path, json).with_context(|| format!("Failed to write config to {:?}", path))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Hand-edited files may list a device twice, the first entry wins
    fn dedup_autoload(&mut self) {
        let before = self.autoload.len();
        let mut seen = std::collections::HashSet::new();
        self.autoload.retain(|entry| seen.insert(entry.device.clone()));
        if self.autoload.len() != before {
            warn!(
                dropped = before - self.autoload.len(),
                "Ignoring duplicate autoload entries for the same device"
            );
        }
    }
}
