use crate::session::SessionConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "input_logger.json";
const LOG_DIR: &str = "input_logs";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Relative paths resolve against the app data directory.
    pub log_dir: Option<String>,
    pub file_prefix: String,
    pub dispatch_interval_ms: u64,
    pub flush_interval_secs: u64,
    pub stop_timeout_ms: u64,
    pub echo_events: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            file_prefix: "operation_log".to_string(),
            dispatch_interval_ms: 10,
            flush_interval_secs: 10,
            stop_timeout_ms: 5000,
            echo_events: false,
        }
    }
}

impl LoggerConfig {
    pub fn log_dir(&self, base_dir: &Path) -> PathBuf {
        match self.log_dir.as_deref() {
            Some(dir) => base_dir.join(dir),
            None => base_dir.join(LOG_DIR),
        }
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn session_config(&self, base_dir: &Path) -> SessionConfig {
        SessionConfig {
            log_dir: self.log_dir(base_dir),
            file_prefix: self.file_prefix.clone(),
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub log_dir: Option<String>,
    pub file_prefix: Option<String>,
    pub echo_events: Option<bool>,
}

/// `./data/timestone`, created on first use.
pub fn ensure_app_dir() -> Result<PathBuf> {
    let cwd = env::current_dir().context("Failed to read current dir")?;
    let base_dir = cwd.join("data").join("timestone");
    if !base_dir.exists() {
        fs::create_dir_all(&base_dir).context("Failed to create timestone data dir")?;
    }
    Ok(base_dir)
}

pub fn load_config(base_dir: &Path, overrides: &ConfigOverrides) -> Result<LoggerConfig> {
    let config_path = overrides
        .config_path
        .clone()
        .unwrap_or_else(|| base_dir.join(CONFIG_FILE));
    let mut config = load_or_create_config(&config_path)?;
    apply_overrides(&mut config, overrides);
    Ok(normalize_config(config))
}

/// Reads the config, or writes the defaults if there is none yet. Keys missing from an
/// existing file are filled with defaults and written back.
pub fn load_or_create_config(path: &Path) -> Result<LoggerConfig> {
    if path.exists() {
        let contents = fs::read_to_string(path).context("Failed to read config file")?;
        let stored: Value = serde_json::from_str(&contents).context("Failed to parse config file")?;
        let config: LoggerConfig = serde_json::from_value(stored.clone()).context("Failed to parse config file")?;
        let refreshed = serde_json::to_value(&config).context("Failed to serialize config")?;
        if has_missing_keys(&stored, &refreshed) {
            write_config(path, &config)?;
        }
        return Ok(config);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let config = LoggerConfig::default();
    write_config(path, &config)?;
    Ok(config)
}

fn write_config(path: &Path, config: &LoggerConfig) -> Result<()> {
    let payload = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(path, payload).context("Failed to write config file")
}

fn has_missing_keys(stored: &Value, full: &Value) -> bool {
    match (stored, full) {
        (Value::Object(stored), Value::Object(full)) => full.keys().any(|key| !stored.contains_key(key)),
        _ => false,
    }
}

pub fn apply_overrides(config: &mut LoggerConfig, overrides: &ConfigOverrides) {
    if let Some(log_dir) = overrides.log_dir.clone() {
        config.log_dir = Some(log_dir);
    }
    if let Some(file_prefix) = overrides.file_prefix.clone() {
        config.file_prefix = file_prefix;
    }
    if let Some(echo_events) = overrides.echo_events {
        config.echo_events = echo_events;
    }
}

pub fn normalize_config(mut config: LoggerConfig) -> LoggerConfig {
    config.dispatch_interval_ms = config.dispatch_interval_ms.max(1);
    config.flush_interval_secs = config.flush_interval_secs.max(1);
    config.stop_timeout_ms = config.stop_timeout_ms.max(100);
    if config.log_dir.as_ref().is_some_and(|dir| dir.trim().is_empty()) {
        config.log_dir = None;
    }
    let prefix = config.file_prefix.trim();
    if prefix.is_empty() {
        config.file_prefix = LoggerConfig::default().file_prefix;
    } else if prefix.len() != config.file_prefix.len() {
        config.file_prefix = prefix.to_string();
    }
    config
}
