//! Daemon configuration
//!
//! Loads `/etc/default/sleepwalkd`, a flat `KEY=VALUE` file with `#`
//! comments. Two settings exist, both in milliseconds:
//!
//! - `sleep_time`: base suspend duration (backoff multiplies this)
//! - `wake_time`: how long the device must be idle before it may sleep
//!
//! A missing file yields the defaults; a malformed value is an error.

use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/default/sleepwalkd";

const SLEEP_TIME_KEY: &str = "sleep_time";
const WAKE_TIME_KEY: &str = "wake_time";

const DEFAULT_SLEEP_TIME_MS: u64 = 600_000;
const DEFAULT_WAKE_TIME_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Base suspend duration before backoff scaling
    pub sleep_time: Duration,
    /// Idle delay before the device becomes eligible for sleep
    pub wake_time: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sleep_time: Duration::from_millis(DEFAULT_SLEEP_TIME_MS),
            wake_time: Duration::from_millis(DEFAULT_WAKE_TIME_MS),
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults for a
    /// missing file or missing keys
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };

        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                SLEEP_TIME_KEY => config.sleep_time = parse_millis(key, value)?,
                WAKE_TIME_KEY => config.wake_time = parse_millis(key, value)?,
                _ => log::debug!("ignoring unknown config key {}", key),
            }
        }

        Ok(config)
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}
