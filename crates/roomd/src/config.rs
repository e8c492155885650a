//! Configuration file parsing and structures.
//!
//! roomd uses TOML for declarative configuration: logging, daemon-wide
//! defaults, and a `[rooms.<name>]` table per monitored room listing its
//! door and motion sensor ids.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;

use crate::occupancy::monitor::MonitorOptions;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Monitored rooms, keyed by room name
    #[serde(default)]
    pub rooms: HashMap<String, RoomConfig>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,
}

/// Daemon-wide defaults
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Timeout assumed for motion sensors with no learned value yet
    pub motion_timeout_ms: u64,

    /// Clamp floor for learned timeouts
    pub learned_floor_ms: u64,

    /// Path of the JSON settings file holding learned timeouts
    pub store_path: PathBuf,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            motion_timeout_ms: 20_000,
            learned_floor_ms: crate::occupancy::learner::DEFAULT_FLOOR_MS,
            store_path: PathBuf::from("roomd_settings.json"),
        }
    }
}

impl DefaultsConfig {
    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            default_motion_timeout: Duration::from_millis(self.motion_timeout_ms),
            learned_floor: Duration::from_millis(self.learned_floor_ms),
        }
    }
}

/// One monitored room
#[derive(Debug, Default, Clone, Deserialize)]
pub struct RoomConfig {
    /// Device ids of the room's door contact sensors
    #[serde(default)]
    pub door_sensors: Vec<String>,

    /// Device ids of the room's motion sensors
    #[serde(default)]
    pub motion_sensors: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        toml::from_str(&contents).map_err(ConfigError::Parse)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.defaults.motion_timeout_ms, 20_000);
        assert_eq!(config.defaults.learned_floor_ms, 1000);
        assert!(config.rooms.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [logging]
            level = "debug"

            [defaults]
            motion_timeout_ms = 30000
            learned_floor_ms = 2000
            store_path = "/var/lib/roomd/settings.json"

            [rooms.living_room]
            door_sensors = ["door-1", "door-2"]
            motion_sensors = ["motion-1"]

            [rooms.office]
            motion_sensors = ["motion-2"]
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.defaults.motion_timeout_ms, 30_000);
        assert_eq!(config.rooms.len(), 2);

        let living_room = config.rooms.get("living_room").unwrap();
        assert_eq!(living_room.door_sensors.len(), 2);
        assert_eq!(living_room.motion_sensors, vec!["motion-1".to_string()]);

        // Omitted sensor lists default to empty
        let office = config.rooms.get("office").unwrap();
        assert!(office.door_sensors.is_empty());
    }

    #[test]
    fn test_monitor_options_conversion() {
        let defaults = DefaultsConfig {
            motion_timeout_ms: 15_000,
            learned_floor_ms: 500,
            store_path: PathBuf::from("x.json"),
        };
        let options = defaults.monitor_options();
        assert_eq!(options.default_motion_timeout, Duration::from_secs(15));
        assert_eq!(options.learned_floor, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let result: Result<Config, _> = toml::from_str("rooms = 3");
        assert!(result.is_err());
    }
}
