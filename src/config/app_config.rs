use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bluetooth::{BackendKind, BackendOptions, DeviceAddress};
use crate::config::ConfigError;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(12);
pub const DEFAULT_RETRY_COUNT: u32 = 1;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_POST_CONNECT_WAIT: Duration = Duration::from_secs(2);
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(15);

const COMMAND_TIMEOUT_RANGE: (f64, f64) = (5.0, 30.0);
const RETRY_COUNT_RANGE: (u32, u32) = (0, 3);
const RETRY_DELAY_RANGE: (f64, f64) = (1.0, 10.0);
const POST_CONNECT_WAIT_RANGE: (f64, f64) = (0.5, 10.0);
const POLLING_INTERVAL_RANGE: (f64, f64) = (5.0, 120.0);

/// Durations are stored as (fractional) seconds
mod duration_secs {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| D::Error::custom(format!("invalid duration {}: {}", secs, e)))
    }
}

/// How the device is put to sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepAction {
    /// Drop the Bluetooth link only
    #[default]
    Disconnect,
    /// Power-off style command. May itself provoke a prompt on some
    /// hardware, so it is never the default.
    PowerOff,
}

impl fmt::Display for SleepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnect => write!(f, "disconnect"),
            Self::PowerOff => write!(f, "power_off"),
        }
    }
}

impl FromStr for SleepAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "disconnect" => Ok(Self::Disconnect),
            "power_off" | "poweroff" => Ok(Self::PowerOff),
            other => Err(format!("unknown sleep action '{}'", other)),
        }
    }
}

/// Timing and retry policy. Snapshotted per operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Deadline for a single backend command
    #[serde(rename = "timeout_sec", with = "duration_secs")]
    pub command_timeout: Duration,

    /// Extra attempts after the first one
    pub retry_count: u32,

    /// Pause between attempts
    #[serde(rename = "retry_delay_sec", with = "duration_secs")]
    pub retry_delay: Duration,

    /// How long to hold the connection before disconnecting on wake
    #[serde(rename = "disconnect_delay_sec", with = "duration_secs")]
    pub post_connect_wait: Duration,

    /// Query the device periodically
    pub polling_enabled: bool,

    #[serde(rename = "polling_interval_sec", with = "duration_secs")]
    pub polling_interval: Duration,

    #[serde(rename = "sleep_command_type")]
    pub sleep_action: SleepAction,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            post_connect_wait: DEFAULT_POST_CONNECT_WAIT,
            polling_enabled: false,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            sleep_action: SleepAction::Disconnect,
        }
    }
}

fn check_secs(field: &'static str, value: Duration, (min, max): (f64, f64)) -> Result<(), ConfigError> {
    let secs = value.as_secs_f64();
    if secs < min || secs > max {
        return Err(ConfigError::OutOfRange {
            field,
            value: secs,
            min,
            max,
        });
    }
    Ok(())
}

impl PolicyConfig {
    /// Check every field against its allowed range
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_secs("timeout_sec", self.command_timeout, COMMAND_TIMEOUT_RANGE)?;

        let (min, max) = RETRY_COUNT_RANGE;
        if !(min..=max).contains(&self.retry_count) {
            return Err(ConfigError::OutOfRange {
                field: "retry_count",
                value: f64::from(self.retry_count),
                min: f64::from(min),
                max: f64::from(max),
            });
        }

        check_secs("retry_delay_sec", self.retry_delay, RETRY_DELAY_RANGE)?;
        check_secs("disconnect_delay_sec", self.post_connect_wait, POST_CONNECT_WAIT_RANGE)?;
        check_secs("polling_interval_sec", self.polling_interval, POLLING_INTERVAL_RANGE)?;
        Ok(())
    }
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// The device being controlled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Display name
    pub name: String,

    /// Hardware address; required before any operation
    #[serde(rename = "mac")]
    pub address: Option<DeviceAddress>,

    pub backend: BackendKind,

    /// Control interface used by the text-session backend
    pub control_program: PathBuf,

    /// External entity whose status is mirrored when polling is off
    #[serde(rename = "media_player_entity_id")]
    pub mirror_entity: Option<String>,

    pub policy: PolicyConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "Set-top box".to_string(),
            address: None,
            backend: BackendKind::default(),
            control_program: PathBuf::from(crate::bluetooth::cli_session::DEFAULT_PROGRAM),
            mirror_entity: None,
            policy: PolicyConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// The configured address or an error naming what is missing
    pub fn require_address(&self) -> Result<DeviceAddress, ConfigError> {
        self.address.ok_or(ConfigError::MissingAddress)
    }

    /// Backend construction settings
    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            program: self.control_program.clone(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub log_level: LogLevel,
    pub log_file: Option<PathBuf>,
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub system: SystemConfig,
}

impl AppConfig {
    /// Load from the default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(&default_config_path())
    }

    /// Load from `path`; a missing file yields the defaults.
    /// The policy is validated, the address is not required here.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.device.policy.validate()?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Write to `path` as pretty JSON, creating parent directories
    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        self.device.policy.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Get the default configuration path
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .map(|config_dir| config_dir.join("btwake").join("device.json"))
        .unwrap_or_else(|| PathBuf::from("device.json"))
}
