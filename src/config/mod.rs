//! Settings management

mod app_config;

use std::path::PathBuf;

use thiserror::Error;

use crate::bluetooth::AddressError;

pub use app_config::{
    default_config_path, AppConfig, DeviceConfig, LogLevel, PolicyConfig, SleepAction,
    SystemConfig, DEFAULT_COMMAND_TIMEOUT, DEFAULT_POLLING_INTERVAL, DEFAULT_POST_CONNECT_WAIT,
    DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY,
};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{field} = {value} is outside the allowed range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("No device address configured")]
    MissingAddress,

    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
}
