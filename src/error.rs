//! Crate-level error type

use thiserror::Error;

use crate::bluetooth::{AddressError, BackendError};
use crate::config::ConfigError;

/// Errors that prevent a device instance from being set up or inspected.
/// Wake and sleep never return these; they report a `ControllerOutcome`.
#[derive(Debug, Error)]
pub enum WakeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid device address: {0}")]
    Address(#[from] AddressError),

    #[error("Backend unavailable: {0}")]
    Backend(#[from] BackendError),
}
