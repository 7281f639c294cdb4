//! Backend capability contract shared by the text-session and library backends

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bluetooth::{DeviceAddress, PairingGuard};

/// Reachability status published for the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedState {
    #[default]
    Unknown,
    Disconnected,
    Connected,
}

impl fmt::Display for ObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Which mechanism talks to the device. Fixed per configured device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackendKind {
    /// Drives the `bluetoothctl` control interface and parses its output
    #[default]
    #[serde(rename = "bluetoothctl")]
    TextSession,
    /// Uses a Bluetooth Low Energy client library
    #[serde(rename = "ble")]
    Library,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TextSession => write!(f, "bluetoothctl"),
            Self::Library => write!(f, "ble"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bluetoothctl" | "text" | "text-session" => Ok(Self::TextSession),
            "ble" | "library" | "btleplug" => Ok(Self::Library),
            other => Err(format!("unknown backend '{}', expected bluetoothctl or ble", other)),
        }
    }
}

/// Shared failure taxonomy every backend maps its native errors onto
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Control interface or library is not available on this host
    #[error("Bluetooth environment missing: {0}")]
    EnvironmentMissing(String),

    /// A single call exceeded its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Recoverable failure, e.g. device temporarily unreachable
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// Device or agent asked for pairing; the attempt must stop
    #[error("Pairing requested: {0}")]
    PairingRequested(String),

    /// The selected backend has no way to perform this operation
    #[error("Not supported by this backend: {0}")]
    Unsupported(String),

    /// Interrupted by shutdown
    #[error("Operation cancelled")]
    Cancelled,
}

impl BackendError {
    /// Only timeouts and transient errors may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transient(_))
    }
}

/// The narrow capability set the controller drives.
///
/// Every call receives the attempt's [`PairingGuard`]; implementations must
/// feed it any text they observe and must never issue a pairing or PIN
/// confirmation command themselves.
#[async_trait]
pub trait WakeBackend: Send + Sync {
    /// Which variant this is
    fn kind(&self) -> BackendKind;

    /// Ask the device for its current connection state
    async fn query_state(
        &self,
        address: &DeviceAddress,
        guard: &PairingGuard,
    ) -> Result<ObservedState, BackendError>;

    /// Open a connection to the device
    async fn connect(&self, address: &DeviceAddress, guard: &PairingGuard) -> Result<(), BackendError>;

    /// Drop the connection to the device
    async fn disconnect(&self, address: &DeviceAddress, guard: &PairingGuard) -> Result<(), BackendError>;

    /// Power-off style sleep. Higher risk than a disconnect; opt-in only.
    async fn power_off(&self, address: &DeviceAddress, guard: &PairingGuard) -> Result<(), BackendError>;

    /// Release any held session or adapter handle
    async fn release(&self);
}

/// Settings needed to build a backend. Timing is not among them: every
/// call takes its deadline from the guard it runs under.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Control interface program for the text-session backend
    pub program: PathBuf,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from(crate::bluetooth::cli_session::DEFAULT_PROGRAM),
        }
    }
}

/// Build the backend selected at configuration time.
///
/// The text-session backend needs its control program on this host; a
/// program that cannot be resolved is reported as a missing environment
/// here rather than on the first call.
pub fn build_backend(
    kind: BackendKind,
    options: &BackendOptions,
) -> Result<Arc<dyn WakeBackend>, BackendError> {
    match kind {
        BackendKind::TextSession => {
            let program = crate::bluetooth::resolve_program(&options.program).ok_or_else(|| {
                BackendError::EnvironmentMissing(format!(
                    "control program '{}' not found",
                    options.program.display()
                ))
            })?;
            log::debug!("Using control program {}", program.display());
            Ok(Arc::new(crate::bluetooth::CliSessionBackend::new(program)))
        }
        #[cfg(feature = "ble")]
        BackendKind::Library => Ok(Arc::new(crate::bluetooth::BleBackend::new())),
        #[cfg(not(feature = "ble"))]
        BackendKind::Library => Err(BackendError::EnvironmentMissing(
            "built without the 'ble' feature".to_string(),
        )),
    }
}
