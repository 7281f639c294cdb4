// Root module exports
pub mod bluetooth;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod lifecycle_manager;
pub mod logging;
pub mod monitor;

// Re-exports for convenience
pub use bluetooth::{BackendError, BackendKind, DeviceAddress, ObservedState, PairingGuard, WakeBackend};
pub use config::{AppConfig, DeviceConfig, PolicyConfig, SleepAction};
pub use controller::{ControllerOutcome, WakeController};
pub use diagnostics::{DiagnosticsReport, StateSource};
pub use error::WakeError;
pub use lifecycle_manager::DeviceInstance;
pub use logging::configure_logging;
