//! Bluetooth control: device identity, command execution and the two
//! interchangeable backends

mod address;
mod backend;
#[cfg(feature = "ble")]
mod ble_backend;
pub mod cli_session;
pub mod executor;
mod guard;

pub use address::{AddressError, DeviceAddress};

pub use backend::{
    build_backend, BackendError, BackendKind, BackendOptions, ObservedState, WakeBackend,
};

#[cfg(feature = "ble")]
pub use ble_backend::BleBackend;

pub use cli_session::{CliSessionBackend, DeviceInfo};

pub use executor::{resolve_program, CommandExecutor, ExecError, RawOutput};

pub use guard::{find_pairing_marker, PairingGuard, DEFAULT_COMMAND_DEADLINE};
