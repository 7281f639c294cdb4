//! Library backend built on btleplug
//!
//! Connect/disconnect/status go through the platform BLE stack. The library
//! has no pairing event of its own, so pairing shows up as an
//! authentication error from the stack; every error message is shown to
//! the guard before it is classified.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{BDAddr, Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::OnceCell;

use crate::bluetooth::{
    BackendError, BackendKind, DeviceAddress, ObservedState, PairingGuard, WakeBackend,
};

/// Upper bound on how long a lookup scan may run within one call
const MAX_DISCOVERY_WINDOW: Duration = Duration::from_secs(8);

/// Map a btleplug error onto the shared taxonomy, consulting the guard first
fn map_error(error: btleplug::Error, guard: &PairingGuard) -> BackendError {
    let message = error.to_string();
    if guard.inspect(&message) {
        return guard.interruption();
    }

    match error {
        btleplug::Error::TimedOut(after) => BackendError::Timeout(after),
        btleplug::Error::PermissionDenied => {
            BackendError::EnvironmentMissing("permission denied by the Bluetooth stack".to_string())
        }
        btleplug::Error::NotSupported(what) => BackendError::EnvironmentMissing(what),
        btleplug::Error::DeviceNotFound | btleplug::Error::NotConnected => {
            BackendError::Transient(message)
        }
        _ => BackendError::Transient(message),
    }
}

/// Backend that talks to the device through the host's BLE stack
#[derive(Default)]
pub struct BleBackend {
    adapter: OnceCell<Adapter>,
}

impl BleBackend {
    /// Create a backend; the adapter is opened on first use
    pub fn new() -> Self {
        Self::default()
    }

    async fn adapter(&self) -> Result<&Adapter, BackendError> {
        self.adapter
            .get_or_try_init(|| async {
                let manager = Manager::new().await.map_err(|e| {
                    BackendError::EnvironmentMissing(format!("Bluetooth manager unavailable: {}", e))
                })?;
                let adapters = manager.adapters().await.map_err(|e| {
                    BackendError::EnvironmentMissing(format!("Failed to list adapters: {}", e))
                })?;
                let adapter = adapters.into_iter().next().ok_or_else(|| {
                    BackendError::EnvironmentMissing("no Bluetooth adapter found".to_string())
                })?;
                match adapter.adapter_info().await {
                    Ok(info) => log::info!("Using Bluetooth adapter {}", info),
                    Err(e) => log::debug!("Adapter info unavailable: {}", e),
                }
                Ok::<Adapter, BackendError>(adapter)
            })
            .await
    }

    /// Find the peripheral for `address`, scanning briefly if the stack
    /// does not know it yet. `None` means it did not show up in time.
    async fn find_peripheral(
        &self,
        address: &DeviceAddress,
        guard: &PairingGuard,
    ) -> Result<Option<Peripheral>, BackendError> {
        let adapter = self.adapter().await?;
        let target = BDAddr::from(*address);

        if let Some(found) = Self::known_peripheral(adapter, target, guard).await? {
            return Ok(Some(found));
        }

        let mut events = adapter.events().await.map_err(|e| map_error(e, guard))?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| map_error(e, guard))?;

        let window = guard.deadline().min(MAX_DISCOVERY_WINDOW);
        let lookup = async {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                if let Ok(peripheral) = adapter.peripheral(&id).await {
                    if peripheral.address() == target {
                        return Some(peripheral);
                    }
                }
            }
            None
        };
        let found = tokio::time::timeout(window, lookup).await.unwrap_or(None);

        if let Err(e) = adapter.stop_scan().await {
            log::debug!("Failed to stop lookup scan: {}", e);
        }
        Ok(found)
    }

    async fn known_peripheral(
        adapter: &Adapter,
        target: BDAddr,
        guard: &PairingGuard,
    ) -> Result<Option<Peripheral>, BackendError> {
        let peripherals = adapter.peripherals().await.map_err(|e| map_error(e, guard))?;
        Ok(peripherals.into_iter().find(|p| p.address() == target))
    }

    async fn require_peripheral(
        &self,
        address: &DeviceAddress,
        guard: &PairingGuard,
    ) -> Result<Peripheral, BackendError> {
        self.find_peripheral(address, guard).await?.ok_or_else(|| {
            BackendError::Transient(format!("device {} not found", address.masked()))
        })
    }
}

#[async_trait]
impl WakeBackend for BleBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Library
    }

    async fn query_state(
        &self,
        address: &DeviceAddress,
        guard: &PairingGuard,
    ) -> Result<ObservedState, BackendError> {
        let peripheral = self.require_peripheral(address, guard).await?;
        let connected = peripheral.is_connected().await.map_err(|e| map_error(e, guard))?;
        Ok(if connected {
            ObservedState::Connected
        } else {
            ObservedState::Disconnected
        })
    }

    async fn connect(&self, address: &DeviceAddress, guard: &PairingGuard) -> Result<(), BackendError> {
        let peripheral = self.require_peripheral(address, guard).await?;
        if peripheral.is_connected().await.map_err(|e| map_error(e, guard))? {
            log::debug!("Already connected to {}", address.masked());
            return Ok(());
        }

        log::debug!("Connecting to {}", address.masked());
        peripheral.connect().await.map_err(|e| map_error(e, guard))?;
        log::info!("Connected to {}", address.masked());
        Ok(())
    }

    async fn disconnect(&self, address: &DeviceAddress, guard: &PairingGuard) -> Result<(), BackendError> {
        let Some(peripheral) = self.find_peripheral(address, guard).await? else {
            // nothing to tear down
            return Ok(());
        };
        if peripheral.is_connected().await.map_err(|e| map_error(e, guard))? {
            peripheral.disconnect().await.map_err(|e| map_error(e, guard))?;
            log::info!("Disconnected from {}", address.masked());
        }
        Ok(())
    }

    async fn power_off(&self, _address: &DeviceAddress, _guard: &PairingGuard) -> Result<(), BackendError> {
        Err(BackendError::Unsupported(
            "power-off is not available through the BLE library backend".to_string(),
        ))
    }

    async fn release(&self) {
        if let Some(adapter) = self.adapter.get() {
            if let Err(e) = adapter.stop_scan().await {
                log::debug!("stop_scan on release failed: {}", e);
            }
        }
    }
}
