//! Device instance lifecycle
//!
//! A [`DeviceInstance`] is what a host creates for one configured device:
//! the backend selected at configuration time, the controller, and the
//! background task that keeps the observed state fresh (the poller, or the
//! state mirror when polling is off). Shutting it down cancels everything
//! in flight and releases the backend.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bluetooth::{build_backend, BackendError, ObservedState, WakeBackend};
use crate::config::{ConfigError, DeviceConfig, PolicyConfig};
use crate::controller::{ControllerOutcome, WakeController};
use crate::diagnostics::{DiagnosticsReport, StateSource};
use crate::error::WakeError;
use crate::monitor::{EntityStateChange, StateMirror, StatePoller};

/// Device instance lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    ShuttingDown,
    Stopped,
}

/// One configured device and its background tasks
pub struct DeviceInstance {
    config: DeviceConfig,
    backend: Arc<dyn WakeBackend>,
    controller: WakeController,
    shutdown: CancellationToken,
    /// Child of `shutdown`; replaced whenever the state source restarts
    source_cancel: CancellationToken,
    state_source: StateSource,
    mirror_tx: Option<mpsc::Sender<EntityStateChange>>,
    tasks: Vec<JoinHandle<()>>,
    lifecycle: LifecycleState,
}

impl DeviceInstance {
    /// Build the configured backend and start the instance.
    ///
    /// `mirror_status` is the mirrored entity's current status, if the host
    /// knows it; it seeds the published state in mirror mode.
    /// Must be called from within a tokio runtime.
    pub fn start(config: DeviceConfig, mirror_status: Option<String>) -> Result<Self, WakeError> {
        let backend = build_backend(config.backend, &config.backend_options())?;
        Self::start_with_backend(config, backend, mirror_status)
    }

    /// Start with an already constructed backend
    pub fn start_with_backend(
        config: DeviceConfig,
        backend: Arc<dyn WakeBackend>,
        mirror_status: Option<String>,
    ) -> Result<Self, WakeError> {
        let address = config.require_address()?;
        config.policy.validate()?;

        let shutdown = CancellationToken::new();
        let controller = WakeController::new(
            address,
            Arc::clone(&backend),
            crate::monitor::StatePublisher::default(),
            shutdown.clone(),
        );

        let mut instance = Self {
            source_cancel: shutdown.child_token(),
            config,
            backend,
            controller,
            shutdown,
            state_source: StateSource::None,
            mirror_tx: None,
            tasks: Vec::new(),
            lifecycle: LifecycleState::Running,
        };
        instance.spawn_state_source(mirror_status);

        log::info!(
            "Device '{}' ({}) started with {} backend, state source: {}",
            instance.config.name,
            address.masked(),
            instance.backend.kind(),
            instance.state_source
        );
        Ok(instance)
    }

    /// Start the poller or the mirror according to the current config
    fn spawn_state_source(&mut self, mirror_status: Option<String>) {
        let policy = &self.config.policy;
        let cancel = self.source_cancel.clone();

        self.mirror_tx = None;
        self.state_source = if policy.polling_enabled {
            self.tasks.push(StatePoller::spawn(
                self.controller.clone(),
                policy.polling_interval,
                policy.command_timeout,
                cancel,
            ));
            StateSource::Polling
        } else if let Some(entity) = &self.config.mirror_entity {
            let (tx, rx) = StateMirror::channel();
            self.tasks.push(StateMirror::spawn(
                entity.clone(),
                mirror_status,
                rx,
                self.controller.state().clone(),
                cancel,
            ));
            self.mirror_tx = Some(tx);
            StateSource::Mirror
        } else {
            StateSource::None
        };
    }

    /// Stop the current state source and start the one the config now asks for
    fn restart_state_source(&mut self) {
        self.source_cancel.cancel();
        self.source_cancel = self.shutdown.child_token();
        // finished tasks are reaped on shutdown
        self.spawn_state_source(None);
        log::info!(
            "Device '{}' state source restarted: {}",
            self.config.name,
            self.state_source
        );
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn controller(&self) -> &WakeController {
        &self.controller
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn state_source(&self) -> StateSource {
        self.state_source
    }

    /// Replace the policy. The next wake, sleep or refresh uses it; a
    /// sequence already running keeps its own snapshot. The poller is
    /// restarted when its switch, interval or command timeout changes.
    pub fn update_policy(&mut self, policy: PolicyConfig) -> Result<(), ConfigError> {
        policy.validate()?;
        let previous = std::mem::replace(&mut self.config.policy, policy);
        let current = &self.config.policy;

        let source_changed = previous.polling_enabled != current.polling_enabled
            || (current.polling_enabled
                && (previous.polling_interval != current.polling_interval
                    || previous.command_timeout != current.command_timeout));
        if source_changed && self.lifecycle == LifecycleState::Running {
            self.restart_state_source();
        }
        Ok(())
    }

    /// Run a wake sequence with the current policy snapshot
    pub async fn wake(&self) -> ControllerOutcome {
        self.controller.wake(self.config.policy.clone()).await
    }

    /// Run a sleep sequence with the current policy snapshot
    pub async fn sleep(&self) -> ControllerOutcome {
        self.controller.sleep(self.config.policy.clone()).await
    }

    /// Last published state
    pub fn observed_state(&self) -> ObservedState {
        self.controller.state().current()
    }

    pub fn subscribe(&self) -> watch::Receiver<ObservedState> {
        self.controller.state().subscribe()
    }

    /// Query the device now. Falls back to the last published state while a
    /// sequence is running.
    pub async fn refresh(&self) -> Result<ObservedState, BackendError> {
        let refreshed = self
            .controller
            .refresh_state(self.config.policy.command_timeout)
            .await?;
        Ok(refreshed.unwrap_or_else(|| self.observed_state()))
    }

    /// Sender for the mirrored entity's status notifications, if mirroring
    pub fn mirror_sender(&self) -> Option<mpsc::Sender<EntityStateChange>> {
        self.mirror_tx.clone()
    }

    pub fn diagnostics(&self) -> DiagnosticsReport {
        DiagnosticsReport::collect(&self.config.name, &self.controller, self.state_source, &self.config.policy)
    }

    /// Cancel in-flight work, stop background tasks and release the backend
    pub async fn shutdown(&mut self) {
        if self.lifecycle == LifecycleState::Stopped {
            return;
        }
        self.lifecycle = LifecycleState::ShuttingDown;
        log::info!("Shutting down device '{}'", self.config.name);

        self.shutdown.cancel();
        self.mirror_tx = None;
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                log::warn!("Background task ended abnormally: {}", e);
            }
        }
        self.backend.release().await;

        self.lifecycle = LifecycleState::Stopped;
        log::info!("Device '{}' stopped", self.config.name);
    }
}

impl Drop for DeviceInstance {
    fn drop(&mut self) {
        // tasks cannot be awaited here, but they observe the token
        self.shutdown.cancel();
    }
}
