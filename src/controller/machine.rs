//! Wake/sleep state machine
//!
//! One [`WakeController`] exists per configured device. It runs at most one
//! wake or sleep sequence at a time, routes every backend call through a
//! [`PairingGuard`] and hands retryable failures to the [`RetryPolicy`].
//! Backend access is serialised through a single async lock so the poller
//! never interleaves a query with a running sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bluetooth::{BackendError, BackendKind, DeviceAddress, ObservedState, PairingGuard, WakeBackend};
use crate::config::{PolicyConfig, SleepAction};
use crate::controller::{ActionKind, ControllerOutcome, OperationAttempt, Phase, RetryPolicy};
use crate::monitor::StatePublisher;

/// Releases the in-flight flag when a sequence ends, however it ends
struct SequenceSlot<'a> {
    flag: &'a AtomicBool,
}

impl<'a> SequenceSlot<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for SequenceSlot<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

struct Inner {
    address: DeviceAddress,
    backend: Arc<dyn WakeBackend>,
    state: StatePublisher,
    shutdown: CancellationToken,
    sequence_active: AtomicBool,
    bus: tokio::sync::Mutex<()>,
    phase: Mutex<Phase>,
    last_attempt: Mutex<Option<OperationAttempt>>,
}

/// Drives wake and sleep sequences for one device
#[derive(Clone)]
pub struct WakeController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WakeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeController")
            .field("address", &self.inner.address.masked())
            .field("backend", &self.inner.backend.kind())
            .field("phase", &self.phase())
            .finish()
    }
}

impl WakeController {
    /// Create a controller. Cancelling `shutdown` interrupts any in-flight
    /// backend call.
    pub fn new(
        address: DeviceAddress,
        backend: Arc<dyn WakeBackend>,
        state: StatePublisher,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                address,
                backend,
                state,
                shutdown,
                sequence_active: AtomicBool::new(false),
                bus: tokio::sync::Mutex::new(()),
                phase: Mutex::new(Phase::Idle),
                last_attempt: Mutex::new(None),
            }),
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.inner.address
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    /// Publisher holding the last observed state
    pub fn state(&self) -> &StatePublisher {
        &self.inner.state
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Whether a wake or sleep sequence is running
    pub fn is_busy(&self) -> bool {
        self.inner.sequence_active.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase.lock().map(|phase| *phase).unwrap_or_default()
    }

    /// Record of the most recent completed invocation
    pub fn last_attempt(&self) -> Option<OperationAttempt> {
        self.inner.last_attempt.lock().ok().and_then(|slot| slot.clone())
    }

    /// Wake the device: query, connect, hold, disconnect, verify
    pub async fn wake(&self, policy: PolicyConfig) -> ControllerOutcome {
        self.execute(ActionKind::Wake, policy).await
    }

    /// Put the device to sleep with the configured sleep action, then verify
    pub async fn sleep(&self, policy: PolicyConfig) -> ControllerOutcome {
        self.execute(ActionKind::Sleep, policy).await
    }

    /// Query the device once and publish the answer.
    ///
    /// Returns `Ok(None)` without touching the backend while a sequence is
    /// in flight or another query holds the bus.
    pub async fn refresh_state(
        &self,
        command_timeout: Duration,
    ) -> Result<Option<ObservedState>, BackendError> {
        if self.is_busy() {
            return Ok(None);
        }
        let Ok(_bus) = self.inner.bus.try_lock() else {
            return Ok(None);
        };

        let guard = PairingGuard::child_of(&self.inner.shutdown).with_deadline(command_timeout);
        let state = guard
            .run(
                command_timeout,
                self.inner.backend.query_state(&self.inner.address, &guard),
            )
            .await?;
        self.inner.state.publish(state);
        Ok(Some(state))
    }

    async fn execute(&self, action: ActionKind, policy: PolicyConfig) -> ControllerOutcome {
        let device = self.inner.address.masked();
        let Some(_slot) = SequenceSlot::acquire(&self.inner.sequence_active) else {
            let outcome = ControllerOutcome::AlreadyInProgress;
            outcome.log(action, &device);
            return outcome;
        };

        let started_at = Utc::now();
        let started = Instant::now();
        let guard = PairingGuard::child_of(&self.inner.shutdown).with_deadline(policy.command_timeout);
        let retry = RetryPolicy::from_policy(&policy);
        log::info!(
            "Starting {} for {} via {} (up to {} attempts)",
            action,
            device,
            self.inner.backend.kind(),
            retry.max_attempts()
        );

        let _bus = tokio::select! {
            biased;
            () = guard.cancelled() => {
                return self.finish(action, &device, 0, started_at, started, &policy, Err(guard.interruption()));
            }
            bus = self.inner.bus.lock() => bus,
        };

        let this = self;
        let guard_ref = &guard;
        let policy_ref = &policy;
        let attempted = retry
            .run(guard_ref, move |attempt| {
                log::debug!("{} attempt {}", action, attempt);
                this.run_sequence(action, guard_ref, policy_ref)
            })
            .await;

        self.finish(
            action,
            &device,
            attempted.attempts,
            started_at,
            started,
            &policy,
            attempted.result,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        action: ActionKind,
        device: &str,
        attempts: u32,
        started_at: chrono::DateTime<Utc>,
        started: Instant,
        policy: &PolicyConfig,
        result: Result<ObservedState, BackendError>,
    ) -> ControllerOutcome {
        let outcome = match result {
            Ok(state) => {
                self.inner.state.publish(state);
                ControllerOutcome::Success(state)
            }
            Err(error) => ControllerOutcome::from_error(error),
        };
        self.set_phase(outcome.terminal_phase());
        outcome.log(action, device);

        let attempt = OperationAttempt {
            action,
            attempts,
            started_at,
            duration: started.elapsed(),
            outcome: outcome.clone(),
            policy: policy.clone(),
        };
        if let Ok(mut slot) = self.inner.last_attempt.lock() {
            *slot = Some(attempt);
        }
        outcome
    }

    async fn run_sequence(
        &self,
        action: ActionKind,
        guard: &PairingGuard,
        policy: &PolicyConfig,
    ) -> Result<ObservedState, BackendError> {
        match action {
            ActionKind::Wake => self.wake_sequence(guard, policy).await,
            ActionKind::Sleep => self.sleep_sequence(guard, policy).await,
        }
    }

    async fn wake_sequence(
        &self,
        guard: &PairingGuard,
        policy: &PolicyConfig,
    ) -> Result<ObservedState, BackendError> {
        let backend = &self.inner.backend;
        let address = &self.inner.address;
        let deadline = guard.deadline();

        self.set_phase(Phase::Querying);
        let current = guard.run(deadline, backend.query_state(address, guard)).await?;

        if current == ObservedState::Connected {
            log::debug!("Device already connected, skipping connect");
        } else {
            self.set_phase(Phase::Connecting);
            guard.run(deadline, backend.connect(address, guard)).await?;

            self.set_phase(Phase::Waiting);
            hold(guard, policy.post_connect_wait).await?;

            self.set_phase(Phase::Disconnecting);
            match guard.run(deadline, backend.disconnect(address, guard)).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    log::debug!("Ignoring post-wake disconnect failure: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        // Any answer counts: reachability is the only observable proxy for
        // the device being awake.
        self.set_phase(Phase::Verifying);
        let verified = guard.run(deadline, backend.query_state(address, guard)).await?;
        log::debug!("Wake verification answered: {}", verified);
        Ok(ObservedState::Connected)
    }

    async fn sleep_sequence(
        &self,
        guard: &PairingGuard,
        policy: &PolicyConfig,
    ) -> Result<ObservedState, BackendError> {
        let backend = &self.inner.backend;
        let address = &self.inner.address;
        let deadline = guard.deadline();

        self.set_phase(Phase::Querying);
        let current = guard.run(deadline, backend.query_state(address, guard)).await?;
        log::debug!("Device state before sleep: {}", current);

        self.set_phase(Phase::Disconnecting);
        match policy.sleep_action {
            SleepAction::Disconnect => {
                guard.run(deadline, backend.disconnect(address, guard)).await?;
            }
            SleepAction::PowerOff => {
                log::warn!("Using power-off sleep action; some devices answer it with a pairing prompt");
                guard.run(deadline, backend.power_off(address, guard)).await?;
            }
        }

        self.set_phase(Phase::Verifying);
        match guard.run(deadline, backend.query_state(address, guard)).await? {
            ObservedState::Connected => Err(BackendError::Transient(
                "device still connected after sleep".to_string(),
            )),
            _ => Ok(ObservedState::Disconnected),
        }
    }

    fn set_phase(&self, phase: Phase) {
        if let Ok(mut current) = self.inner.phase.lock() {
            if *current != phase {
                log::trace!("Phase {:?} -> {:?}", *current, phase);
                *current = phase;
            }
        }
    }
}

/// Timed suspension that still honours the guard
async fn hold(guard: &PairingGuard, duration: Duration) -> Result<(), BackendError> {
    tokio::select! {
        biased;
        () = guard.cancelled() => Err(guard.interruption()),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}
