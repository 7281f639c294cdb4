//! Test doubles for the backend capability trait
//!
//! `MockBackend` is a mockall mock for expectation-style tests.
//! `ScriptedBackend` plays back per-operation scripts and can hang, delay or
//! emit a pairing prompt mid-call, which the timing and cancellation tests
//! need.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;

use btwake::bluetooth::{BackendError, BackendKind, DeviceAddress, ObservedState, PairingGuard, WakeBackend};
use btwake::config::PolicyConfig;

/// Route `log` output through the test harness; safe to call repeatedly
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub const TEST_MAC: &str = "E0:B6:55:0A:1B:2C";

pub fn test_address() -> DeviceAddress {
    DeviceAddress::parse(TEST_MAC).expect("valid test address")
}

/// Policy with the given timing, everything else default
pub fn policy(timeout_secs: u64, retries: u32, delay_secs: u64) -> PolicyConfig {
    init_test_logging();
    PolicyConfig {
        command_timeout: Duration::from_secs(timeout_secs),
        retry_count: retries,
        retry_delay: Duration::from_secs(delay_secs),
        ..PolicyConfig::default()
    }
}

mock! {
    pub Backend {}

    #[async_trait]
    impl WakeBackend for Backend {
        fn kind(&self) -> BackendKind;
        async fn query_state(&self, address: &DeviceAddress, guard: &PairingGuard) -> Result<ObservedState, BackendError>;
        async fn connect(&self, address: &DeviceAddress, guard: &PairingGuard) -> Result<(), BackendError>;
        async fn disconnect(&self, address: &DeviceAddress, guard: &PairingGuard) -> Result<(), BackendError>;
        async fn power_off(&self, address: &DeviceAddress, guard: &PairingGuard) -> Result<(), BackendError>;
        async fn release(&self);
    }
}

/// One scripted reply
#[derive(Debug, Clone)]
pub enum Step<T> {
    Reply(Result<T, BackendError>),
    /// Reply after a delay
    After(Duration, Result<T, BackendError>),
    /// Never answer
    Hang,
    /// Emit text through the guard, then never answer
    Prompt(&'static str),
}

#[derive(Default)]
struct Script {
    query: VecDeque<Step<ObservedState>>,
    connect: VecDeque<Step<()>>,
    disconnect: VecDeque<Step<()>>,
    power_off: VecDeque<Step<()>>,
}

/// Backend that follows per-operation scripts. Once a script runs out,
/// queries report `fallback_state` and everything else succeeds.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
    fallback_state: Mutex<ObservedState>,
    calls: Mutex<Vec<&'static str>>,
    deadlines: Mutex<Vec<Duration>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_fallback_state(self: Arc<Self>, state: ObservedState) -> Arc<Self> {
        *self.fallback_state.lock().unwrap() = state;
        self
    }

    pub fn on_query(self: Arc<Self>, step: Step<ObservedState>) -> Arc<Self> {
        self.script.lock().unwrap().query.push_back(step);
        self
    }

    pub fn on_connect(self: Arc<Self>, step: Step<()>) -> Arc<Self> {
        self.script.lock().unwrap().connect.push_back(step);
        self
    }

    pub fn on_disconnect(self: Arc<Self>, step: Step<()>) -> Arc<Self> {
        self.script.lock().unwrap().disconnect.push_back(step);
        self
    }

    pub fn on_power_off(self: Arc<Self>, step: Step<()>) -> Arc<Self> {
        self.script.lock().unwrap().power_off.push_back(step);
        self
    }

    /// Operations in the order they were issued
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    /// Per-command deadline carried by each call's guard, in call order
    pub fn deadlines(&self) -> Vec<Duration> {
        self.deadlines.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| **c == op).count()
    }

    /// Highest number of backend calls ever running at once
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn enter(&self, op: &'static str, guard: &PairingGuard) {
        self.calls.lock().unwrap().push(op);
        self.deadlines.lock().unwrap().push(guard.deadline());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    async fn play<T>(&self, step: Step<T>, guard: &PairingGuard) -> Result<T, BackendError> {
        let _active = ActiveCall(&self.active);
        match step {
            Step::Reply(result) => result,
            Step::After(delay, result) => {
                tokio::time::sleep(delay).await;
                result
            }
            Step::Hang => std::future::pending().await,
            Step::Prompt(text) => {
                guard.inspect(text);
                std::future::pending().await
            }
        }
    }
}

/// Decrements the in-flight counter even when the call is dropped
struct ActiveCall<'a>(&'a AtomicUsize);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl WakeBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::TextSession
    }

    async fn query_state(&self, _address: &DeviceAddress, guard: &PairingGuard) -> Result<ObservedState, BackendError> {
        self.enter("query", guard);
        let step = self.script.lock().unwrap().query.pop_front();
        let fallback = *self.fallback_state.lock().unwrap();
        self.play(step.unwrap_or(Step::Reply(Ok(fallback))), guard).await
    }

    async fn connect(&self, _address: &DeviceAddress, guard: &PairingGuard) -> Result<(), BackendError> {
        self.enter("connect", guard);
        let step = self.script.lock().unwrap().connect.pop_front();
        self.play(step.unwrap_or(Step::Reply(Ok(()))), guard).await
    }

    async fn disconnect(&self, _address: &DeviceAddress, guard: &PairingGuard) -> Result<(), BackendError> {
        self.enter("disconnect", guard);
        let step = self.script.lock().unwrap().disconnect.pop_front();
        self.play(step.unwrap_or(Step::Reply(Ok(()))), guard).await
    }

    async fn power_off(&self, _address: &DeviceAddress, guard: &PairingGuard) -> Result<(), BackendError> {
        self.enter("power_off", guard);
        let step = self.script.lock().unwrap().power_off.pop_front();
        self.play(step.unwrap_or(Step::Reply(Ok(()))), guard).await
    }

    async fn release(&self) {
        self.calls.lock().unwrap().push("release");
    }
}
