//! Text-session backend driving `bluetoothctl`
//!
//! Each logical operation spawns one `bluetoothctl <command> <addr>`
//! process through the [`CommandExecutor`]; its output is pattern-matched
//! for success, error and pairing-prompt markers. No pairing, trust or
//! agent command is ever issued from here.

use std::path::PathBuf;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::bluetooth::executor::{CommandExecutor, ExecError, RawOutput};
use crate::bluetooth::{
    BackendError, BackendKind, DeviceAddress, ObservedState, PairingGuard, WakeBackend,
};

/// Control interface looked up on `PATH`
pub const DEFAULT_PROGRAM: &str = "bluetoothctl";

/// Device unknown to the controller or out of range
const NOT_FOUND_MARKERS: &[&str] = &["not available", "not found", "no such device"];

/// Command-level failures reported by bluetoothctl / BlueZ
const ERROR_MARKERS: &[&str] = &["failed to connect", "failed to disconnect", "org.bluez.error", "timed out"];

const CONNECT_SUCCESS_MARKERS: &[&str] = &["connection successful", "connected: yes"];
const DISCONNECT_SUCCESS_MARKERS: &[&str] = &[
    "successful disconnected",
    "connected: no",
    "not connected",
    "org.bluez.error.notconnected",
];

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]|\x01|\x02").expect("ANSI pattern is a valid regex"))
}

/// Remove terminal colour codes and readline markers
pub fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").into_owned()
}

/// Fields parsed from `bluetoothctl info <addr>`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: Option<String>,
    pub name: Option<String>,
    pub connected: Option<bool>,
    pub paired: Option<bool>,
    pub trusted: Option<bool>,
}

impl DeviceInfo {
    /// Parse `info` output. Best effort: unknown lines are ignored.
    pub fn parse(address: &DeviceAddress, output: &str) -> Self {
        let wanted = address.to_string().to_ascii_lowercase();
        let mut info = Self::default();

        for line in strip_ansi(output).lines() {
            let line = line.trim();
            let lower = line.to_ascii_lowercase();

            if lower.starts_with("device ") && lower.contains(&wanted) {
                info.address = Some(address.to_string());
            } else if lower.starts_with("name:") {
                info.name = line.split_once(':').map(|(_, v)| v.trim().to_string());
            } else if lower.starts_with("connected:") {
                info.connected = parse_yes_no(line);
            } else if lower.starts_with("paired:") {
                info.paired = parse_yes_no(line);
            } else if lower.starts_with("trusted:") {
                info.trusted = parse_yes_no(line);
            }
        }
        info
    }

    /// Connection state as published to consumers
    pub fn observed_state(&self) -> ObservedState {
        match self.connected {
            Some(true) => ObservedState::Connected,
            Some(false) => ObservedState::Disconnected,
            None => ObservedState::Unknown,
        }
    }
}

fn parse_yes_no(line: &str) -> Option<bool> {
    let (_, value) = line.split_once(':')?;
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" => Some(true),
        "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Classify command output. Pairing markers are the guard's job and have
/// already been seen by the time this runs.
fn classify_errors(output: &str) -> Result<(), BackendError> {
    let lower = strip_ansi(output).to_ascii_lowercase();
    if contains_any(&lower, NOT_FOUND_MARKERS) {
        return Err(BackendError::Transient("device not available".to_string()));
    }
    if contains_any(&lower, ERROR_MARKERS) {
        let line = lower
            .lines()
            .find(|l| contains_any(l, ERROR_MARKERS))
            .unwrap_or_default()
            .trim()
            .to_string();
        return Err(BackendError::Transient(line));
    }
    Ok(())
}

/// Backend that shells out to `bluetoothctl`.
/// Each command is bounded by the deadline carried on the call's guard.
#[derive(Debug, Clone)]
pub struct CliSessionBackend {
    executor: CommandExecutor,
}

impl CliSessionBackend {
    /// Create a backend running `program`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            executor: CommandExecutor::new(program),
        }
    }

    async fn run(&self, args: &[&str], guard: &PairingGuard) -> Result<RawOutput, BackendError> {
        match self.executor.run(args, guard.deadline(), guard).await {
            Ok(output) => {
                // a prompt may be the very last thing printed before exit
                if guard.inspect(&output.combined()) {
                    return Err(guard.interruption());
                }
                Ok(output)
            }
            Err(ExecError::Interrupted) => Err(guard.interruption()),
            Err(ExecError::Timeout(after)) => Err(BackendError::Timeout(after)),
            Err(e) if e.is_environment_missing() => {
                log::error!("Control interface unavailable: {}", e);
                Err(BackendError::EnvironmentMissing(e.to_string()))
            }
            Err(e) => Err(BackendError::Transient(e.to_string())),
        }
    }

    /// Query and parse the device info block
    pub async fn info(&self, address: &DeviceAddress, guard: &PairingGuard) -> Result<DeviceInfo, BackendError> {
        let addr = address.to_string();
        let output = self.run(&["info", &addr], guard).await?;
        classify_errors(&output.combined())?;

        let info = DeviceInfo::parse(address, &output.stdout);
        if !output.success() && info.connected.is_none() {
            return Err(BackendError::Transient(format!(
                "info exited with {:?}",
                output.code
            )));
        }
        log::debug!(
            "Device {} info: connected={:?} paired={:?} trusted={:?}",
            address.masked(),
            info.connected,
            info.paired,
            info.trusted
        );
        Ok(info)
    }
}

#[async_trait]
impl WakeBackend for CliSessionBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::TextSession
    }

    async fn query_state(
        &self,
        address: &DeviceAddress,
        guard: &PairingGuard,
    ) -> Result<ObservedState, BackendError> {
        Ok(self.info(address, guard).await?.observed_state())
    }

    async fn connect(&self, address: &DeviceAddress, guard: &PairingGuard) -> Result<(), BackendError> {
        let addr = address.to_string();
        let output = self.run(&["connect", &addr], guard).await?;
        let combined = output.combined();
        classify_errors(&combined)?;

        let lower = strip_ansi(&combined).to_ascii_lowercase();
        if output.success() || contains_any(&lower, CONNECT_SUCCESS_MARKERS) {
            Ok(())
        } else {
            Err(BackendError::Transient(format!("connect exited with {:?}", output.code)))
        }
    }

    async fn disconnect(&self, address: &DeviceAddress, guard: &PairingGuard) -> Result<(), BackendError> {
        let addr = address.to_string();
        let output = self.run(&["disconnect", &addr], guard).await?;
        let combined = output.combined();
        let lower = strip_ansi(&combined).to_ascii_lowercase();

        // disconnecting an idle device is fine
        if contains_any(&lower, DISCONNECT_SUCCESS_MARKERS) {
            return Ok(());
        }
        classify_errors(&combined)?;
        if output.success() {
            Ok(())
        } else {
            Err(BackendError::Transient(format!("disconnect exited with {:?}", output.code)))
        }
    }

    async fn power_off(&self, address: &DeviceAddress, guard: &PairingGuard) -> Result<(), BackendError> {
        // powers the local controller down, not only the link to this device
        log::warn!(
            "Issuing controller power-off for {}; this affects every device on the adapter",
            address.masked()
        );
        let output = self.run(&["power", "off"], guard).await?;
        classify_errors(&output.combined())?;
        if output.success() {
            Ok(())
        } else {
            Err(BackendError::Transient(format!("power off exited with {:?}", output.code)))
        }
    }

    async fn release(&self) {
        // one process per command, nothing held between calls
    }
}
