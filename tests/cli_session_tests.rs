//! Text-session backend against a fake `bluetoothctl` script
#![cfg(unix)]

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

use btwake::bluetooth::{BackendError, BackendKind, CliSessionBackend, ObservedState, PairingGuard, WakeBackend};
use btwake::config::DeviceConfig;
use btwake::controller::{ControllerOutcome, WakeController};
use btwake::lifecycle_manager::DeviceInstance;
use btwake::monitor::StatePublisher;

use common::{test_address, TEST_MAC};

/// How the fake control interface misbehaves
#[derive(Default, Clone, Copy)]
struct Quirks {
    /// `connect` prints a PIN prompt and hangs
    prompt_on_connect: bool,
    /// `info` takes this many seconds to answer
    info_delay_secs: u32,
    /// `disconnect` of an idle device fails the way BlueZ reports it
    strict_disconnect: bool,
}

/// A fake control interface that keeps its connection flag in a file and
/// appends every invocation to `calls.log`
struct FakeBluetoothctl {
    dir: TempDir,
    program: PathBuf,
}

impl FakeBluetoothctl {
    fn new(connected: bool, prompt_on_connect: bool) -> Self {
        Self::with_quirks(
            connected,
            Quirks {
                prompt_on_connect,
                ..Quirks::default()
            },
        )
    }

    fn with_quirks(connected: bool, quirks: Quirks) -> Self {
        let dir = tempdir().expect("temp dir");
        let root = dir.path().display().to_string();
        let connect_branch = if quirks.prompt_on_connect {
            "printf 'Attempting to connect to %s\\n[agent] Enter PIN code: ' \"$2\"; sleep 30".to_string()
        } else {
            format!("echo yes > {root}/connected; printf 'Attempting to connect to %s\\nConnection successful\\n' \"$2\"")
        };
        let disconnect_branch = if quirks.strict_disconnect {
            format!(
                "if [ \"$(cat {root}/connected)\" = no ]; then printf 'Attempting to disconnect from %s\\nFailed to disconnect: org.bluez.Error.NotConnected\\n' \"$2\"; exit 1; fi; echo no > {root}/connected; printf 'Successful disconnected\\n'"
            )
        } else {
            format!("echo no > {root}/connected; printf 'Attempting to disconnect from %s\\nSuccessful disconnected\\n' \"$2\"")
        };
        let info_delay = quirks.info_delay_secs;
        let script = format!(
            r#"#!/bin/sh
echo "$@" >> {root}/calls.log
case "$1" in
  info)
    sleep {info_delay}
    printf 'Device %s (public)\n\tName: Living Room Box\n\tPaired: no\n\tConnected: %s\n' "$2" "$(cat {root}/connected)"
    ;;
  connect)
    {connect_branch}
    ;;
  disconnect)
    {disconnect_branch}
    ;;
  *)
    echo "Invalid command" >&2
    exit 1
    ;;
esac
"#
        );

        let program = dir.path().join("bluetoothctl");
        fs::write(&program, script).expect("write script");
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).expect("chmod");
        fs::write(
            dir.path().join("connected"),
            if connected { "yes\n" } else { "no\n" },
        )
        .expect("write state");

        Self { dir, program }
    }

    fn backend(&self) -> Arc<CliSessionBackend> {
        Arc::new(CliSessionBackend::new(&self.program))
    }

    fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            address: Some(test_address()),
            backend: BackendKind::TextSession,
            control_program: self.program.clone(),
            ..DeviceConfig::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        read_lines(&self.dir.path().join("calls.log"))
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn fast_policy() -> btwake::config::PolicyConfig {
    let mut policy = common::policy(10, 0, 1);
    policy.post_connect_wait = Duration::from_millis(500);
    policy
}

#[tokio::test]
async fn test_query_state_parses_info() {
    let fake = FakeBluetoothctl::new(true, false);
    let backend = fake.backend();

    let state = backend
        .query_state(&test_address(), &PairingGuard::new())
        .await
        .unwrap();

    assert_eq!(state, ObservedState::Connected);
    assert_eq!(fake.calls(), vec![format!("info {}", TEST_MAC)]);
}

#[tokio::test]
async fn test_wake_sequence_through_control_interface() {
    let fake = FakeBluetoothctl::new(false, false);
    let controller = WakeController::new(
        test_address(),
        fake.backend(),
        StatePublisher::default(),
        CancellationToken::new(),
    );

    let outcome = controller.wake(fast_policy()).await;

    assert_eq!(outcome, ControllerOutcome::Success(ObservedState::Connected));
    assert_eq!(
        fake.calls(),
        vec![
            format!("info {}", TEST_MAC),
            format!("connect {}", TEST_MAC),
            format!("disconnect {}", TEST_MAC),
            format!("info {}", TEST_MAC),
        ]
    );
}

#[tokio::test]
async fn test_unterminated_pin_prompt_aborts_connect() {
    let fake = FakeBluetoothctl::new(false, true);
    let controller = WakeController::new(
        test_address(),
        fake.backend(),
        StatePublisher::default(),
        CancellationToken::new(),
    );

    let started = Instant::now();
    let outcome = controller.wake(fast_policy()).await;

    assert!(matches!(outcome, ControllerOutcome::Aborted(_)), "{:?}", outcome);
    // killed on the prompt, long before the script's sleep or the deadline
    assert!(started.elapsed() < Duration::from_secs(5));
    let calls = fake.calls();
    assert!(calls.iter().all(|c| !c.starts_with("disconnect")), "{:?}", calls);
    assert!(calls.iter().all(|c| !c.contains("pair") && !c.contains("agent")));
}

#[tokio::test]
async fn test_missing_program_is_environment_missing() {
    let dir = tempdir().unwrap();
    let controller = WakeController::new(
        test_address(),
        Arc::new(CliSessionBackend::new(dir.path().join("no-such-bluetoothctl"))),
        StatePublisher::default(),
        CancellationToken::new(),
    );

    let outcome = controller.wake(fast_policy()).await;

    assert!(matches!(outcome, ControllerOutcome::EnvironmentMissing(_)), "{:?}", outcome);
}

#[tokio::test]
async fn test_sleep_on_idle_device_succeeds() {
    let fake = FakeBluetoothctl::with_quirks(
        false,
        Quirks {
            strict_disconnect: true,
            ..Quirks::default()
        },
    );
    let controller = WakeController::new(
        test_address(),
        fake.backend(),
        StatePublisher::default(),
        CancellationToken::new(),
    );

    let outcome = controller.sleep(fast_policy()).await;

    assert_eq!(outcome, ControllerOutcome::Success(ObservedState::Disconnected));
    // no retry
    assert_eq!(
        fake.calls(),
        vec![
            format!("info {}", TEST_MAC),
            format!("disconnect {}", TEST_MAC),
            format!("info {}", TEST_MAC),
        ]
    );
}

#[tokio::test]
async fn test_command_deadline_follows_policy_update() {
    let fake = FakeBluetoothctl::with_quirks(
        true,
        Quirks {
            info_delay_secs: 6,
            ..Quirks::default()
        },
    );
    let mut config = fake.device_config();
    config.policy.command_timeout = Duration::from_secs(5);
    let mut instance = DeviceInstance::start(config, None).unwrap();

    assert_eq!(instance.refresh().await, Err(BackendError::Timeout(Duration::from_secs(5))));

    let mut policy = instance.config().policy.clone();
    policy.command_timeout = Duration::from_secs(20);
    instance.update_policy(policy).unwrap();

    let started = Instant::now();
    assert_eq!(instance.refresh().await, Ok(ObservedState::Connected));
    assert!(started.elapsed() >= Duration::from_secs(6));

    instance.shutdown().await;
}
