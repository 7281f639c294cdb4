//! Polling coordinator and state mirror

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use btwake::bluetooth::ObservedState;
use btwake::controller::WakeController;
use btwake::monitor::{EntityStateChange, StateMirror, StatePoller, StatePublisher};

use common::{policy, test_address, ScriptedBackend, Step};

#[tokio::test(start_paused = true)]
async fn test_poller_publishes_queried_state() {
    let backend = ScriptedBackend::new()
        .on_query(Step::Reply(Ok(ObservedState::Connected)))
        .with_fallback_state(ObservedState::Disconnected);
    let publisher = StatePublisher::default();
    let shutdown = CancellationToken::new();
    let controller = WakeController::new(test_address(), backend.clone(), publisher.clone(), shutdown.clone());
    let mut states = publisher.subscribe();

    let handle = StatePoller::spawn(
        controller,
        Duration::from_secs(15),
        Duration::from_secs(12),
        shutdown.child_token(),
    );

    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ObservedState::Connected);
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ObservedState::Disconnected);

    shutdown.cancel();
    handle.await.unwrap();
    assert!(backend.count("query") >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_poller_keeps_last_state_on_failure() {
    let backend = ScriptedBackend::new()
        .on_query(Step::Reply(Ok(ObservedState::Connected)))
        .on_query(Step::Hang);
    let publisher = StatePublisher::default();
    let cancel = CancellationToken::new();
    let controller = WakeController::new(test_address(), backend.clone(), publisher.clone(), cancel.clone());

    let handle = StatePoller::spawn(controller, Duration::from_secs(5), Duration::from_secs(3), cancel.clone());

    // first tick answers, second times out at 8s, third is due at 10s
    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(publisher.current(), ObservedState::Connected);
    assert_eq!(backend.count("query"), 2);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poller_does_not_contend_with_sequence() {
    let backend = ScriptedBackend::new()
        .on_query(Step::Reply(Ok(ObservedState::Disconnected)))
        .on_connect(Step::After(Duration::from_secs(20), Ok(())));
    let publisher = StatePublisher::default();
    let cancel = CancellationToken::new();
    let controller = WakeController::new(test_address(), backend.clone(), publisher.clone(), cancel.clone());

    let wake = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.wake(policy(30, 0, 1)).await })
    };
    while !controller.is_busy() {
        tokio::task::yield_now().await;
    }

    let poller = StatePoller::spawn(controller.clone(), Duration::from_secs(5), Duration::from_secs(5), cancel.clone());
    assert!(wake.await.unwrap().is_success());

    cancel.cancel();
    poller.await.unwrap();
    assert_eq!(backend.max_concurrent(), 1);
    // only the sequence's own query preceded the connect
    assert_eq!(&backend.calls()[..2], &["query", "connect"]);
}

#[tokio::test]
async fn test_mirror_off_resolves_to_disconnected() {
    let publisher = StatePublisher::default();
    let mut states = publisher.subscribe();
    let (tx, rx) = StateMirror::channel();
    let cancel = CancellationToken::new();

    let handle = StateMirror::spawn(
        "media_player.living_room".to_string(),
        Some("idle".to_string()),
        rx,
        publisher.clone(),
        cancel.clone(),
    );
    assert_eq!(*states.borrow_and_update(), ObservedState::Connected);

    tx.send(EntityStateChange::new("media_player.living_room", "off"))
        .await
        .unwrap();
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ObservedState::Disconnected);

    tx.send(EntityStateChange::new("media_player.living_room", "something_new"))
        .await
        .unwrap();
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ObservedState::Unknown);

    drop(tx);
    handle.await.unwrap();
    assert!(!cancel.is_cancelled());
}
