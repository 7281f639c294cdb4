//! Mirror an external entity's status when polling is disabled

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bluetooth::ObservedState;
use crate::monitor::StatePublisher;

/// Notifications buffered between the host and the mirror task
pub const MIRROR_CHANNEL_CAPACITY: usize = 32;

/// A status change reported for some external entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityStateChange {
    pub entity_id: String,
    /// `None` when the entity disappeared
    pub status: Option<String>,
}

impl EntityStateChange {
    pub fn new(entity_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            status: Some(status.into()),
        }
    }

    pub fn removed(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            status: None,
        }
    }
}

/// Map an external status onto the observed state. Total: anything not
/// recognised is `Unknown`.
pub fn map_external_status(status: &str) -> ObservedState {
    match status.trim().to_ascii_lowercase().as_str() {
        "on" | "playing" | "idle" | "active" | "paused" | "buffering" => ObservedState::Connected,
        "off" | "standby" => ObservedState::Disconnected,
        _ => ObservedState::Unknown,
    }
}

/// Forwards one entity's status into the [`StatePublisher`]
pub struct StateMirror;

impl StateMirror {
    /// Bounded notification channel for [`StateMirror::spawn`]
    pub fn channel() -> (mpsc::Sender<EntityStateChange>, mpsc::Receiver<EntityStateChange>) {
        mpsc::channel(MIRROR_CHANNEL_CAPACITY)
    }

    /// Publish `initial` (the entity's current status, if known) and then
    /// every change notification for `entity_id` until `cancel` fires or
    /// all senders are dropped. Notifications for other entities are ignored.
    pub fn spawn(
        entity_id: String,
        initial: Option<String>,
        mut rx: mpsc::Receiver<EntityStateChange>,
        publisher: StatePublisher,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        // without a seed the last published state stands
        if let Some(status) = initial.as_deref() {
            publisher.publish(map_external_status(status));
        }
        log::info!("Mirroring device state from {}", entity_id);

        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    change = rx.recv() => match change {
                        Some(change) => change,
                        None => break,
                    },
                };

                if change.entity_id != entity_id {
                    continue;
                }
                let state = change
                    .status
                    .as_deref()
                    .map_or(ObservedState::Unknown, map_external_status);
                log::debug!("{} reported {:?} -> {}", entity_id, change.status, state);
                publisher.publish(state);
            }
            log::info!("State mirror for {} stopped", entity_id);
        })
    }
}
