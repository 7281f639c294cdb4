//! Last observed device state, shared between one writer and any readers

use std::sync::Arc;

use tokio::sync::watch;

use crate::bluetooth::ObservedState;

/// Publishes the device's observed state.
///
/// Replacement is atomic: a reader always sees a complete value. Clones
/// share the same underlying channel.
#[derive(Debug, Clone)]
pub struct StatePublisher {
    tx: Arc<watch::Sender<ObservedState>>,
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new(ObservedState::Unknown)
    }
}

impl StatePublisher {
    /// Create a publisher holding `initial`
    pub fn new(initial: ObservedState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the published value. Returns the previous one.
    pub fn publish(&self, state: ObservedState) -> ObservedState {
        let previous = self.tx.send_replace(state);
        if previous != state {
            log::info!("Observed device state changed: {} -> {}", previous, state);
        }
        previous
    }

    /// Current value
    pub fn current(&self) -> ObservedState {
        *self.tx.borrow()
    }

    /// Receiver notified on every change
    pub fn subscribe(&self) -> watch::Receiver<ObservedState> {
        self.tx.subscribe()
    }
}
