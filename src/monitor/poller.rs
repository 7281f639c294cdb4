//! Periodic state refresh

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::controller::WakeController;

/// Background loop that queries the device on a fixed interval
pub struct StatePoller;

impl StatePoller {
    /// Spawn the polling task.
    ///
    /// Ticks that land while a wake/sleep sequence holds the device are
    /// skipped. The loop ends when `cancel` fires.
    pub fn spawn(
        controller: WakeController,
        interval: Duration,
        command_timeout: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(poll_task(controller, interval, command_timeout, cancel))
    }
}

async fn poll_task(
    controller: WakeController,
    interval: Duration,
    command_timeout: Duration,
    cancel: CancellationToken,
) {
    log::info!("State polling started (every {:.0}s)", interval.as_secs_f64());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match controller.refresh_state(command_timeout).await {
                    Ok(Some(state)) => log::debug!("Polled device state: {}", state),
                    Ok(None) => log::debug!("Sequence in flight, skipping poll"),
                    // keep the last published state
                    Err(e) => log::warn!("State poll failed: {}", e),
                }
            }
        }
    }
    log::info!("State polling stopped");
}
