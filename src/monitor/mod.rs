//! Observed-state publication: polling coordinator and state mirror

mod mirror;
mod poller;
mod state;

pub use mirror::{map_external_status, EntityStateChange, StateMirror, MIRROR_CHANNEL_CAPACITY};
pub use poller::StatePoller;
pub use state::StatePublisher;
