//! Wake/sleep orchestration: state machine, retry policy and outcomes

mod machine;
mod outcome;
mod retry;

pub use machine::WakeController;
pub use outcome::{ActionKind, ControllerOutcome, FailureReason, OperationAttempt, Phase};
pub use retry::{Attempted, RetryPolicy};
