//! Terminal outcomes and per-invocation attempt records

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bluetooth::{BackendError, ObservedState};
use crate::config::PolicyConfig;

/// Which logical action was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Wake,
    Sleep,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wake => write!(f, "wake"),
            Self::Sleep => write!(f, "sleep"),
        }
    }
}

/// Where a wake/sleep sequence currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Querying,
    Connecting,
    Waiting,
    Disconnecting,
    Verifying,
    Succeeded,
    Aborted,
    Failed,
}

/// Why an action failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Every attempt ran out of time
    Timeout,
    /// Backend reported an error that retries did not clear
    Backend(String),
    /// Interrupted by shutdown
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out"),
            Self::Backend(msg) => write!(f, "backend error: {}", msg),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Terminal result of a wake or sleep request. Every variant is distinct
/// to the caller; none of them is collapsed into a generic failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ControllerOutcome {
    /// Sequence completed and the device answered verification
    Success(ObservedState),
    /// A pairing request was observed and the attempt was cancelled
    Aborted(String),
    Failed(FailureReason),
    /// Control interface or library not available
    EnvironmentMissing(String),
    /// Another sequence is already running for this device
    AlreadyInProgress,
}

impl ControllerOutcome {
    /// Map a terminal backend error to an outcome
    pub fn from_error(error: BackendError) -> Self {
        match error {
            BackendError::PairingRequested(evidence) => Self::Aborted(evidence),
            BackendError::EnvironmentMissing(msg) => Self::EnvironmentMissing(msg),
            BackendError::Timeout(_) => Self::Failed(FailureReason::Timeout),
            BackendError::Transient(msg) | BackendError::Unsupported(msg) => {
                Self::Failed(FailureReason::Backend(msg))
            }
            BackendError::Cancelled => Self::Failed(FailureReason::Cancelled),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Phase the state machine ends in for this outcome
    pub fn terminal_phase(&self) -> Phase {
        match self {
            Self::Success(_) => Phase::Succeeded,
            Self::Aborted(_) => Phase::Aborted,
            _ => Phase::Failed,
        }
    }

    /// Distinct process exit status per outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success(_) => 0,
            Self::Aborted(_) => 2,
            Self::Failed(_) => 3,
            Self::EnvironmentMissing(_) => 4,
            Self::AlreadyInProgress => 5,
        }
    }

    /// Log the outcome at a level matching its severity
    pub fn log(&self, action: ActionKind, device: &str) {
        match self {
            Self::Success(state) => log::info!("{} {} succeeded (device {})", action, device, state),
            Self::Aborted(evidence) => {
                log::warn!("{} {} aborted: pairing requested ({})", action, device, evidence)
            }
            Self::Failed(reason) => log::warn!("{} {} failed: {}", action, device, reason),
            Self::EnvironmentMissing(msg) => {
                log::error!("{} {} impossible, Bluetooth environment missing: {}", action, device, msg)
            }
            Self::AlreadyInProgress => {
                log::warn!("{} {} rejected: another operation is already in progress", action, device)
            }
        }
    }
}

impl fmt::Display for ControllerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(state) => write!(f, "succeeded (device {})", state),
            Self::Aborted(evidence) => write!(f, "aborted: pairing requested ({})", evidence),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
            Self::EnvironmentMissing(msg) => write!(f, "environment missing: {}", msg),
            Self::AlreadyInProgress => write!(f, "already in progress"),
        }
    }
}

/// Record of one wake/sleep invocation, kept only for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationAttempt {
    pub action: ActionKind,
    /// Number of attempts made, 1-based
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub outcome: ControllerOutcome,
    pub policy: PolicyConfig,
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping_keeps_outcomes_distinct() {
        assert!(matches!(
            ControllerOutcome::from_error(BackendError::PairingRequested("pin".into())),
            ControllerOutcome::Aborted(_)
        ));
        assert_eq!(
            ControllerOutcome::from_error(BackendError::Timeout(Duration::from_secs(12))),
            ControllerOutcome::Failed(FailureReason::Timeout)
        );
        assert!(matches!(
            ControllerOutcome::from_error(BackendError::EnvironmentMissing("x".into())),
            ControllerOutcome::EnvironmentMissing(_)
        ));
        assert_eq!(
            ControllerOutcome::from_error(BackendError::Cancelled),
            ControllerOutcome::Failed(FailureReason::Cancelled)
        );
    }

    #[test]
    fn test_exit_codes_are_unique() {
        let outcomes = [
            ControllerOutcome::Success(ObservedState::Connected),
            ControllerOutcome::Aborted(String::new()),
            ControllerOutcome::Failed(FailureReason::Timeout),
            ControllerOutcome::EnvironmentMissing(String::new()),
            ControllerOutcome::AlreadyInProgress,
        ];
        let mut codes: Vec<i32> = outcomes.iter().map(|o| o.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), outcomes.len());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(ControllerOutcome::Success(ObservedState::Connected)).unwrap();
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["detail"], "connected");

        let json = serde_json::to_value(ControllerOutcome::Failed(FailureReason::Timeout)).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["detail"]["reason"], "timeout");
    }
}
