//! Diagnostics snapshot for export
//!
//! Everything here is safe to hand to an external collaborator: the device
//! address only ever appears in masked form.

use std::fmt;

use serde::Serialize;

use crate::bluetooth::{BackendKind, ObservedState};
use crate::config::PolicyConfig;
use crate::controller::{OperationAttempt, Phase, WakeController};

/// Where the published device state comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateSource {
    /// Periodic backend queries
    Polling,
    /// An external entity's reported status
    Mirror,
    /// Only wake/sleep results update the state
    None,
}

impl fmt::Display for StateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Polling => write!(f, "polling"),
            Self::Mirror => write!(f, "mirror"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Point-in-time view of one device instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsReport {
    pub name: String,
    /// Last three octets redacted
    pub address: String,
    pub backend: BackendKind,
    pub state_source: StateSource,
    pub observed_state: ObservedState,
    pub phase: Phase,
    pub policy: PolicyConfig,
    pub last_attempt: Option<OperationAttempt>,
}

impl DiagnosticsReport {
    /// Collect a report from a running controller
    pub fn collect(
        name: &str,
        controller: &WakeController,
        state_source: StateSource,
        policy: &PolicyConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            address: controller.address().masked(),
            backend: controller.backend_kind(),
            state_source,
            observed_state: controller.state().current(),
            phase: controller.phase(),
            policy: policy.clone(),
            last_attempt: controller.last_attempt(),
        }
    }

    /// Pretty JSON rendering
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
