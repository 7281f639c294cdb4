//! Pairing-abort guard
//!
//! Every backend call runs alongside a [`PairingGuard`]. Backends feed the
//! guard whatever text they observe (process output as it streams in,
//! library error messages) and the guard trips its cancellation token the
//! moment a pairing or PIN request shows up. Anything awaiting
//! [`PairingGuard::cancelled`] is woken immediately, which is how an
//! in-flight command gets interrupted rather than merely skipped.
//!
//! The same token is a child of the device instance's shutdown token, so a
//! shutdown interrupts calls through the exact same path.
//!
//! The guard also carries the per-command deadline of the policy snapshot
//! the attempt runs under, so backends never hold a timeout of their own.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bluetooth::BackendError;

/// Per-command deadline used when no policy supplied one
pub const DEFAULT_COMMAND_DEADLINE: Duration = Duration::from_secs(12);

/// Case-insensitive fragments that mean the device or the local agent is
/// asking for pairing input.
const PAIRING_MARKERS: &[&str] = &[
    "request pin",
    "request passkey",
    "request confirmation",
    "confirm passkey",
    "enter pin",
    "enter passkey",
    "passkey",
    "pincode",
    "pin code",
    "authorize service",
    "authentication",
    "pairing",
];

/// State lines that mention pairing without being a request
const STATE_LINE_PREFIXES: &[&str] = &["paired:", "pairable:", "bonded:"];

/// Return the first pairing marker found in `text`, ignoring the plain
/// `Paired:`/`Pairable:` state lines printed by device info queries.
pub fn find_pairing_marker(text: &str) -> Option<&'static str> {
    text.lines()
        .map(|line| line.trim().to_ascii_lowercase())
        .filter(|line| !STATE_LINE_PREFIXES.iter().any(|prefix| line.starts_with(prefix)))
        .find_map(|line| PAIRING_MARKERS.iter().copied().find(|marker| line.contains(marker)))
}

/// Cancellation context for one operation attempt
#[derive(Debug, Clone)]
pub struct PairingGuard {
    token: CancellationToken,
    evidence: Arc<Mutex<Option<String>>>,
    deadline: Duration,
}

impl Default for PairingGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingGuard {
    /// Create a standalone guard
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Create a guard that is also cancelled when `parent` is cancelled
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self::with_token(parent.child_token())
    }

    fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            evidence: Arc::new(Mutex::new(None)),
            deadline: DEFAULT_COMMAND_DEADLINE,
        }
    }

    /// Set the deadline backends apply to each command under this guard
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Deadline for a single backend command
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Inspect backend output. Trips the guard and returns `true` if it
    /// contains a pairing request.
    pub fn inspect(&self, text: &str) -> bool {
        match find_pairing_marker(text) {
            Some(marker) => {
                self.trip(format!("pairing marker '{}' observed", marker));
                true
            }
            None => false,
        }
    }

    /// Record a pairing request and cancel whatever is in flight.
    /// The first piece of evidence wins.
    pub fn trip(&self, evidence: impl Into<String>) {
        if let Ok(mut slot) = self.evidence.lock() {
            if slot.is_none() {
                let evidence = evidence.into();
                log::warn!("Pairing request detected ({}), aborting operation", evidence);
                *slot = Some(evidence);
            }
        }
        self.token.cancel();
    }

    /// Evidence of a pairing request, if one was observed
    pub fn pairing_requested(&self) -> Option<String> {
        self.evidence.lock().ok().and_then(|slot| slot.clone())
    }

    /// Whether the guard has been tripped or its parent cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the guard is tripped or its parent is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Error describing why the guard fired
    pub fn interruption(&self) -> BackendError {
        match self.pairing_requested() {
            Some(evidence) => BackendError::PairingRequested(evidence),
            None => BackendError::Cancelled,
        }
    }

    /// Run one backend call under this guard with a hard deadline.
    ///
    /// The call is dropped (and with it any child process) as soon as the
    /// guard fires or the deadline passes. A call that reports a pairing
    /// request itself also trips the guard so later steps observe it.
    pub async fn run<T, F>(&self, deadline: Duration, call: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        if self.is_cancelled() {
            return Err(self.interruption());
        }

        let result = tokio::select! {
            biased;
            () = self.cancelled() => Err(self.interruption()),
            res = tokio::time::timeout(deadline, call) => match res {
                Ok(inner) => inner,
                Err(_) => Err(BackendError::Timeout(deadline)),
            },
        };

        match result {
            Err(BackendError::PairingRequested(evidence)) => {
                self.trip(evidence.clone());
                Err(BackendError::PairingRequested(evidence))
            }
            // a marker seen on the same poll that completed the call still wins
            _ if self.pairing_requested().is_some() => Err(self.interruption()),
            other => other,
        }
    }
}
