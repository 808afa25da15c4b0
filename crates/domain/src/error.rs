//! Error taxonomy shared across the workspace.
//!
//! Each concern owns a typed error; [`DevicePilotError`] unifies them via
//! `#[from]` so callers can bubble anything up with `?`.
//!
//! Only [`TunnelError`] on an initial start ever reaches a caller. Every
//! other error is absorbed by the component that produced it (retry,
//! backoff, state transition, or logged best-effort degradation).

use std::time::Duration;

/// Top-level error for the whole workspace.
#[derive(Debug, thiserror::Error)]
pub enum DevicePilotError {
    #[error("validation error")]
    Validation(#[from] ValidationError),

    #[error("tunnel error")]
    Tunnel(#[from] TunnelError),

    #[error("positioning error")]
    Positioning(#[from] PositioningError),

    #[error("conditioning error")]
    Conditioning(#[from] ConditioningError),

    #[error("automation error")]
    Automation(#[from] AutomationError),

    #[error("process lifecycle error")]
    Process(#[from] ProcessError),

    #[error("teardown error")]
    Teardown(#[from] TeardownError),
}

/// Domain invariant violations detected while building model values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("name must not be empty")]
    EmptyName,

    #[error("profile {0:?} has no resolver candidates")]
    NoResolvers(String),

    #[error("resolver candidate {0:?} has no addresses")]
    EmptyResolverSet(String),

    #[error("at least one conditioning target is required")]
    NoTargets,

    #[error("healthy delay table must have {expected} entries, got {actual}")]
    DelayTableSize { expected: usize, actual: usize },

    #[error("automation step {0:?} has no candidate labels")]
    NoCandidateLabels(String),

    #[error("automation step {0:?} must allow at least one attempt")]
    ZeroRetries(String),

    #[error("sequence must contain at least one step")]
    EmptySequence,
}

/// Failure to establish, rotate or close the virtual tunnel.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// No transport capable of opening a tunnel exists on this host.
    #[error("tunnel transport unavailable")]
    Unavailable,

    /// The host refused the tunnel (user consent missing, policy, …).
    #[error("tunnel permission denied")]
    PermissionDenied,

    /// The requested profile is not configured.
    #[error("unknown tunnel profile {0:?}")]
    UnknownProfile(String),

    /// The transport failed while opening the tunnel.
    #[error("failed to open tunnel")]
    Open(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The transport failed while closing the tunnel.
    #[error("failed to close tunnel")]
    Close(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid tunnel configuration")]
    Validation(#[from] ValidationError),
}

/// Failures reported by the positioning provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PositioningError {
    #[error("positioning permission denied")]
    PermissionDenied,

    #[error("positioning provider disabled")]
    ProviderDisabled,

    #[error("positioning temporarily unavailable")]
    Unavailable,
}

impl PositioningError {
    /// Whether the error leaves the stabilizer in its terminal error state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PermissionDenied)
    }
}

/// A single failed conditioning attempt.
#[derive(Debug, thiserror::Error)]
pub enum ConditioningError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("no response within {0:?}")]
    ReadTimeout(Duration),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("transport failure")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Failures while driving the foreign UI.
#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    /// No candidate label matched after all attempts.
    #[error("no match for {labels:?} after {attempts} attempts")]
    NoMatch { labels: Vec<String>, attempts: u32 },

    #[error("UI snapshot unavailable")]
    SnapshotUnavailable,

    #[error("failed to activate node")]
    Activation(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("unknown sequence {0:?}")]
    UnknownSequence(String),

    #[error("precondition not met: {0}")]
    PreconditionNotMet(String),

    #[error("automation task failed")]
    Join(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Failures of the hosting-process capability.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("keep-awake resource unavailable")]
    KeepAwakeUnavailable,

    #[error("process lifecycle operation failed")]
    Platform(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A subordinate failed to stop during teardown.
#[derive(Debug, thiserror::Error)]
pub enum TeardownError {
    #[error("{component} did not stop within {timeout:?}")]
    Timeout {
        component: &'static str,
        timeout: Duration,
    },

    #[error("{component} failed to stop")]
    Component {
        component: &'static str,
        #[source]
        source: Box<DevicePilotError>,
    },

    #[error("process lifecycle step failed")]
    Process(#[from] ProcessError),
}
