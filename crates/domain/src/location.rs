//! Positioning samples and the lock state machine.
//!
//! [`LockTracker`] is pure: it folds provider updates into a
//! [`LocationState`] and reports edges. Timing (settle delay) and event
//! publication live in the application layer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PositioningError;
use crate::time::Timestamp;

/// Accuracy (metres) below which a sample counts as a lock.
pub const DEFAULT_LOCK_THRESHOLD_M: f64 = 25.0;

/// One fix reported by the positioning provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    pub timestamp: Timestamp,
}

/// Everything a positioning provider can deliver on its update stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderUpdate {
    Sample(LocationSample),
    Enabled,
    Disabled,
    Failed(PositioningError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationState {
    #[default]
    Idle,
    Stabilizing,
    Locked,
    Disabled,
    Error,
}

impl fmt::Display for LocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Stabilizing => "stabilizing",
            Self::Locked => "locked",
            Self::Disabled => "disabled",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A state change produced by the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub from: LocationState,
    pub to: LocationState,
    /// Set on the Stabilizing → Locked edge; carries the accuracy that locked.
    pub lock_accuracy: Option<f64>,
}

/// Edge-triggered lock state machine.
#[derive(Debug, Clone)]
pub struct LockTracker {
    state: LocationState,
    threshold_m: f64,
    resume_on_enable: bool,
}

impl Default for LockTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_THRESHOLD_M, true)
    }
}

impl LockTracker {
    /// Create a tracker in [`LocationState::Idle`].
    ///
    /// With `resume_on_enable`, a provider that comes back after being
    /// disabled puts the tracker back into Stabilizing.
    #[must_use]
    pub fn new(threshold_m: f64, resume_on_enable: bool) -> Self {
        Self {
            state: LocationState::Idle,
            threshold_m,
            resume_on_enable,
        }
    }

    #[must_use]
    pub fn state(&self) -> LocationState {
        self.state
    }

    /// The stabilizer subscribed to the provider.
    pub fn subscribed(&mut self, provider_enabled: bool) -> Option<Transition> {
        if self.state != LocationState::Idle {
            return None;
        }
        let to = if provider_enabled {
            LocationState::Stabilizing
        } else {
            LocationState::Disabled
        };
        self.move_to(to, None)
    }

    /// Return to Idle (unsubscribe or explicit retry from Error).
    pub fn reset(&mut self) -> Option<Transition> {
        self.move_to(LocationState::Idle, None)
    }

    /// Fold one provider update into the state.
    pub fn apply(&mut self, update: &ProviderUpdate) -> Option<Transition> {
        use LocationState::{Disabled, Error, Idle, Locked, Stabilizing};

        if matches!(self.state, Idle | Error) {
            return None;
        }

        match update {
            ProviderUpdate::Sample(sample) => match self.state {
                Stabilizing if self.is_lock_quality(sample) => {
                    self.move_to(Locked, Some(sample.accuracy_m))
                }
                Locked if !self.is_lock_quality(sample) => {
                    self.move_to(Stabilizing, None)
                }
                _ => None,
            },
            ProviderUpdate::Disabled => self.move_to(Disabled, None),
            ProviderUpdate::Enabled if self.state == Disabled && self.resume_on_enable => {
                self.move_to(Stabilizing, None)
            }
            ProviderUpdate::Enabled => None,
            ProviderUpdate::Failed(err) if err.is_terminal() => self.move_to(Error, None),
            ProviderUpdate::Failed(PositioningError::ProviderDisabled) => {
                self.move_to(Disabled, None)
            }
            ProviderUpdate::Failed(_) if self.state == Locked => self.move_to(Stabilizing, None),
            ProviderUpdate::Failed(_) => None,
        }
    }

    /// Enter the terminal error state regardless of the current state.
    pub fn fail(&mut self) -> Option<Transition> {
        self.move_to(LocationState::Error, None)
    }

    /// NaN accuracy never qualifies.
    fn is_lock_quality(&self, sample: &LocationSample) -> bool {
        sample.accuracy_m < self.threshold_m
    }

    fn move_to(&mut self, to: LocationState, lock_accuracy: Option<f64>) -> Option<Transition> {
        if self.state == to {
            return None;
        }
        let from = std::mem::replace(&mut self.state, to);
        Some(Transition {
            from,
            to,
            lock_accuracy,
        })
    }
}
