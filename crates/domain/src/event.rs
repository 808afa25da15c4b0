//! Status events: immutable records published on the event bus.
//!
//! Every event carries a typed [`StatusPayload`]; its [`Topic`] is derived
//! from the payload so subscribers can filter without matching variants.

use serde::{Deserialize, Serialize};

use crate::engine::EngineState;
use crate::id::EventId;
use crate::location::LocationState;
use crate::time::{Timestamp, now};

/// Subscription key for the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    EngineStatus,
    LocationStatus,
    LockAchieved,
    ConditioningCycle,
    AutomationStep,
    Teardown,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusPayload {
    EngineStatusChanged {
        state: EngineState,
        resolver_label: Option<String>,
    },
    LocationStatusChanged {
        state: LocationState,
    },
    /// Published once per Stabilizing → Locked edge, after the settle delay.
    LockAchieved {
        accuracy_m: f64,
    },
    ConditioningCycleCompleted {
        target: String,
        success: bool,
        attempts: u32,
    },
    AutomationStepCompleted {
        sequence: String,
        step: String,
        success: bool,
    },
    TeardownStage {
        stage: u8,
        name: String,
        clean: bool,
    },
}

impl StatusPayload {
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Self::EngineStatusChanged { .. } => Topic::EngineStatus,
            Self::LocationStatusChanged { .. } => Topic::LocationStatus,
            Self::LockAchieved { .. } => Topic::LockAchieved,
            Self::ConditioningCycleCompleted { .. } => Topic::ConditioningCycle,
            Self::AutomationStepCompleted { .. } => Topic::AutomationStep,
            Self::TeardownStage { .. } => Topic::Teardown,
        }
    }
}

/// An immutable status record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: StatusPayload,
}

impl StatusEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(payload: StatusPayload) -> Self {
        Self {
            id: EventId::new(),
            timestamp: now(),
            payload,
        }
    }

    #[must_use]
    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }
}

impl From<StatusPayload> for StatusEvent {
    fn from(payload: StatusPayload) -> Self {
        Self::new(payload)
    }
}
