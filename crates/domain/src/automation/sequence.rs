//! Sequences: explicit, ordered compositions of automation steps.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

use super::step::AutomationStep;

/// Condition awaited before a step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Precondition {
    /// Wait for the next positioning lock (or an existing one) up to `timeout`.
    LocationLocked {
        #[serde(with = "millis")]
        timeout: Duration,
    },
}

/// One entry of a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceStep {
    pub step: AutomationStep,
    /// Fixed pause before the step runs.
    pub delay_before: Duration,
    pub precondition: Option<Precondition>,
    /// Follow-up run only when the main step succeeded (e.g. dismiss a dialog).
    pub confirmation: Option<AutomationStep>,
}

impl SequenceStep {
    #[must_use]
    pub fn new(step: AutomationStep) -> Self {
        Self {
            step,
            delay_before: Duration::ZERO,
            precondition: None,
            confirmation: None,
        }
    }

    #[must_use]
    pub fn delay_before(mut self, delay: Duration) -> Self {
        self.delay_before = delay;
        self
    }

    #[must_use]
    pub fn precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = Some(precondition);
        self
    }

    #[must_use]
    pub fn confirm_with(mut self, confirmation: AutomationStep) -> Self {
        self.confirmation = Some(confirmation);
        self
    }
}

/// A named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    pub id: String,
    pub steps: Vec<SequenceStep>,
}

impl Sequence {
    /// Create a builder for constructing a [`Sequence`].
    #[must_use]
    pub fn builder() -> SequenceBuilder {
        SequenceBuilder::default()
    }

    /// Check domain invariants, including every step and confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for an empty id, an empty step list, or
    /// the first invalid step.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.steps.is_empty() {
            return Err(ValidationError::EmptySequence);
        }
        for entry in &self.steps {
            entry.step.validate()?;
            if let Some(confirmation) = &entry.confirmation {
                confirmation.validate()?;
            }
        }
        Ok(())
    }
}

/// Step-by-step builder for [`Sequence`].
#[derive(Debug, Default)]
pub struct SequenceBuilder {
    id: Option<String>,
    steps: Vec<SequenceStep>,
}

impl SequenceBuilder {
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn step(mut self, step: SequenceStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Consume the builder, validate, and return a [`Sequence`].
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the sequence is invalid.
    pub fn build(self) -> Result<Sequence, ValidationError> {
        let sequence = Sequence {
            id: self.id.unwrap_or_default(),
            steps: self.steps,
        };
        sequence.validate()?;
        Ok(sequence)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
