//! A single label-search-and-activate step.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(800);

/// Direction of the scroll gesture issued between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Forward,
    Backward,
}

/// Search the UI for any of `candidate_labels` and activate the match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationStep {
    pub name: String,
    /// Tried in order; duplicates are dropped on construction.
    pub candidate_labels: Vec<String>,
    /// Number of snapshot attempts before giving up.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl AutomationStep {
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut candidate_labels: Vec<String> = Vec::new();
        for label in labels {
            let label = label.into();
            if !candidate_labels.contains(&label) {
                candidate_labels.push(label);
            }
        }
        Self {
            name: name.into(),
            candidate_labels,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Check domain invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the name or label list is empty, or
    /// when `max_retries` is zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.candidate_labels.iter().all(|l| l.trim().is_empty()) {
            return Err(ValidationError::NoCandidateLabels(self.name.clone()));
        }
        if self.max_retries == 0 {
            return Err(ValidationError::ZeroRetries(self.name.clone()));
        }
        Ok(())
    }
}
