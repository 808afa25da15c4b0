//! UI automation controller: search a foreign UI for a label and activate it.
//!
//! [`UiAutomationController::attempt_interaction`] blocks (snapshots,
//! gestures and the retry sleep all run on the calling thread). Async code
//! goes through [`UiAutomationController::run_step`], which moves the work
//! onto tokio's blocking pool.

use std::sync::Arc;

use devicepilot_domain::automation::{AutomationStep, ScrollDirection};
use devicepilot_domain::error::AutomationError;

use crate::ports::UiTreeSource;

/// A successful activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interaction {
    /// Candidate label that resolved to the activated node.
    pub label: String,
    /// Snapshots taken, including the successful one.
    pub attempts: u32,
}

pub struct UiAutomationController<U> {
    source: Arc<U>,
}

impl<U> Clone for UiAutomationController<U> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

impl<U: UiTreeSource + 'static> UiAutomationController<U> {
    pub fn new(source: Arc<U>) -> Self {
        Self { source }
    }

    /// Snapshot, search, activate; scroll and retry when nothing matches.
    ///
    /// Makes at most `step.max_retries` snapshot attempts, sleeping
    /// `step.retry_delay` between them. Must not be called from an async
    /// context; see [`Self::run_step`].
    ///
    /// # Errors
    ///
    /// Returns [`AutomationError::NoMatch`] once every attempt is used up.
    pub fn attempt_interaction(&self, step: &AutomationStep) -> Result<Interaction, AutomationError> {
        let max_attempts = step.max_retries.max(1);
        for attempt in 1..=max_attempts {
            match self.source.snapshot() {
                Ok(tree) => {
                    if let Some(hit) = tree.find_activatable(&step.candidate_labels) {
                        match self.source.activate(hit.target) {
                            Ok(()) => {
                                tracing::info!(step = %step.name, label = hit.label, attempt, "activated");
                                return Ok(Interaction {
                                    label: hit.label.to_string(),
                                    attempts: attempt,
                                });
                            }
                            Err(err) => {
                                tracing::warn!(step = %step.name, label = hit.label, attempt, %err, "activation failed");
                            }
                        }
                    }
                }
                Err(err) => tracing::warn!(step = %step.name, attempt, %err, "snapshot failed"),
            }

            if let Err(err) = self.source.scroll(ScrollDirection::Forward) {
                tracing::debug!(step = %step.name, %err, "scroll gesture failed");
            }
            if attempt < max_attempts {
                std::thread::sleep(step.retry_delay);
            }
        }

        tracing::warn!(step = %step.name, attempts = max_attempts, "no candidate label matched");
        Err(AutomationError::NoMatch {
            labels: step.candidate_labels.clone(),
            attempts: max_attempts,
        })
    }

    /// Run [`Self::attempt_interaction`] on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns the interaction error, or [`AutomationError::Join`] when the
    /// blocking task panicked or was cancelled.
    pub async fn run_step(&self, step: AutomationStep) -> Result<Interaction, AutomationError> {
        let controller = self.clone();
        tokio::task::spawn_blocking(move || controller.attempt_interaction(&step))
            .await
            .map_err(|err| AutomationError::Join(Box::new(err)))?
    }
}
