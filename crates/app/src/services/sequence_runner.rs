//! Sequence runner: interprets a [`Sequence`] step by step.
//!
//! Sequences are best-effort: a failed step is recorded and published, and
//! the next step runs anyway. Only cancellation ends a run early.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use devicepilot_domain::automation::{AutomationStep, Precondition, Sequence};
use devicepilot_domain::error::AutomationError;
use devicepilot_domain::event::StatusPayload;
use devicepilot_domain::id::RunId;

use crate::ports::{EventPublisher, UiTreeSource};
use crate::services::ui_automation::UiAutomationController;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: String,
    pub success: bool,
    /// Snapshot attempts spent; zero when the step never ran.
    pub attempts: u32,
    pub error: Option<String>,
}

impl StepOutcome {
    fn failed(step: &AutomationStep, attempts: u32, err: &AutomationError) -> Self {
        Self {
            step: step.name.clone(),
            success: false,
            attempts,
            error: Some(err.to_string()),
        }
    }
}

/// What happened during one run of a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceReport {
    pub run_id: RunId,
    pub sequence: String,
    /// Main steps and confirmations, in execution order.
    pub outcomes: Vec<StepOutcome>,
    pub cancelled: bool,
}

impl SequenceReport {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    /// Every step ran and succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.outcomes.iter().all(|o| o.success)
    }
}

pub struct SequenceRunner<U, E> {
    controller: UiAutomationController<U>,
    publisher: E,
    lock_signal: Option<watch::Receiver<bool>>,
}

impl<U, E> SequenceRunner<U, E>
where
    U: UiTreeSource + 'static,
    E: EventPublisher + Send + Sync,
{
    pub fn new(controller: UiAutomationController<U>, publisher: E) -> Self {
        Self {
            controller,
            publisher,
            lock_signal: None,
        }
    }

    /// Source for [`Precondition::LocationLocked`]; without one that
    /// precondition is never met.
    #[must_use]
    pub fn with_lock_signal(mut self, signal: watch::Receiver<bool>) -> Self {
        self.lock_signal = Some(signal);
        self
    }

    pub async fn run(&self, sequence: &Sequence, cancel: &CancellationToken) -> SequenceReport {
        self.run_as(RunId::new(), sequence, cancel).await
    }

    /// Like [`Self::run`] with a caller-assigned run id.
    pub async fn run_as(
        &self,
        run_id: RunId,
        sequence: &Sequence,
        cancel: &CancellationToken,
    ) -> SequenceReport {
        let mut report = SequenceReport {
            run_id,
            sequence: sequence.id.clone(),
            outcomes: Vec::with_capacity(sequence.steps.len()),
            cancelled: false,
        };
        tracing::info!(run = %report.run_id, sequence = %sequence.id, steps = sequence.steps.len(), "sequence started");

        for entry in &sequence.steps {
            if !entry.delay_before.is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(entry.delay_before) => {}
                }
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let outcome = match self.await_precondition(entry.precondition, cancel).await {
                Ok(()) => self.run_one(&entry.step).await,
                Err(_) if cancel.is_cancelled() => {
                    report.cancelled = true;
                    break;
                }
                Err(err) => {
                    tracing::warn!(step = %entry.step.name, %err, "precondition not met, skipping step");
                    StepOutcome::failed(&entry.step, 0, &err)
                }
            };
            let succeeded = outcome.success;
            self.record(&mut report, outcome);

            if let Some(confirmation) = entry.confirmation.as_ref().filter(|_| succeeded) {
                let outcome = self.run_one(confirmation).await;
                self.record(&mut report, outcome);
            }
        }

        tracing::info!(
            run = %report.run_id,
            sequence = %sequence.id,
            succeeded = report.succeeded(),
            total = report.outcomes.len(),
            cancelled = report.cancelled,
            "sequence finished"
        );
        report
    }

    async fn run_one(&self, step: &AutomationStep) -> StepOutcome {
        match self.controller.run_step(step.clone()).await {
            Ok(hit) => StepOutcome {
                step: step.name.clone(),
                success: true,
                attempts: hit.attempts,
                error: None,
            },
            Err(err) => {
                tracing::warn!(step = %step.name, %err, "automation step failed");
                let attempts = match &err {
                    AutomationError::NoMatch { attempts, .. } => *attempts,
                    _ => 0,
                };
                StepOutcome::failed(step, attempts, &err)
            }
        }
    }

    fn record(&self, report: &mut SequenceReport, outcome: StepOutcome) {
        self.publisher.emit(StatusPayload::AutomationStepCompleted {
            sequence: report.sequence.clone(),
            step: outcome.step.clone(),
            success: outcome.success,
        });
        report.outcomes.push(outcome);
    }

    async fn await_precondition(
        &self,
        precondition: Option<Precondition>,
        cancel: &CancellationToken,
    ) -> Result<(), AutomationError> {
        let Some(Precondition::LocationLocked { timeout }) = precondition else {
            return Ok(());
        };
        let Some(signal) = &self.lock_signal else {
            return Err(AutomationError::PreconditionNotMet(
                "no positioning lock source".to_string(),
            ));
        };

        let mut signal = signal.clone();
        let locked = async { signal.wait_for(|locked| *locked).await.map(|_| ()) };
        tokio::select! {
            () = cancel.cancelled() => Err(AutomationError::PreconditionNotMet(
                "sequence cancelled".to_string(),
            )),
            waited = tokio::time::timeout(timeout, locked) => match waited {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(AutomationError::PreconditionNotMet(
                    "positioning lock source closed".to_string(),
                )),
                Err(_) => Err(AutomationError::PreconditionNotMet(format!(
                    "no positioning lock within {timeout:?}"
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::services::positioning_stabilizer::tests::{count, record};
    use crate::services::ui_automation::tests::{ScriptedSource, permission_dialog};
    use devicepilot_domain::automation::SequenceStep;
    use devicepilot_domain::event::Topic;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn step(name: &str, labels: &[&str]) -> AutomationStep {
        AutomationStep::new(name, labels.iter().copied())
            .with_max_retries(2)
            .with_retry_delay(Duration::from_millis(1))
    }

    fn runner(source: &Arc<ScriptedSource>, bus: &Arc<EventBus>) -> SequenceRunner<ScriptedSource, Arc<EventBus>> {
        SequenceRunner::new(
            UiAutomationController::new(Arc::clone(source)),
            Arc::clone(bus),
        )
    }

    fn source() -> Arc<ScriptedSource> {
        Arc::new(ScriptedSource::new(vec![permission_dialog()]))
    }

    #[tokio::test]
    async fn should_continue_after_failed_step() {
        let source = source();
        let bus = Arc::new(EventBus::new(16));
        let events = record(&bus);
        let sequence = Sequence::builder()
            .id("grant")
            .step(SequenceStep::new(step("continue", &["Continue"])))
            .step(SequenceStep::new(step("allow", &["While using"])))
            .build()
            .unwrap();

        let report = runner(&source, &bus)
            .run(&sequence, &CancellationToken::new())
            .await;

        let results: Vec<bool> = report.outcomes.iter().map(|o| o.success).collect();
        assert_eq!(results, vec![false, true]);
        assert_eq!(report.outcomes[0].attempts, 2);
        assert!(!report.cancelled);
        assert!(!report.is_complete());
        assert_eq!(count(&events, Topic::AutomationStep), 2);
    }

    #[tokio::test]
    async fn should_run_confirmation_only_after_success() {
        let source = source();
        let bus = Arc::new(EventBus::new(16));
        let sequence = Sequence::builder()
            .id("dialogs")
            .step(
                SequenceStep::new(step("allow", &["While using"]))
                    .confirm_with(step("allow/confirm", &["btn_deny"])),
            )
            .step(
                SequenceStep::new(step("missing", &["Nope"]))
                    .confirm_with(step("missing/confirm", &["btn_allow"])),
            )
            .build()
            .unwrap();

        let report = runner(&source, &bus)
            .run(&sequence, &CancellationToken::new())
            .await;

        let names: Vec<&str> = report.outcomes.iter().map(|o| o.step.as_str()).collect();
        assert_eq!(names, vec!["allow", "allow/confirm", "missing"]);
        assert_eq!(source.activated_ids(), vec!["btn_allow", "btn_deny"]);
    }

    #[tokio::test(start_paused = true)]
    async fn should_skip_step_when_lock_never_arrives() {
        let source = source();
        let bus = Arc::new(EventBus::new(16));
        let (_tx, rx) = watch::channel(false);
        let sequence = Sequence::builder()
            .id("locked")
            .step(
                SequenceStep::new(step("allow", &["While using"])).precondition(
                    Precondition::LocationLocked {
                        timeout: Duration::from_secs(5),
                    },
                ),
            )
            .step(SequenceStep::new(step("deny", &["Don't allow"])))
            .build()
            .unwrap();

        let report = runner(&source, &bus)
            .with_lock_signal(rx)
            .run(&sequence, &CancellationToken::new())
            .await;

        assert!(!report.outcomes[0].success);
        assert!(
            report.outcomes[0]
                .error
                .as_deref()
                .is_some_and(|e| e.contains("no positioning lock"))
        );
        assert!(report.outcomes[1].success);
        assert_eq!(source.activated_ids(), vec!["btn_deny"]);
    }

    #[tokio::test(start_paused = true)]
    async fn should_run_step_once_lock_settles() {
        let source = source();
        let bus = Arc::new(EventBus::new(16));
        let (tx, rx) = watch::channel(false);
        let sequence = Sequence::builder()
            .id("locked")
            .step(
                SequenceStep::new(step("allow", &["While using"])).precondition(
                    Precondition::LocationLocked {
                        timeout: Duration::from_secs(10),
                    },
                ),
            )
            .build()
            .unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            tx.send_replace(true);
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let report = runner(&source, &bus)
            .with_lock_signal(rx)
            .run(&sequence, &CancellationToken::new())
            .await;

        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn should_fail_lock_precondition_without_signal() {
        let source = source();
        let bus = Arc::new(EventBus::new(16));
        let sequence = Sequence::builder()
            .id("locked")
            .step(
                SequenceStep::new(step("allow", &["While using"])).precondition(
                    Precondition::LocationLocked {
                        timeout: Duration::from_secs(1),
                    },
                ),
            )
            .build()
            .unwrap();

        let report = runner(&source, &bus)
            .run(&sequence, &CancellationToken::new())
            .await;

        assert_eq!(report.succeeded(), 0);
        assert_eq!(source.snapshots.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_between_steps_when_cancelled() {
        let source = source();
        let bus = Arc::new(EventBus::new(16));
        let sequence = Sequence::builder()
            .id("slow")
            .step(SequenceStep::new(step("allow", &["While using"])))
            .step(
                SequenceStep::new(step("deny", &["Don't allow"]))
                    .delay_before(Duration::from_secs(30)),
            )
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let report = runner(&source, &bus).run(&sequence, &cancel).await;

        assert!(report.cancelled);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(source.activated_ids(), vec!["btn_allow"]);
    }
}
