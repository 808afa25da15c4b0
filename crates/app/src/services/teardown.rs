//! Teardown orchestrator: staged, escalating shutdown.
//!
//! Stages run in order and every one of them runs: errors are logged,
//! collected into the [`TeardownReport`] and published, never propagated.
//!
//! 1. graceful stop of conditioner, tunnel and positioning
//! 2. after the grace delay, forced stop of the same three
//! 3. release keep-awake
//! 4. remove the automation surface from the task list (optional)
//! 5. after the final delay, terminate the process

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use devicepilot_domain::error::{DevicePilotError, TeardownError};
use devicepilot_domain::event::StatusPayload;

use crate::event_bus::EventBus;
use crate::ports::{
    EventPublisher, PositioningProvider, ProcessLifecycle, RequestClient, TunnelTransport,
};
use crate::services::engine::Subordinates;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownConfig {
    pub grace_delay: Duration,
    pub final_delay: Duration,
    /// Upper bound for each graceful stop in stage 1.
    pub stop_timeout: Duration,
    pub remove_from_tasks: bool,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            grace_delay: Duration::from_millis(1500),
            final_delay: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(5),
            remove_from_tasks: true,
        }
    }
}

#[derive(Debug)]
pub struct StageReport {
    pub stage: u8,
    pub name: &'static str,
    pub errors: Vec<TeardownError>,
}

impl StageReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TeardownReport {
    pub stages: Vec<StageReport>,
}

impl TeardownReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.stages.iter().all(StageReport::is_clean)
    }

    /// Whether the terminate stage ran.
    #[must_use]
    pub fn reached_final_stage(&self) -> bool {
        self.stages.last().is_some_and(|s| s.stage == 5)
    }
}

pub struct TeardownOrchestrator<T, P, R, L> {
    parts: Subordinates<T, P, R>,
    lifecycle: Arc<L>,
    bus: Arc<EventBus>,
    config: TeardownConfig,
}

impl<T, P, R, L> TeardownOrchestrator<T, P, R, L>
where
    T: TunnelTransport + 'static,
    P: PositioningProvider + 'static,
    R: RequestClient + 'static,
    L: ProcessLifecycle,
{
    pub fn new(
        parts: Subordinates<T, P, R>,
        lifecycle: Arc<L>,
        bus: Arc<EventBus>,
        config: TeardownConfig,
    ) -> Self {
        Self {
            parts,
            lifecycle,
            bus,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &TeardownConfig {
        &self.config
    }

    /// Run all five stages and terminate the process.
    pub async fn run(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        tracing::info!("teardown started");

        let mut errors = Vec::new();
        if self
            .bounded("conditioner", self.parts.conditioner.stop())
            .await
            .is_none()
        {
            errors.push(self.timed_out("conditioner"));
        }
        self.stop_tunnel(&mut errors).await;
        self.parts.stabilizer.stop();
        self.finish(&mut report, 1, "graceful_stop", errors);

        tokio::time::sleep(self.config.grace_delay).await;
        let mut errors = Vec::new();
        self.parts.conditioner.force_stop();
        self.stop_tunnel(&mut errors).await;
        self.parts.stabilizer.stop();
        self.finish(&mut report, 2, "forced_stop", errors);

        let errors = self.lifecycle.release().err().map(TeardownError::from);
        self.finish(&mut report, 3, "release_keep_awake", errors.into_iter().collect());

        let errors = if self.config.remove_from_tasks {
            self.lifecycle
                .remove_from_task_list()
                .err()
                .map(TeardownError::from)
        } else {
            None
        };
        self.finish(&mut report, 4, "remove_from_task_list", errors.into_iter().collect());

        tokio::time::sleep(self.config.final_delay).await;
        self.finish(&mut report, 5, "terminate", Vec::new());
        tracing::info!(clean = report.is_clean(), "teardown complete, terminating");
        self.lifecycle.terminate();
        report
    }

    async fn stop_tunnel(&self, errors: &mut Vec<TeardownError>) {
        match self.bounded("tunnel", self.parts.tunnel.teardown()).await {
            None => errors.push(self.timed_out("tunnel")),
            Some(Err(err)) => errors.push(TeardownError::Component {
                component: "tunnel",
                source: Box::new(DevicePilotError::from(err)),
            }),
            Some(Ok(())) => {}
        }
    }

    async fn bounded<F: Future>(&self, component: &'static str, future: F) -> Option<F::Output> {
        let result = tokio::time::timeout(self.config.stop_timeout, future).await.ok();
        if result.is_none() {
            tracing::warn!(component, timeout = ?self.config.stop_timeout, "graceful stop timed out");
        }
        result
    }

    fn timed_out(&self, component: &'static str) -> TeardownError {
        TeardownError::Timeout {
            component,
            timeout: self.config.stop_timeout,
        }
    }

    fn finish(
        &self,
        report: &mut TeardownReport,
        stage: u8,
        name: &'static str,
        errors: Vec<TeardownError>,
    ) {
        for err in &errors {
            tracing::warn!(stage, name, %err, "teardown stage error swallowed");
        }
        let clean = errors.is_empty();
        tracing::debug!(stage, name, clean, "teardown stage finished");
        self.bus.emit(StatusPayload::TeardownStage {
            stage,
            name: name.to_string(),
            clean,
        });
        report.stages.push(StageReport {
            stage,
            name,
            errors,
        });
    }
}
