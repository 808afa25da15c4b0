//! Command dispatcher: the single entry point for external commands.
//!
//! [`CommandDispatcher::spawn`] starts a consumer task fed by a bounded
//! queue, so commands are handled strictly in arrival order. Sequence runs
//! are spawned and never hold up the queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use devicepilot_domain::automation::Sequence;
use devicepilot_domain::engine::{EngineCommand, EngineState, StatusSnapshot};
use devicepilot_domain::error::{AutomationError, DevicePilotError};
use devicepilot_domain::id::RunId;

use crate::event_bus::EventBus;
use crate::ports::{
    PositioningProvider, ProcessLifecycle, RequestClient, TunnelTransport, UiTreeSource,
};
use crate::services::engine::EngineStateMachine;
use crate::services::sequence_runner::{SequenceReport, SequenceRunner};
use crate::services::teardown::{TeardownOrchestrator, TeardownReport};

/// Result of a handled command.
#[derive(Debug)]
pub enum CommandOutcome {
    Started(StatusSnapshot),
    Stopped,
    Restarted(StatusSnapshot),
    SequenceStarted(RunId),
    Status(StatusSnapshot),
    /// `false` when positioning was not in its error state.
    PositioningRetried(bool),
    ShutdownComplete(TeardownReport),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("command queue closed")]
    Closed,

    #[error(transparent)]
    Command(#[from] DevicePilotError),
}

type Reply = oneshot::Sender<Result<CommandOutcome, DevicePilotError>>;

struct Envelope {
    command: EngineCommand,
    reply: Option<Reply>,
}

/// Sending half of the dispatcher queue. Cheap to clone.
#[derive(Clone)]
pub struct CommandQueue {
    sender: mpsc::Sender<Envelope>,
}

impl CommandQueue {
    /// Enqueue `command` and wait for its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Closed`] when the dispatcher has shut down,
    /// or the command's own error.
    pub async fn send(&self, command: EngineCommand) -> Result<CommandOutcome, DispatchError> {
        let (reply, outcome) = oneshot::channel();
        self.sender
            .send(Envelope {
                command,
                reply: Some(reply),
            })
            .await
            .map_err(|_| DispatchError::Closed)?;
        Ok(outcome.await.map_err(|_| DispatchError::Closed)??)
    }

    /// Enqueue without waiting. Returns `false` when the queue is full or closed.
    pub fn submit(&self, command: EngineCommand) -> bool {
        self.sender
            .try_send(Envelope {
                command,
                reply: None,
            })
            .is_ok()
    }
}

pub struct CommandDispatcher<T, P, R, U, L> {
    engine: Arc<EngineStateMachine<T, P, R>>,
    teardown: TeardownOrchestrator<T, P, R, L>,
    runner: Arc<SequenceRunner<U, Arc<EventBus>>>,
    sequences: HashMap<String, Arc<Sequence>>,
    lifecycle: Arc<L>,
    terminate_on_stop: bool,
    cancel: CancellationToken,
    runs: Mutex<JoinSet<SequenceReport>>,
}

impl<T, P, R, U, L> CommandDispatcher<T, P, R, U, L>
where
    T: TunnelTransport + 'static,
    P: PositioningProvider + 'static,
    R: RequestClient + 'static,
    U: UiTreeSource + 'static,
    L: ProcessLifecycle + 'static,
{
    pub fn new(
        engine: Arc<EngineStateMachine<T, P, R>>,
        teardown: TeardownOrchestrator<T, P, R, L>,
        runner: SequenceRunner<U, Arc<EventBus>>,
        lifecycle: Arc<L>,
    ) -> Self {
        Self {
            engine,
            teardown,
            runner: Arc::new(runner),
            sequences: HashMap::new(),
            lifecycle,
            terminate_on_stop: false,
            cancel: CancellationToken::new(),
            runs: Mutex::new(JoinSet::new()),
        }
    }

    #[must_use]
    pub fn with_sequences(mut self, sequences: impl IntoIterator<Item = Sequence>) -> Self {
        self.sequences.extend(
            sequences
                .into_iter()
                .map(|sequence| (sequence.id.clone(), Arc::new(sequence))),
        );
        self
    }

    /// Make Stop escalate to the full teardown (process termination).
    #[must_use]
    pub fn terminate_on_stop(mut self, enabled: bool) -> Self {
        self.terminate_on_stop = enabled;
        self
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<EngineStateMachine<T, P, R>> {
        &self.engine
    }

    /// Handle one command.
    ///
    /// # Errors
    ///
    /// Returns the tunnel error of a failed start, or
    /// [`AutomationError::UnknownSequence`] for an unknown sequence id.
    pub async fn dispatch(&self, command: EngineCommand) -> Result<CommandOutcome, DevicePilotError> {
        tracing::debug!(command = command.name(), "dispatching command");
        match command {
            EngineCommand::Start { profile } => {
                self.engine.start(&profile).await?;
                self.sync_keep_awake();
                Ok(CommandOutcome::Started(self.engine.query()))
            }
            EngineCommand::Stop if self.terminate_on_stop => {
                Ok(CommandOutcome::ShutdownComplete(self.shutdown().await))
            }
            EngineCommand::Stop => {
                self.engine.stop().await;
                self.release_keep_awake();
                Ok(CommandOutcome::Stopped)
            }
            EngineCommand::Restart { profile } => {
                self.engine.restart(&profile).await?;
                self.sync_keep_awake();
                Ok(CommandOutcome::Restarted(self.engine.query()))
            }
            EngineCommand::RunSequence { sequence_id } => {
                let run_id = self.spawn_sequence(&sequence_id)?;
                Ok(CommandOutcome::SequenceStarted(run_id))
            }
            EngineCommand::QueryStatus => Ok(CommandOutcome::Status(self.engine.query())),
            EngineCommand::RetryPositioning => Ok(CommandOutcome::PositioningRetried(
                self.engine.retry_positioning(),
            )),
            EngineCommand::Shutdown => Ok(CommandOutcome::ShutdownComplete(self.shutdown().await)),
        }
    }

    /// Run a sequence to completion on the calling task.
    ///
    /// # Errors
    ///
    /// Returns [`AutomationError::UnknownSequence`] for an unknown id.
    pub async fn run_sequence(&self, sequence_id: &str) -> Result<SequenceReport, AutomationError> {
        let sequence = self.sequence(sequence_id)?;
        Ok(self.runner.run(&sequence, &self.cancel.child_token()).await)
    }

    /// Wait for every spawned sequence run and collect the reports.
    pub async fn join_sequences(&self) -> Vec<SequenceReport> {
        let mut runs = std::mem::take(&mut *self.runs.lock().unwrap_or_else(PoisonError::into_inner));
        let mut reports = Vec::new();
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => tracing::warn!(%err, "sequence run ended abnormally"),
            }
        }
        reports
    }

    /// Move the dispatcher onto a consumer task fed by a bounded queue.
    ///
    /// The task exits after Shutdown (or a terminating Stop), or when every
    /// [`CommandQueue`] has been dropped.
    pub fn spawn(self: Arc<Self>, capacity: usize) -> (CommandQueue, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<Envelope>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(Envelope { command, reply }) = receiver.recv().await {
                let last = matches!(command, EngineCommand::Shutdown)
                    || (self.terminate_on_stop && matches!(command, EngineCommand::Stop));
                let name = command.name();
                let result = self.dispatch(command).await;
                if let Err(err) = &result {
                    tracing::warn!(command = name, %err, "command failed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                if last {
                    break;
                }
            }
            tracing::debug!("command queue closed");
        });
        (CommandQueue { sender }, handle)
    }

    fn sequence(&self, sequence_id: &str) -> Result<Arc<Sequence>, AutomationError> {
        self.sequences
            .get(sequence_id)
            .cloned()
            .ok_or_else(|| AutomationError::UnknownSequence(sequence_id.to_string()))
    }

    fn spawn_sequence(&self, sequence_id: &str) -> Result<RunId, AutomationError> {
        let sequence = self.sequence(sequence_id)?;
        let run_id = RunId::new();
        let runner = Arc::clone(&self.runner);
        let cancel = self.cancel.child_token();
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        while runs.try_join_next().is_some() {}
        runs.spawn(async move { runner.run_as(run_id, &sequence, &cancel).await });
        tracing::info!(run = %run_id, sequence = sequence_id, "sequence run spawned");
        Ok(run_id)
    }

    /// Hold keep-awake only while the engine is running. A restart whose
    /// rotation failed leaves the engine Idle.
    fn sync_keep_awake(&self) {
        if self.engine.state() != EngineState::Running {
            self.release_keep_awake();
            return;
        }
        if let Err(err) = self.lifecycle.request_foreground_persistence() {
            tracing::warn!(%err, "keep-awake request refused");
        }
    }

    fn release_keep_awake(&self) {
        if let Err(err) = self.lifecycle.release() {
            tracing::warn!(%err, "failed to release keep-awake");
        }
    }

    async fn shutdown(&self) -> TeardownReport {
        self.cancel.cancel();
        self.engine.shut_down(&self.teardown).await
    }
}
