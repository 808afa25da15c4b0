//! # devicepilotd: devicepilot daemon
//!
//! Composition root that wires the adapters together and runs the engine.
//!
//! ## Responsibilities
//! - Parse configuration (env vars, config file)
//! - Initialise logging and attach the status log sink to the event bus
//! - Construct the collaborators (adapters) and the application services
//! - Feed newline-separated commands from stdin into the command queue
//! - Turn SIGINT into a Shutdown command and exit once the process lifecycle
//!   reports termination
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer; no domain logic belongs here.

mod config;
mod sink;

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use devicepilot_adapter_net::NetRequestClient;
use devicepilot_adapter_virtual::{
    PositioningScript, ScriptedUiTree, VirtualPositioning, VirtualProcess, VirtualTunnel,
};
use devicepilot_app::event_bus::EventBus;
use devicepilot_app::services::dispatcher::{
    CommandDispatcher, CommandOutcome, CommandQueue, DispatchError,
};
use devicepilot_app::services::engine::{EngineStateMachine, Subordinates};
use devicepilot_app::services::network_conditioner::NetworkConditioner;
use devicepilot_app::services::positioning_stabilizer::PositioningStabilizer;
use devicepilot_app::services::sequence_runner::SequenceRunner;
use devicepilot_app::services::teardown::TeardownOrchestrator;
use devicepilot_app::services::tunnel_manager::TunnelManager;
use devicepilot_app::services::ui_automation::UiAutomationController;
use devicepilot_domain::engine::EngineCommand;

use crate::config::Config;
use crate::sink::LogSink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.logging.filter)?)
        .init();

    // Event bus
    let bus = Arc::new(EventBus::new(config.engine.event_capacity));
    bus.attach_sink(Arc::new(LogSink));

    // Collaborators
    let conditioner_config = config.conditioner_config()?;
    let client = NetRequestClient::new(conditioner_config.timeouts.connect)?;
    let positioning = Arc::new(VirtualPositioning::new(PositioningScript::default()));
    let ui = match &config.ui.screens {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading UI screens from {}", path.display()))?;
            ScriptedUiTree::from_json(&json).context("parsing UI screens")?
        }
        None => ScriptedUiTree::demo(),
    };
    let process = Arc::new(VirtualProcess::new());
    let termination = process.termination();

    // Services
    let stabilizer = Arc::new(PositioningStabilizer::new(
        positioning,
        Arc::clone(&bus),
        config.stabilizer_config(),
    ));
    let lock_signal = stabilizer.lock_signal();
    let parts = Subordinates {
        tunnel: Arc::new(TunnelManager::new(VirtualTunnel::default())),
        stabilizer,
        conditioner: Arc::new(NetworkConditioner::new(
            Arc::new(client),
            Arc::clone(&bus),
            conditioner_config,
        )),
    };
    let engine = Arc::new(EngineStateMachine::new(
        config.profiles.clone(),
        parts.clone(),
        Arc::clone(&bus),
    ));
    let teardown = TeardownOrchestrator::new(
        parts,
        Arc::clone(&process),
        Arc::clone(&bus),
        config.teardown_config(),
    );
    let runner = SequenceRunner::new(UiAutomationController::new(Arc::new(ui)), Arc::clone(&bus))
        .with_lock_signal(lock_signal);
    let dispatcher = CommandDispatcher::new(engine, teardown, runner, process)
        .with_sequences(config.sequences()?)
        .terminate_on_stop(config.engine.terminate_on_stop);

    let (queue, consumer) = Arc::new(dispatcher).spawn(config.engine.command_capacity);
    tracing::info!(
        profiles = config.profiles.len(),
        sequences = config.sequences.len(),
        "devicepilotd ready"
    );

    if let Some(profile) = config.engine.default_profile.clone() {
        submit(&queue, EngineCommand::Start { profile }).await;
    }
    let reader = spawn_command_reader(queue.clone());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            submit(&queue, EngineCommand::Shutdown).await;
        }
        () = termination.cancelled() => {}
    }

    if let Err(err) = consumer.await {
        tracing::warn!(%err, "command consumer ended abnormally");
    }
    reader.abort();
    tracing::info!("devicepilotd stopped");

    // The stdin reader blocks on a thread that cannot be cancelled, so the
    // runtime would not shut down on its own.
    std::process::exit(0);
}

fn spawn_command_reader(queue: CommandQueue) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%err, "failed to read command");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<EngineCommand>() {
                Ok(command) => {
                    if !submit(&queue, command).await {
                        break;
                    }
                }
                Err(err) => tracing::warn!(%err, line = %line, "ignoring command"),
            }
        }
        tracing::debug!("command reader finished");
    })
}

/// Send `command` and log its outcome. Returns `false` once the queue is closed.
async fn submit(queue: &CommandQueue, command: EngineCommand) -> bool {
    let name = command.name();
    match queue.send(command).await {
        Ok(outcome) => {
            report(name, &outcome);
            true
        }
        Err(DispatchError::Closed) => false,
        Err(err) => {
            tracing::warn!(command = name, %err, "command rejected");
            true
        }
    }
}

fn report(name: &str, outcome: &CommandOutcome) {
    match outcome {
        CommandOutcome::Started(status)
        | CommandOutcome::Restarted(status)
        | CommandOutcome::Status(status) => tracing::info!(
            command = name,
            state = %status.state,
            resolver = status.resolver_label.as_deref().unwrap_or("-"),
            location = ?status.location_state,
            "engine status"
        ),
        CommandOutcome::Stopped => tracing::info!(command = name, "engine stopped"),
        CommandOutcome::SequenceStarted(run) => {
            tracing::info!(command = name, run = %run, "sequence started");
        }
        CommandOutcome::PositioningRetried(retried) => {
            tracing::info!(command = name, retried, "positioning retry");
        }
        CommandOutcome::ShutdownComplete(report) => tracing::info!(
            command = name,
            clean = report.is_clean(),
            stages = report.stages.len(),
            "shutdown complete"
        ),
    }
}
