//! End-to-end scenarios for the full devicepilot stack.
//!
//! Each test wires the real services to the virtual collaborators and drives
//! them through the command queue, exactly like the daemon does. Requests
//! never leave the process: the conditioner talks to a counting client.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use devicepilot_adapter_virtual::{
    ScriptedUiTree, VirtualPositioning, VirtualProcess, VirtualTunnel,
};
use devicepilot_app::event_bus::EventBus;
use devicepilot_app::ports::RequestClient;
use devicepilot_app::services::dispatcher::{
    CommandDispatcher, CommandOutcome, CommandQueue, DispatchError,
};
use devicepilot_app::services::engine::{EngineStateMachine, Subordinates};
use devicepilot_app::services::network_conditioner::{
    ConditionerConfig, NetworkConditioner, WarmupConfig,
};
use devicepilot_app::services::positioning_stabilizer::{PositioningStabilizer, StabilizerConfig};
use devicepilot_app::services::sequence_runner::{SequenceReport, SequenceRunner};
use devicepilot_app::services::teardown::{TeardownConfig, TeardownOrchestrator};
use devicepilot_app::services::tunnel_manager::TunnelManager;
use devicepilot_app::services::ui_automation::UiAutomationController;
use devicepilot_domain::automation::{AutomationStep, Precondition, Sequence, SequenceStep};
use devicepilot_domain::conditioning::{Request, Response, TimeoutPolicy};
use devicepilot_domain::engine::{EngineCommand, EngineState, StatusSnapshot};
use devicepilot_domain::error::{ConditioningError, DevicePilotError, TunnelError};
use devicepilot_domain::event::{StatusEvent, Topic};
use devicepilot_domain::location::LocationState;
use devicepilot_domain::tunnel::{Profile, ResolverCandidate};

#[derive(Default)]
struct CountingClient {
    requests: AtomicUsize,
}

impl RequestClient for CountingClient {
    async fn issue(
        &self,
        _request: &Request,
        _timeouts: TimeoutPolicy,
    ) -> Result<Response, ConditioningError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(Response { status: Some(204) })
    }
}

type Dispatcher = CommandDispatcher<
    Arc<VirtualTunnel>,
    VirtualPositioning,
    CountingClient,
    ScriptedUiTree,
    VirtualProcess,
>;

struct Stack {
    bus: Arc<EventBus>,
    tunnel: Arc<VirtualTunnel>,
    positioning: Arc<VirtualPositioning>,
    ui: Arc<ScriptedUiTree>,
    process: Arc<VirtualProcess>,
    client: Arc<CountingClient>,
    dispatcher: Arc<Dispatcher>,
    queue: CommandQueue,
    consumer: JoinHandle<()>,
}

fn profile() -> Profile {
    let candidate = |label: &str, address: &str| ResolverCandidate {
        label: label.to_string(),
        addresses: vec![address.parse().unwrap()],
    };
    Profile {
        name: "home".to_string(),
        resolvers: vec![
            candidate("alpha", "10.0.0.1"),
            candidate("bravo", "10.0.0.2"),
        ],
    }
}

fn consent_sequence() -> Sequence {
    Sequence::builder()
        .id("consent")
        .step(
            SequenceStep::new(AutomationStep::new("allow", ["While using the app"]))
                .confirm_with(AutomationStep::new("accuracy", ["Turn on"])),
        )
        .step(
            SequenceStep::new(AutomationStep::new("open-map", ["map view"])).precondition(
                Precondition::LocationLocked {
                    timeout: Duration::from_secs(30),
                },
            ),
        )
        .build()
        .unwrap()
}

/// Build the fully-wired stack on virtual collaborators.
fn stack() -> Stack {
    let bus = Arc::new(EventBus::new(256));
    let tunnel = Arc::new(VirtualTunnel::default());
    let positioning = Arc::new(VirtualPositioning::default());
    let ui = Arc::new(ScriptedUiTree::demo());
    let process = Arc::new(VirtualProcess::new());
    let client = Arc::new(CountingClient::default());

    let stabilizer = Arc::new(PositioningStabilizer::new(
        Arc::clone(&positioning),
        Arc::clone(&bus),
        StabilizerConfig::default(),
    ));
    let lock_signal = stabilizer.lock_signal();
    let conditioner_config = ConditionerConfig {
        warmup: WarmupConfig {
            endpoints: Vec::new(),
            ..WarmupConfig::default()
        },
        ..ConditionerConfig::default()
    };
    let parts = Subordinates {
        tunnel: Arc::new(TunnelManager::new(Arc::clone(&tunnel))),
        stabilizer,
        conditioner: Arc::new(NetworkConditioner::new(
            Arc::clone(&client),
            Arc::clone(&bus),
            conditioner_config,
        )),
    };
    let engine = Arc::new(EngineStateMachine::new(
        [profile()],
        parts.clone(),
        Arc::clone(&bus),
    ));
    let teardown = TeardownOrchestrator::new(
        parts,
        Arc::clone(&process),
        Arc::clone(&bus),
        TeardownConfig::default(),
    );
    let runner = SequenceRunner::new(
        UiAutomationController::new(Arc::clone(&ui)),
        Arc::clone(&bus),
    )
    .with_lock_signal(lock_signal);
    let dispatcher = Arc::new(
        CommandDispatcher::new(engine, teardown, runner, Arc::clone(&process))
            .with_sequences([consent_sequence()]),
    );
    let (queue, consumer) = Arc::clone(&dispatcher).spawn(16);

    Stack {
        bus,
        tunnel,
        positioning,
        ui,
        process,
        client,
        dispatcher,
        queue,
        consumer,
    }
}

fn start() -> EngineCommand {
    EngineCommand::Start {
        profile: "home".to_string(),
    }
}

async fn status(queue: &CommandQueue) -> StatusSnapshot {
    match queue.send(EngineCommand::QueryStatus).await.unwrap() {
        CommandOutcome::Status(snapshot) => snapshot,
        other => panic!("expected a status, got {other:?}"),
    }
}

async fn next_of(events: &mut broadcast::Receiver<StatusEvent>, topic: Topic) -> StatusEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event.topic() == topic => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(60), wait)
        .await
        .unwrap_or_else(|_| panic!("no {topic:?} event within a minute"))
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn should_stay_idle_when_tunnel_cannot_open() {
    let stack = stack();
    stack.tunnel.set_available(false);

    let result = stack.queue.send(start()).await;

    assert!(matches!(
        result,
        Err(DispatchError::Command(DevicePilotError::Tunnel(
            TunnelError::Unavailable
        )))
    ));
    let snapshot = status(&stack.queue).await;
    assert_eq!(snapshot.state, EngineState::Idle);
    assert_eq!(snapshot.resolver_label, None);
    assert_eq!(stack.positioning.active_subscriptions(), 0);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(stack.client.requests.load(Ordering::SeqCst), 0);
    assert!(!stack.process.is_awake());
}

#[tokio::test(start_paused = true)]
async fn should_reject_unknown_profile() {
    let stack = stack();

    let result = stack
        .queue
        .send(EngineCommand::Start {
            profile: "office".to_string(),
        })
        .await;

    assert!(matches!(
        result,
        Err(DispatchError::Command(DevicePilotError::Tunnel(
            TunnelError::UnknownProfile(_)
        )))
    ));
    assert_eq!(stack.tunnel.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn should_lock_position_after_start() {
    let stack = stack();
    let mut locks = stack.bus.listen();
    let mut cycles = stack.bus.listen();

    let outcome = stack.queue.send(start()).await.unwrap();

    let CommandOutcome::Started(snapshot) = outcome else {
        panic!("expected Started, got {outcome:?}");
    };
    assert_eq!(snapshot.state, EngineState::Running);
    assert!(snapshot.resolver_label.is_some());
    assert!(stack.tunnel.is_open());
    assert!(stack.process.is_awake());

    next_of(&mut locks, Topic::LockAchieved).await;
    assert_eq!(status(&stack.queue).await.location_state, LocationState::Locked);
    next_of(&mut cycles, Topic::ConditioningCycle).await;
    assert!(stack.client.requests.load(Ordering::SeqCst) > 0);
}

// ---------------------------------------------------------------------------
// Restart and stop
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn should_rotate_resolver_on_restart() {
    let stack = stack();
    stack.queue.send(start()).await.unwrap();
    let before = status(&stack.queue).await.resolver_label.unwrap();

    let outcome = stack
        .queue
        .send(EngineCommand::Restart {
            profile: "home".to_string(),
        })
        .await
        .unwrap();

    let CommandOutcome::Restarted(snapshot) = outcome else {
        panic!("expected Restarted, got {outcome:?}");
    };
    assert_eq!(snapshot.state, EngineState::Running);
    assert_ne!(snapshot.resolver_label.as_deref(), Some(before.as_str()));
    assert_eq!(stack.tunnel.opens(), 2);
    assert_eq!(
        stack.tunnel.active_config().map(|c| c.resolver_label),
        snapshot.resolver_label
    );
}

#[tokio::test(start_paused = true)]
async fn should_release_everything_on_stop() {
    let stack = stack();
    stack.queue.send(start()).await.unwrap();

    let outcome = stack.queue.send(EngineCommand::Stop).await.unwrap();

    assert!(matches!(outcome, CommandOutcome::Stopped));
    assert!(!stack.tunnel.is_open());
    assert_eq!(stack.positioning.active_subscriptions(), 0);
    assert!(!stack.process.is_awake());
    let snapshot = status(&stack.queue).await;
    assert_eq!(snapshot.state, EngineState::Idle);
    assert_eq!(snapshot.location_state, LocationState::Idle);

    let requests = stack.client.requests.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(stack.client.requests.load(Ordering::SeqCst), requests);
}

// ---------------------------------------------------------------------------
// Sequences
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn should_run_consent_sequence_once_position_is_locked() {
    let stack = stack();
    stack.queue.send(start()).await.unwrap();

    let outcome = stack
        .queue
        .send(EngineCommand::RunSequence {
            sequence_id: "consent".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, CommandOutcome::SequenceStarted(_)));

    let reports: Vec<SequenceReport> = stack.dispatcher.join_sequences().await;

    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_complete(), "{:?}", reports[0]);
    assert_eq!(reports[0].outcomes.len(), 3);
    assert_eq!(stack.ui.activations().len(), 3);
    assert_eq!(stack.ui.current_screen(), 2);
}

#[tokio::test(start_paused = true)]
async fn should_report_unknown_sequence() {
    let stack = stack();

    let result = stack
        .queue
        .send(EngineCommand::RunSequence {
            sequence_id: "missing".to_string(),
        })
        .await;

    assert!(matches!(
        result,
        Err(DispatchError::Command(DevicePilotError::Automation(_)))
    ));
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn should_reach_terminate_stage_on_shutdown() {
    let stack = stack();
    let mut events = stack.bus.listen();
    stack.queue.send(start()).await.unwrap();

    let outcome = stack.queue.send(EngineCommand::Shutdown).await.unwrap();

    let CommandOutcome::ShutdownComplete(report) = outcome else {
        panic!("expected ShutdownComplete, got {outcome:?}");
    };
    assert!(report.reached_final_stage());
    assert!(report.is_clean(), "{report:?}");
    assert!(stack.process.is_terminated());
    assert!(!stack.process.is_listed());
    assert!(!stack.process.is_awake());
    assert!(!stack.tunnel.is_open());

    let mut stages = Vec::new();
    while stages.len() < 5 {
        let event = next_of(&mut events, Topic::Teardown).await;
        stages.push(event);
    }
    assert_eq!(stages.len(), 5);

    stack.consumer.await.unwrap();
    assert!(matches!(
        stack.queue.send(EngineCommand::QueryStatus).await,
        Err(DispatchError::Closed)
    ));
}
