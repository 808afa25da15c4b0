//! Engine state machine: the single owner of the orchestration lifecycle.
//!
//! Every lifecycle operation holds the transition lock for its whole
//! duration. The lock is a tokio mutex, which is fair: a command arriving
//! mid-transition waits its turn instead of interleaving.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Mutex as AsyncMutex;

use devicepilot_domain::engine::{EngineState, StatusSnapshot};
use devicepilot_domain::error::TunnelError;
use devicepilot_domain::event::StatusPayload;
use devicepilot_domain::tunnel::Profile;

use crate::event_bus::EventBus;
use crate::ports::{
    EventPublisher, PositioningProvider, ProcessLifecycle, RequestClient, TunnelTransport,
};
use crate::services::network_conditioner::NetworkConditioner;
use crate::services::positioning_stabilizer::PositioningStabilizer;
use crate::services::teardown::{TeardownOrchestrator, TeardownReport};
use crate::services::tunnel_manager::TunnelManager;

/// The three subordinates the engine starts and stops.
pub struct Subordinates<T, P, R> {
    pub tunnel: Arc<TunnelManager<T>>,
    pub stabilizer: Arc<PositioningStabilizer<P, Arc<EventBus>>>,
    pub conditioner: Arc<NetworkConditioner<R, Arc<EventBus>>>,
}

impl<T, P, R> Clone for Subordinates<T, P, R> {
    fn clone(&self) -> Self {
        Self {
            tunnel: Arc::clone(&self.tunnel),
            stabilizer: Arc::clone(&self.stabilizer),
            conditioner: Arc::clone(&self.conditioner),
        }
    }
}

#[derive(Default)]
struct Status {
    state: EngineState,
    resolver_label: Option<String>,
}

pub struct EngineStateMachine<T, P, R> {
    profiles: HashMap<String, Profile>,
    parts: Subordinates<T, P, R>,
    bus: Arc<EventBus>,
    transitions: AsyncMutex<()>,
    status: Mutex<Status>,
}

impl<T, P, R> EngineStateMachine<T, P, R>
where
    T: TunnelTransport + 'static,
    P: PositioningProvider + 'static,
    R: RequestClient + 'static,
{
    pub fn new(
        profiles: impl IntoIterator<Item = Profile>,
        parts: Subordinates<T, P, R>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|profile| (profile.name.clone(), profile))
                .collect(),
            parts,
            bus,
            transitions: AsyncMutex::new(()),
            status: Mutex::new(Status::default()),
        }
    }

    /// Bring up the tunnel, then positioning and conditioning.
    ///
    /// Ignored unless the engine is Idle.
    ///
    /// # Errors
    ///
    /// Returns the [`TunnelError`] when the profile is unknown or the
    /// tunnel cannot be opened; the engine is then Idle and nothing else
    /// was started.
    pub async fn start(&self, profile: &str) -> Result<(), TunnelError> {
        let _transition = self.transitions.lock().await;
        self.start_locked(profile).await
    }

    /// Stop subordinates in reverse start order and return to Idle.
    pub async fn stop(&self) {
        let _transition = self.transitions.lock().await;
        self.stop_locked().await;
    }

    /// Soft restart: replace only the tunnel, then bounce the conditioner.
    ///
    /// From Idle this behaves like [`Self::start`]. A rotation failure is
    /// not returned: the engine stops everything and ends Idle.
    ///
    /// # Errors
    ///
    /// Only when starting from Idle, as for [`Self::start`].
    pub async fn restart(&self, profile: &str) -> Result<(), TunnelError> {
        let _transition = self.transitions.lock().await;
        match self.state() {
            EngineState::Idle => return self.start_locked(profile).await,
            EngineState::Running => {}
            state => {
                tracing::debug!(%state, "restart ignored");
                return Ok(());
            }
        }

        let Some(profile) = self.profiles.get(profile) else {
            tracing::warn!(profile, "restart with unknown profile, keeping current tunnel");
            return Ok(());
        };

        let tunnel = &self.parts.tunnel;
        let rotated = async {
            let config = tunnel.select(profile).await?;
            let label = config.resolver_label.clone();
            tunnel.rotate(config).await?;
            Ok::<_, TunnelError>(label)
        }
        .await;

        match rotated {
            Ok(label) => {
                self.parts.conditioner.restart().await;
                tracing::info!(profile = %profile.name, resolver = %label, "tunnel rotated");
                self.set(EngineState::Running, Some(label));
            }
            Err(err) => {
                tracing::warn!(%err, profile = %profile.name, "tunnel rotation failed, stopping engine");
                self.stop_locked().await;
            }
        }
        Ok(())
    }

    /// Run the teardown orchestrator under the transition lock.
    ///
    /// Waits at most the orchestrator's stop timeout for an in-progress
    /// transition; teardown proceeds without the lock after that.
    pub async fn shut_down<L: ProcessLifecycle>(
        &self,
        teardown: &TeardownOrchestrator<T, P, R, L>,
    ) -> TeardownReport {
        let transition =
            tokio::time::timeout(teardown.config().stop_timeout, self.transitions.lock())
                .await
                .ok();
        if transition.is_none() {
            tracing::warn!("lifecycle transition still running, tearing down anyway");
        }
        self.set(EngineState::Stopping, None);
        let report = teardown.run().await;
        self.set(EngineState::Idle, None);
        report
    }

    #[must_use]
    pub fn query(&self) -> StatusSnapshot {
        let status = self.lock_status();
        StatusSnapshot {
            state: status.state,
            resolver_label: status.resolver_label.clone(),
            location_state: self.parts.stabilizer.state(),
        }
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.lock_status().state
    }

    /// Re-subscribe positioning after a terminal error.
    pub fn retry_positioning(&self) -> bool {
        self.parts.stabilizer.retry()
    }

    #[must_use]
    pub fn subordinates(&self) -> &Subordinates<T, P, R> {
        &self.parts
    }

    #[must_use]
    pub fn has_profile(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    async fn start_locked(&self, name: &str) -> Result<(), TunnelError> {
        let state = self.state();
        if state != EngineState::Idle {
            tracing::debug!(%state, profile = name, "start ignored");
            return Ok(());
        }
        self.set(EngineState::Starting, None);

        match self.open_tunnel(name).await {
            Ok(label) => {
                self.parts.stabilizer.start();
                self.parts.conditioner.start();
                tracing::info!(profile = name, resolver = %label, "engine running");
                self.set(EngineState::Running, Some(label));
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%err, profile = name, "engine start failed");
                self.set(EngineState::Idle, None);
                Err(err)
            }
        }
    }

    async fn open_tunnel(&self, name: &str) -> Result<String, TunnelError> {
        let profile = self
            .profiles
            .get(name)
            .ok_or_else(|| TunnelError::UnknownProfile(name.to_string()))?;
        let config = self.parts.tunnel.select(profile).await?;
        let label = config.resolver_label.clone();
        self.parts.tunnel.establish(config).await?;
        Ok(label)
    }

    async fn stop_locked(&self) {
        let state = self.state();
        if state == EngineState::Idle {
            tracing::debug!("stop ignored, engine idle");
            return;
        }
        let label = self.lock_status().resolver_label.clone();
        self.set(EngineState::Stopping, label);

        self.parts.conditioner.stop().await;
        self.parts.stabilizer.stop();
        if let Err(err) = self.parts.tunnel.teardown().await {
            tracing::warn!(%err, "tunnel teardown failed during stop");
        }

        tracing::info!("engine stopped");
        self.set(EngineState::Idle, None);
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the new status and publish it (outside the status lock).
    fn set(&self, state: EngineState, resolver_label: Option<String>) {
        {
            let mut status = self.lock_status();
            status.state = state;
            status.resolver_label.clone_from(&resolver_label);
        }
        self.bus.emit(StatusPayload::EngineStatusChanged {
            state,
            resolver_label,
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::services::network_conditioner::tests::{FakeClient, test_config};
    use crate::services::positioning_stabilizer::StabilizerConfig;
    use crate::services::positioning_stabilizer::tests::{ChannelProvider, record};
    use crate::services::tunnel_manager::tests::{CountingTransport, profile};
    use devicepilot_domain::event::StatusEvent;
    use devicepilot_domain::location::LocationState;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    pub(crate) type TestEngine =
        EngineStateMachine<Arc<CountingTransport>, ChannelProvider, FakeClient>;

    pub(crate) struct Harness {
        pub engine: Arc<TestEngine>,
        pub transport: Arc<CountingTransport>,
        pub provider: Arc<ChannelProvider>,
        pub client: Arc<FakeClient>,
        pub bus: Arc<EventBus>,
    }

    pub(crate) fn harness() -> Harness {
        harness_with_client(FakeClient::default())
    }

    fn harness_with_client(client: FakeClient) -> Harness {
        let bus = Arc::new(EventBus::new(256));
        let transport = Arc::new(CountingTransport::default());
        let provider = Arc::new(ChannelProvider::new());
        let client = Arc::new(client);
        let parts = Subordinates {
            tunnel: Arc::new(TunnelManager::with_rng(
                Arc::clone(&transport),
                StdRng::seed_from_u64(11),
            )),
            stabilizer: Arc::new(PositioningStabilizer::new(
                Arc::clone(&provider),
                Arc::clone(&bus),
                StabilizerConfig::default(),
            )),
            conditioner: Arc::new(NetworkConditioner::new(
                Arc::clone(&client),
                Arc::clone(&bus),
                test_config(&["a", "b", "c"]),
            )),
        };
        let engine = Arc::new(EngineStateMachine::new(
            [profile()],
            parts,
            Arc::clone(&bus),
        ));
        Harness {
            engine,
            transport,
            provider,
            client,
            bus,
        }
    }

    fn engine_states(events: &Mutex<Vec<StatusEvent>>) -> Vec<EngineState> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e.payload {
                StatusPayload::EngineStatusChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn should_stay_idle_when_tunnel_open_fails() {
        let h = harness();
        h.transport.fail_open.store(true, Ordering::SeqCst);

        let result = h.engine.start("home").await;

        assert!(matches!(result, Err(TunnelError::PermissionDenied)));
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert!(!h.engine.subordinates().stabilizer.is_subscribed());
        assert!(!h.engine.subordinates().conditioner.is_running());
        assert_eq!(h.provider.subscriptions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn should_reject_unknown_profile() {
        let h = harness();

        let result = h.engine.start("office").await;

        assert!(matches!(result, Err(TunnelError::UnknownProfile(name)) if name == "office"));
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn should_run_all_subordinates_after_start() {
        let h = harness();
        let events = record(&h.bus);

        h.engine.start("home").await.unwrap();

        let snapshot = h.engine.query();
        assert_eq!(snapshot.state, EngineState::Running);
        assert!(snapshot.resolver_label.is_some());
        assert_eq!(snapshot.location_state, LocationState::Stabilizing);
        assert!(h.engine.subordinates().conditioner.is_running());
        assert_eq!(
            engine_states(&events),
            vec![EngineState::Starting, EngineState::Running]
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!h.client.log.lock().unwrap().is_empty());
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn should_release_everything_on_stop() {
        let h = harness();
        let events = record(&h.bus);
        h.engine.start("home").await.unwrap();

        h.engine.stop().await;

        assert_eq!(h.engine.state(), EngineState::Idle);
        assert_eq!(h.transport.open_now.load(Ordering::SeqCst), 0);
        assert_eq!(h.provider.unsubscriptions.load(Ordering::SeqCst), 1);
        assert!(!h.engine.subordinates().conditioner.is_running());
        assert_eq!(h.engine.query().resolver_label, None);
        assert_eq!(engine_states(&events).last(), Some(&EngineState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn should_wait_for_in_flight_attempt_when_stopping() {
        let h = harness_with_client(FakeClient::with_latency(Duration::from_secs(5)));
        h.engine.start("home").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.client.stream_requests().len(), 1);

        let began = tokio::time::Instant::now();
        h.engine.stop().await;

        assert!(began.elapsed() >= Duration::from_secs(4));
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert_eq!(h.transport.open_now.load(Ordering::SeqCst), 0);
        assert_eq!(h.provider.unsubscriptions.load(Ordering::SeqCst), 1);
        assert!(!h.engine.subordinates().conditioner.is_running());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.client.stream_requests().len(), 1);
    }

    #[tokio::test]
    async fn should_ignore_stop_when_idle() {
        let h = harness();
        let events = record(&h.bus);

        h.engine.stop().await;

        assert!(engine_states(&events).is_empty());
    }

    #[tokio::test]
    async fn should_rotate_to_other_resolver_on_restart() {
        let h = harness();
        h.engine.start("home").await.unwrap();
        let before = h.engine.query().resolver_label;

        h.engine.restart("home").await.unwrap();

        let after = h.engine.query();
        assert_eq!(after.state, EngineState::Running);
        assert_ne!(after.resolver_label, before);
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 2);
        assert_eq!(h.transport.open_now.load(Ordering::SeqCst), 1);
        assert_eq!(h.provider.subscriptions.load(Ordering::SeqCst), 1);
        assert!(h.engine.subordinates().conditioner.is_running());
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn should_stop_when_rotation_fails() {
        let h = harness();
        h.engine.start("home").await.unwrap();
        h.transport.fail_open.store(true, Ordering::SeqCst);

        let result = h.engine.restart("home").await;

        assert!(result.is_ok());
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert_eq!(h.transport.open_now.load(Ordering::SeqCst), 0);
        assert!(!h.engine.subordinates().conditioner.is_running());
        assert!(!h.engine.subordinates().stabilizer.is_subscribed());
    }

    #[tokio::test]
    async fn should_start_when_restarting_from_idle() {
        let h = harness();

        h.engine.restart("home").await.unwrap();

        assert_eq!(h.engine.state(), EngineState::Running);
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn should_retry_positioning_after_permission_loss() {
        let h = harness();
        h.engine.start("home").await.unwrap();
        h.provider.push(devicepilot_domain::location::ProviderUpdate::Failed(
            devicepilot_domain::error::PositioningError::PermissionDenied,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.engine.query().location_state, LocationState::Error);

        assert!(h.engine.retry_positioning());
        assert_eq!(h.engine.query().location_state, LocationState::Stabilizing);
        h.engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn should_never_hold_two_tunnels_under_concurrent_commands() {
        let h = harness();
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..24 {
            let engine = Arc::clone(&h.engine);
            tasks.spawn(async move {
                match i % 3 {
                    0 => {
                        let _ = engine.start("home").await;
                    }
                    1 => engine.stop().await,
                    _ => {
                        let _ = engine.restart("home").await;
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        h.engine.stop().await;

        assert_eq!(h.transport.peak.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.open_now.load(Ordering::SeqCst), 0);
        assert_eq!(h.engine.state(), EngineState::Idle);
    }
}
