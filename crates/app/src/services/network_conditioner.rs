//! Network conditioner: a cancellable loop of synthetic requests.
//!
//! Each cycle optionally sends a datagram probe, picks the next target
//! round-robin, issues one request (with a bounded number of attempts) and
//! sleeps for a delay chosen by [`SchedulePolicy`]. Cancellation is only
//! observed between cycles; an in-flight attempt runs to its own timeout.
//!
//! A one-time warm-up runs beside the first loop and never blocks it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use devicepilot_domain::conditioning::{
    ConditioningCycleResult, ConditioningTarget, Request, RequestMethod, SchedulePolicy,
    TargetCategory, TimeoutPolicy,
};
use devicepilot_domain::error::{ConditioningError, ValidationError};
use devicepilot_domain::event::StatusPayload;

use crate::ports::{EventPublisher, RequestClient};

/// Endpoints probed once when the conditioner first starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupConfig {
    pub endpoints: Vec<String>,
    /// Pause between consecutive endpoints.
    pub stagger: Duration,
    pub attempts: u32,
    /// Pause between attempts against the same endpoint.
    pub pause: Duration,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                "https://connectivitycheck.gstatic.com/generate_204".to_string(),
                "https://www.msftconnecttest.com/connecttest.txt".to_string(),
                "https://captive.apple.com/hotspot-detect.html".to_string(),
            ],
            stagger: Duration::from_millis(750),
            attempts: 2,
            pause: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionerConfig {
    pub targets: Vec<ConditioningTarget>,
    pub schedule: SchedulePolicy,
    pub timeouts: TimeoutPolicy,
    /// Attempts per cycle; values below 1 are treated as 1.
    pub max_attempts: u32,
    pub attempt_pause: Duration,
    /// `host:port` receiving the periodic datagram probe.
    pub probe_address: String,
    pub probe_payload: Vec<u8>,
    pub warmup: WarmupConfig,
}

impl Default for ConditionerConfig {
    fn default() -> Self {
        let target = |address: &str, category| ConditioningTarget {
            address: address.to_string(),
            category,
        };
        Self {
            targets: vec![
                target(
                    "https://connectivitycheck.gstatic.com/generate_204",
                    TargetCategory::Connectivity,
                ),
                target("https://www.google.com/", TargetCategory::Search),
                target("https://www.youtube.com/", TargetCategory::Media),
                target("https://www.wikipedia.org/", TargetCategory::Search),
                target("https://www.reddit.com/", TargetCategory::Social),
                target("https://www.amazon.com/", TargetCategory::Commerce),
            ],
            schedule: SchedulePolicy::default(),
            timeouts: TimeoutPolicy::default(),
            max_attempts: 2,
            attempt_pause: Duration::from_secs(2),
            probe_address: "1.1.1.1:53".to_string(),
            probe_payload: vec![0],
            warmup: WarmupConfig::default(),
        }
    }
}

impl ConditionerConfig {
    /// # Errors
    ///
    /// Returns [`ValidationError::NoTargets`] when the target list is empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.targets.is_empty() {
            return Err(ValidationError::NoTargets);
        }
        Ok(())
    }
}

/// Counters that survive restarts of the loop.
#[derive(Default)]
struct Progress {
    cycle: AtomicU64,
    consecutive_failures: AtomicU32,
    warmed_up: AtomicBool,
}

struct Running {
    token: CancellationToken,
    main: JoinHandle<()>,
    warmup: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Tasks {
    running: Option<Running>,
    /// Tasks whose graceful stop is still being awaited.
    stopping: Vec<AbortHandle>,
}

/// Runs the synthetic-traffic loop. At most one loop exists per instance.
pub struct NetworkConditioner<R, E> {
    client: Arc<R>,
    publisher: E,
    config: Arc<ConditionerConfig>,
    progress: Arc<Progress>,
    tasks: Mutex<Tasks>,
}

impl<R, E> NetworkConditioner<R, E>
where
    R: RequestClient + 'static,
    E: EventPublisher + Clone + Send + Sync + 'static,
{
    pub fn new(client: Arc<R>, publisher: E, config: ConditionerConfig) -> Self {
        Self {
            client,
            publisher,
            config: Arc::new(config),
            progress: Arc::new(Progress::default()),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the loop (and, the first time, the warm-up). No-op when running.
    pub fn start(&self) {
        let mut tasks = self.lock();
        if tasks.running.as_ref().is_some_and(|r| !r.main.is_finished()) {
            return;
        }
        if self.config.targets.is_empty() {
            tracing::warn!("network conditioner has no targets, not starting");
            return;
        }

        let token = CancellationToken::new();
        let warmup = if self.progress.warmed_up.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(tokio::spawn(warm_up(
                Arc::clone(&self.client),
                Arc::clone(&self.config),
                token.clone(),
            )))
        };
        let main = tokio::spawn(run_cycles(
            Arc::clone(&self.client),
            self.publisher.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.progress),
            token.clone(),
        ));
        tasks.running = Some(Running {
            token,
            main,
            warmup,
        });
        tracing::info!(
            targets = self.config.targets.len(),
            "network conditioner started"
        );
    }

    /// Cancel cooperatively and wait for the loop to reach a cycle boundary.
    pub async fn stop(&self) {
        let running = {
            let mut tasks = self.lock();
            let Some(running) = tasks.running.take() else {
                return;
            };
            tasks.stopping.push(running.main.abort_handle());
            if let Some(warmup) = &running.warmup {
                tasks.stopping.push(warmup.abort_handle());
            }
            running
        };

        running.token.cancel();
        if let Err(err) = running.main.await {
            if !err.is_cancelled() {
                tracing::warn!(%err, "conditioning loop ended abnormally");
            }
        }
        if let Some(warmup) = running.warmup {
            if let Err(err) = warmup.await {
                if !err.is_cancelled() {
                    tracing::warn!(%err, "warm-up ended abnormally");
                }
            }
        }
        self.lock().stopping.retain(|handle| !handle.is_finished());
        tracing::info!("network conditioner stopped");
    }

    /// Abort the loop, the warm-up and any task a graceful stop is still
    /// waiting on. Idempotent.
    pub fn force_stop(&self) {
        let mut tasks = self.lock();
        if let Some(running) = tasks.running.take() {
            running.token.cancel();
            running.main.abort();
            if let Some(warmup) = running.warmup {
                warmup.abort();
            }
        }
        for handle in tasks.stopping.drain(..) {
            handle.abort();
        }
    }

    /// Stop, then start again so the next cycle uses the current network path.
    pub async fn restart(&self) {
        self.stop().await;
        self.start();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock()
            .running
            .as_ref()
            .is_some_and(|r| !r.main.is_finished())
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.progress.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Number of cycles begun since construction.
    #[must_use]
    pub fn cycles_started(&self) -> u64 {
        self.progress.cycle.load(Ordering::SeqCst)
    }
}

async fn run_cycles<R, E>(
    client: Arc<R>,
    publisher: E,
    config: Arc<ConditionerConfig>,
    progress: Arc<Progress>,
    token: CancellationToken,
) where
    R: RequestClient,
    E: EventPublisher,
{
    while !token.is_cancelled() {
        let cycle = progress.cycle.fetch_add(1, Ordering::SeqCst);
        let result = run_cycle(client.as_ref(), &config, cycle).await;

        let failures = if result.success {
            progress.consecutive_failures.store(0, Ordering::SeqCst);
            0
        } else {
            progress.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
        };
        if result.success {
            tracing::debug!(
                cycle,
                target = %result.target.address,
                method = %result.method,
                attempts = result.attempt_count,
                "conditioning cycle succeeded"
            );
        } else {
            tracing::warn!(
                cycle,
                target = %result.target.address,
                method = %result.method,
                attempts = result.attempt_count,
                code = ?result.code,
                consecutive_failures = failures,
                "conditioning cycle failed"
            );
        }

        publisher.emit(StatusPayload::ConditioningCycleCompleted {
            target: result.target.address.clone(),
            success: result.success,
            attempts: result.attempt_count,
        });

        let delay = config.schedule.next_delay(cycle, result.success, failures);
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
    tracing::debug!("conditioning loop exited at cycle boundary");
}

async fn run_cycle<R: RequestClient>(
    client: &R,
    config: &ConditionerConfig,
    cycle: u64,
) -> ConditioningCycleResult {
    if config.schedule.is_probe_cycle(cycle) {
        send_probe(client, config).await;
    }

    let index = config.schedule.target_index(cycle, config.targets.len());
    let target = config.targets[index].clone();
    let method = config.schedule.method_for(cycle, target.category);
    let request = Request::Stream {
        address: target.address.clone(),
        method,
    };

    let max_attempts = config.max_attempts.max(1);
    let mut attempt_count = 0;
    let mut success = false;
    let mut code = None;
    while attempt_count < max_attempts {
        if attempt_count > 0 {
            tokio::time::sleep(config.attempt_pause).await;
        }
        attempt_count += 1;
        match client.issue(&request, config.timeouts).await {
            Ok(response) => {
                code = response.status;
                if response.is_success() {
                    success = true;
                    break;
                }
                tracing::debug!(cycle, attempt = attempt_count, status = ?response.status, "attempt rejected");
            }
            Err(err) => {
                if let ConditioningError::Status(status) = &err {
                    code = Some(*status);
                }
                tracing::debug!(cycle, attempt = attempt_count, %err, "attempt failed");
            }
        }
    }

    ConditioningCycleResult {
        cycle,
        target,
        method,
        success,
        attempt_count,
        code,
    }
}

async fn send_probe<R: RequestClient>(client: &R, config: &ConditionerConfig) {
    let probe = Request::Datagram {
        address: config.probe_address.clone(),
        payload: config.probe_payload.clone(),
    };
    if let Err(err) = client.issue(&probe, config.timeouts).await {
        tracing::debug!(address = %config.probe_address, %err, "datagram probe failed");
    }
}

async fn warm_up<R: RequestClient>(
    client: Arc<R>,
    config: Arc<ConditionerConfig>,
    token: CancellationToken,
) {
    let warmup = &config.warmup;
    let attempts = warmup.attempts.max(1);
    for (index, endpoint) in warmup.endpoints.iter().enumerate() {
        if index > 0 {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(warmup.stagger) => {}
            }
        }
        let request = Request::Stream {
            address: endpoint.clone(),
            method: RequestMethod::Head,
        };
        for attempt in 1..=attempts {
            match client.issue(&request, config.timeouts).await {
                Ok(response) if response.is_success() => {
                    tracing::debug!(%endpoint, attempt, "warm-up probe succeeded");
                    break;
                }
                Ok(response) => {
                    tracing::warn!(%endpoint, attempt, status = ?response.status, "warm-up probe rejected");
                }
                Err(err) => tracing::warn!(%endpoint, attempt, %err, "warm-up probe failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(warmup.pause).await;
            }
        }
    }
    tracing::debug!(endpoints = warmup.endpoints.len(), "warm-up finished");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use devicepilot_domain::conditioning::Response;
    use std::collections::{HashSet, VecDeque};
    use tokio::time::Instant;

    /// Records every request; statuses are scripted per stream request.
    #[derive(Default)]
    pub(crate) struct FakeClient {
        pub log: Mutex<Vec<(Instant, Request)>>,
        pub statuses: Mutex<VecDeque<u16>>,
        pub failing: Mutex<HashSet<String>>,
        pub latency: Duration,
    }

    impl FakeClient {
        pub(crate) fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                ..Self::default()
            }
        }

        pub(crate) fn script(&self, statuses: &[u16]) {
            self.statuses.lock().unwrap().extend(statuses);
        }

        pub(crate) fn stream_requests(&self) -> Vec<(Instant, String)> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(at, request)| match request {
                    Request::Stream { address, .. } => Some((*at, address.clone())),
                    Request::Datagram { .. } => None,
                })
                .collect()
        }

        pub(crate) fn kinds(&self) -> Vec<char> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .map(|(_, request)| match request {
                    Request::Stream { .. } => 'S',
                    Request::Datagram { .. } => 'D',
                })
                .collect()
        }
    }

    impl RequestClient for FakeClient {
        async fn issue(
            &self,
            request: &Request,
            _timeouts: TimeoutPolicy,
        ) -> Result<Response, ConditioningError> {
            self.log
                .lock()
                .unwrap()
                .push((Instant::now(), request.clone()));
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            match request {
                Request::Datagram { .. } => Ok(Response { status: None }),
                Request::Stream { address, .. } => {
                    if self.failing.lock().unwrap().contains(address) {
                        return Err(ConditioningError::Transport("connection refused".into()));
                    }
                    let status = self.statuses.lock().unwrap().pop_front().unwrap_or(200);
                    Ok(Response {
                        status: Some(status),
                    })
                }
            }
        }
    }

    pub(crate) fn test_config(targets: &[&str]) -> ConditionerConfig {
        ConditionerConfig {
            targets: targets
                .iter()
                .map(|address| ConditioningTarget {
                    address: (*address).to_string(),
                    category: TargetCategory::Search,
                })
                .collect(),
            schedule: SchedulePolicy::default()
                .with_healthy_delays(&[Duration::from_secs(1); 6])
                .unwrap(),
            max_attempts: 1,
            attempt_pause: Duration::from_millis(100),
            warmup: WarmupConfig {
                endpoints: Vec::new(),
                ..WarmupConfig::default()
            },
            ..ConditionerConfig::default()
        }
    }

    fn conditioner(
        client: &Arc<FakeClient>,
        config: ConditionerConfig,
    ) -> NetworkConditioner<FakeClient, Arc<EventBus>> {
        NetworkConditioner::new(Arc::clone(client), Arc::new(EventBus::new(64)), config)
    }

    #[tokio::test(start_paused = true)]
    async fn should_visit_every_target_once_per_round() {
        let client = Arc::new(FakeClient::default());
        let targets = ["a", "b", "c", "d"];
        let conditioner = conditioner(&client, test_config(&targets));

        conditioner.start();
        tokio::time::sleep(Duration::from_millis(7500)).await;
        conditioner.stop().await;

        let visited: Vec<String> = client
            .stream_requests()
            .into_iter()
            .map(|(_, a)| a)
            .collect();
        assert!(visited.len() >= 8);
        for round in visited.chunks(targets.len()).take(2) {
            assert_eq!(round, targets);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn should_apply_backoff_ceiling_after_three_failures() {
        let client = Arc::new(FakeClient::default());
        client.script(&[500, 500, 500, 200]);
        let mut config = test_config(&["t"]);
        config.schedule = SchedulePolicy::default();
        let conditioner = conditioner(&client, config);

        conditioner.start();
        tokio::time::sleep(Duration::from_secs(400)).await;
        conditioner.stop().await;

        let starts: Vec<Instant> = client
            .stream_requests()
            .into_iter()
            .map(|(at, _)| at)
            .collect();
        let gaps: Vec<Duration> = starts.windows(2).map(|w| w[1] - w[0]).collect();
        let expected = [20, 20, 300, 50].map(Duration::from_secs);
        assert!(gaps.len() >= expected.len());
        for (gap, want) in gaps.iter().zip(expected) {
            assert!(*gap >= want && *gap < want + Duration::from_millis(10));
        }
        assert_eq!(conditioner.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_keep_ceiling_while_failures_continue() {
        let client = Arc::new(FakeClient::default());
        client.failing.lock().unwrap().insert("t".to_string());
        let mut config = test_config(&["t"]);
        config.schedule = SchedulePolicy::default();
        let conditioner = conditioner(&client, config);

        conditioner.start();
        tokio::time::sleep(Duration::from_secs(1000)).await;
        conditioner.stop().await;

        let starts: Vec<Instant> = client
            .stream_requests()
            .into_iter()
            .map(|(at, _)| at)
            .collect();
        let gaps: Vec<Duration> = starts.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.len() >= 4);
        assert!(gaps[2..].iter().all(|g| *g >= Duration::from_secs(300)));
        assert!(conditioner.consecutive_failures() >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn should_send_datagram_probe_every_third_cycle() {
        let client = Arc::new(FakeClient::default());
        let conditioner = conditioner(&client, test_config(&["a", "b"]));

        conditioner.start();
        tokio::time::sleep(Duration::from_millis(5500)).await;
        conditioner.stop().await;

        let kinds: String = client.kinds().into_iter().collect();
        assert!(kinds.starts_with("SSDSSSDS"), "got {kinds}");
    }

    #[tokio::test(start_paused = true)]
    async fn should_retry_within_cycle_and_reset_failures() {
        let client = Arc::new(FakeClient::default());
        client.script(&[503, 200]);
        let mut config = test_config(&["t"]);
        config.max_attempts = 2;
        let bus = Arc::new(EventBus::new(16));
        let events = crate::services::positioning_stabilizer::tests::record(&bus);
        let conditioner = NetworkConditioner::new(Arc::clone(&client), bus, config);

        conditioner.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        conditioner.stop().await;

        let first = events.lock().unwrap()[0].payload.clone();
        assert_eq!(
            first,
            StatusPayload::ConditioningCycleCompleted {
                target: "t".to_string(),
                success: true,
                attempts: 2,
            }
        );
        assert_eq!(conditioner.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_let_in_flight_attempt_finish_on_stop() {
        let client = Arc::new(FakeClient::with_latency(Duration::from_secs(5)));
        let conditioner = conditioner(&client, test_config(&["t"]));

        conditioner.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let began = Instant::now();
        conditioner.stop().await;

        assert!(began.elapsed() >= Duration::from_secs(4));
        assert!(!conditioner.is_running());
        assert_eq!(client.stream_requests().len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(client.stream_requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_abort_stragglers_on_force_stop() {
        let client = Arc::new(FakeClient::with_latency(Duration::from_secs(60)));
        let conditioner = conditioner(&client, test_config(&["t"]));

        conditioner.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let graceful = tokio::time::timeout(Duration::from_secs(1), conditioner.stop()).await;
        assert!(graceful.is_err());

        conditioner.force_stop();
        conditioner.force_stop();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(client.stream_requests().len(), 1);
        assert!(!conditioner.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn should_warm_up_once_with_retries() {
        let client = Arc::new(FakeClient::default());
        client.failing.lock().unwrap().insert("w1".to_string());
        let mut config = test_config(&["t"]);
        config.schedule = config
            .schedule
            .with_healthy_delays(&[Duration::from_secs(60); 6])
            .unwrap();
        config.warmup = WarmupConfig {
            endpoints: vec!["w1".to_string(), "w2".to_string()],
            stagger: Duration::from_secs(1),
            attempts: 2,
            pause: Duration::from_millis(500),
        };
        let conditioner = conditioner(&client, config);

        conditioner.start();
        tokio::time::sleep(Duration::from_secs(5)).await;
        conditioner.restart().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        conditioner.stop().await;

        let count = |name: &str| {
            client
                .stream_requests()
                .iter()
                .filter(|(_, a)| a == name)
                .count()
        };
        assert_eq!(count("w1"), 2);
        assert_eq!(count("w2"), 1);
        assert_eq!(count("t"), 2);
    }

    #[test]
    fn should_reject_config_without_targets() {
        let config = ConditionerConfig {
            targets: Vec::new(),
            ..ConditionerConfig::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::NoTargets));
        assert!(ConditionerConfig::default().validate().is_ok());
    }
}
