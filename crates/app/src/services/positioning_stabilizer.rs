//! Positioning stabilizer: turns the provider's sample stream into a
//! lock state and publishes its edges.
//!
//! `LocationStatusChanged` is published as soon as the state moves.
//! `LockAchieved` is published once per Stabilizing → Locked edge, but only
//! after the settle delay, so automation waiting on it never races a UI
//! that is still converging.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::StreamExt as _;

use devicepilot_domain::event::StatusPayload;
use devicepilot_domain::id::SubscriptionId;
use devicepilot_domain::location::{
    DEFAULT_LOCK_THRESHOLD_M, LocationState, LockTracker, Transition,
};

use crate::ports::{EventPublisher, PositioningProvider, UpdateStream};

/// Tuning for the stabilizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilizerConfig {
    pub settle_delay: Duration,
    pub lock_threshold_m: f64,
    /// Resume Stabilizing when a disabled provider comes back.
    pub resume_on_enable: bool,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(1500),
            lock_threshold_m: DEFAULT_LOCK_THRESHOLD_M,
            resume_on_enable: true,
        }
    }
}

struct Inner {
    tracker: LockTracker,
    subscription: Option<SubscriptionId>,
    pump: Option<JoinHandle<()>>,
    settles: JoinSet<()>,
    /// Bumped on every (un)subscribe; stale tasks compare and bail out.
    epoch: u64,
}

struct Shared<E> {
    inner: Mutex<Inner>,
    publisher: E,
    settle_delay: Duration,
    /// `true` from LockAchieved until the lock is lost.
    settled: watch::Sender<bool>,
}

impl<E> Shared<E>
where
    E: EventPublisher + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a transition. Must be called without the inner lock held.
    fn announce(self: &Arc<Self>, transition: Transition, epoch: u64) {
        if transition.from == LocationState::Locked {
            self.lock().settles.abort_all();
            self.settled.send_replace(false);
        }
        tracing::info!(from = %transition.from, to = %transition.to, "location state changed");
        self.publisher.emit(StatusPayload::LocationStatusChanged {
            state: transition.to,
        });
        if let Some(accuracy_m) = transition.lock_accuracy {
            self.schedule_lock(accuracy_m, epoch);
        }
    }

    fn schedule_lock(self: &Arc<Self>, accuracy_m: f64, epoch: u64) {
        let shared = Arc::clone(self);
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }
        while inner.settles.try_join_next().is_some() {}
        inner.settles.spawn(async move {
            tokio::time::sleep(shared.settle_delay).await;
            let still_locked = {
                let inner = shared.lock();
                inner.epoch == epoch && inner.tracker.state() == LocationState::Locked
            };
            if !still_locked {
                tracing::debug!(accuracy_m, "lock lost before settling");
                return;
            }
            shared.settled.send_replace(true);
            tracing::info!(accuracy_m, "positioning lock achieved");
            shared.publisher.emit(StatusPayload::LockAchieved { accuracy_m });
        });
    }
}

async fn pump<E>(shared: Arc<Shared<E>>, mut stream: UpdateStream, epoch: u64)
where
    E: EventPublisher + Send + Sync + 'static,
{
    while let Some(update) = stream.next().await {
        let transition = {
            let mut inner = shared.lock();
            if inner.epoch != epoch {
                break;
            }
            inner.tracker.apply(&update)
        };
        if let Some(transition) = transition {
            shared.announce(transition, epoch);
        }
    }
    tracing::debug!(epoch, "positioning update stream ended");
}

/// Derives Idle / Stabilizing / Locked / Disabled / Error from a provider.
pub struct PositioningStabilizer<P, E> {
    provider: Arc<P>,
    shared: Arc<Shared<E>>,
}

impl<P, E> PositioningStabilizer<P, E>
where
    P: PositioningProvider + 'static,
    E: EventPublisher + Send + Sync + 'static,
{
    pub fn new(provider: Arc<P>, publisher: E, config: StabilizerConfig) -> Self {
        let (settled, _) = watch::channel(false);
        let inner = Inner {
            tracker: LockTracker::new(config.lock_threshold_m, config.resume_on_enable),
            subscription: None,
            pump: None,
            settles: JoinSet::new(),
            epoch: 0,
        };
        Self {
            provider,
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                publisher,
                settle_delay: config.settle_delay,
                settled,
            }),
        }
    }

    /// Subscribe to the provider and begin stabilizing.
    ///
    /// No-op while already subscribed or in the terminal error state.
    /// A refused subscription moves the stabilizer to Error.
    pub fn start(&self) {
        let (transition, epoch, stream) = {
            let mut inner = self.shared.lock();
            if inner.subscription.is_some() || inner.tracker.state() == LocationState::Error {
                return;
            }
            inner.epoch += 1;
            let epoch = inner.epoch;
            match self.provider.subscribe() {
                Ok((id, stream)) => {
                    inner.subscription = Some(id);
                    let transition = inner.tracker.subscribed(self.provider.is_enabled());
                    (transition, epoch, Some(stream))
                }
                Err(err) => {
                    tracing::warn!(%err, "positioning subscription refused");
                    (inner.tracker.fail(), epoch, None)
                }
            }
        };

        if let Some(transition) = transition {
            self.shared.announce(transition, epoch);
        }

        if let Some(stream) = stream {
            let mut inner = self.shared.lock();
            if inner.epoch == epoch {
                inner.pump = Some(tokio::spawn(pump(Arc::clone(&self.shared), stream, epoch)));
            }
        }
    }

    /// Unsubscribe synchronously and return to Idle.
    pub fn stop(&self) {
        let (transition, epoch) = {
            let mut inner = self.shared.lock();
            inner.epoch += 1;
            if let Some(id) = inner.subscription.take() {
                self.provider.unsubscribe(id);
                tracing::debug!(subscription = %id, "positioning unsubscribed");
            }
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
            inner.settles.abort_all();
            (inner.tracker.reset(), inner.epoch)
        };
        self.shared.settled.send_replace(false);
        if let Some(transition) = transition {
            self.shared.announce(transition, epoch);
        }
    }

    /// Leave the terminal error state by re-subscribing.
    ///
    /// Returns `false` (and does nothing) unless the state is Error.
    pub fn retry(&self) -> bool {
        if self.state() != LocationState::Error {
            return false;
        }
        tracing::info!("retrying positioning subscription");
        self.stop();
        self.start();
        true
    }

    #[must_use]
    pub fn state(&self) -> LocationState {
        self.shared.lock().tracker.state()
    }

    /// Watch that flips to `true` once a lock has settled, `false` when lost.
    #[must_use]
    pub fn lock_signal(&self) -> watch::Receiver<bool> {
        self.shared.settled.subscribe()
    }

    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.shared.lock().subscription.is_some()
    }
}
