//! Virtual positioning provider: fixes that converge on a fixed spot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use devicepilot_app::ports::{PositioningProvider, UpdateStream};
use devicepilot_domain::error::PositioningError;
use devicepilot_domain::id::SubscriptionId;
use devicepilot_domain::location::{LocationSample, ProviderUpdate};
use devicepilot_domain::time::now;

/// Shape of the simulated fix sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct PositioningScript {
    pub interval: Duration,
    pub initial_accuracy_m: f64,
    /// Factor applied to the accuracy after every fix.
    pub convergence: f64,
    pub floor_accuracy_m: f64,
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for PositioningScript {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            initial_accuracy_m: 80.0,
            convergence: 0.7,
            floor_accuracy_m: 6.0,
            latitude: 48.8584,
            longitude: 2.2945,
        }
    }
}

struct Feed {
    sender: mpsc::UnboundedSender<ProviderUpdate>,
    generator: JoinHandle<()>,
}

/// Simulated positioning provider.
///
/// Every subscription restarts the sequence from the initial accuracy.
pub struct VirtualPositioning {
    script: PositioningScript,
    enabled: Arc<AtomicBool>,
    permitted: AtomicBool,
    feeds: Mutex<HashMap<SubscriptionId, Feed>>,
}

impl Default for VirtualPositioning {
    fn default() -> Self {
        Self::new(PositioningScript::default())
    }
}

impl VirtualPositioning {
    #[must_use]
    pub fn new(script: PositioningScript) -> Self {
        Self {
            script,
            enabled: Arc::new(AtomicBool::new(true)),
            permitted: AtomicBool::new(true),
            feeds: Mutex::new(HashMap::new()),
        }
    }

    /// Toggle the provider; live subscribers are notified.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        self.broadcast(&if enabled {
            ProviderUpdate::Enabled
        } else {
            ProviderUpdate::Disabled
        });
    }

    /// Withdraw permission; live subscribers receive a permission failure.
    pub fn revoke_permission(&self) {
        self.permitted.store(false, Ordering::SeqCst);
        self.broadcast(&ProviderUpdate::Failed(PositioningError::PermissionDenied));
    }

    pub fn grant_permission(&self) {
        self.permitted.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.lock().len()
    }

    fn broadcast(&self, update: &ProviderUpdate) {
        for feed in self.lock().values() {
            let _ = feed.sender.send(update.clone());
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Feed>> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PositioningProvider for VirtualPositioning {
    fn subscribe(&self) -> Result<(SubscriptionId, UpdateStream), PositioningError> {
        if !self.permitted.load(Ordering::SeqCst) {
            return Err(PositioningError::PermissionDenied);
        }
        let id = SubscriptionId::new();
        let (sender, receiver) = mpsc::unbounded_channel();
        let generator = tokio::spawn(generate(
            self.script.clone(),
            Arc::clone(&self.enabled),
            sender.clone(),
        ));
        self.lock().insert(id, Feed { sender, generator });
        tracing::debug!(subscription = %id, "virtual positioning subscribed");
        Ok((id, Box::pin(UnboundedReceiverStream::new(receiver))))
    }

    fn unsubscribe(&self, subscription: SubscriptionId) {
        if let Some(feed) = self.lock().remove(&subscription) {
            feed.generator.abort();
            tracing::debug!(%subscription, "virtual positioning unsubscribed");
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

async fn generate(
    script: PositioningScript,
    enabled: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<ProviderUpdate>,
) {
    let mut rng = StdRng::from_entropy();
    let mut accuracy_m = script.initial_accuracy_m;
    let mut ticker = tokio::time::interval(script.interval);
    loop {
        ticker.tick().await;
        if !enabled.load(Ordering::SeqCst) {
            continue;
        }
        let sample = LocationSample {
            latitude: script.latitude + rng.gen_range(-0.0001..0.0001),
            longitude: script.longitude + rng.gen_range(-0.0001..0.0001),
            accuracy_m,
            timestamp: now(),
        };
        if sender.send(ProviderUpdate::Sample(sample)).is_err() {
            break;
        }
        accuracy_m = (accuracy_m * script.convergence).max(script.floor_accuracy_m);
    }
}
