//! Virtual tunnel: an in-memory stand-in for the platform tunnel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use devicepilot_app::ports::TunnelTransport;
use devicepilot_domain::error::TunnelError;
use devicepilot_domain::id::HandleId;
use devicepilot_domain::tunnel::{TunnelConfig, TunnelHandle};

/// Simulated tunnel transport holding at most one session.
///
/// Opening while a session is live fails, which is how the host platform
/// behaves as well.
pub struct VirtualTunnel {
    available: AtomicBool,
    latency: Duration,
    session: Mutex<Option<TunnelHandle>>,
    opens: AtomicUsize,
}

impl Default for VirtualTunnel {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl VirtualTunnel {
    /// A transport whose open and close each take `latency`.
    #[must_use]
    pub fn new(latency: Duration) -> Self {
        Self {
            available: AtomicBool::new(true),
            latency,
            session: Mutex::new(None),
            opens: AtomicUsize::new(0),
        }
    }

    /// Make subsequent opens fail with [`TunnelError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Configuration of the live session, if any.
    #[must_use]
    pub fn active_config(&self) -> Option<TunnelConfig> {
        self.lock().as_ref().map(|handle| handle.config.clone())
    }

    /// Number of successful opens since creation.
    #[must_use]
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Option<TunnelHandle>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TunnelTransport for VirtualTunnel {
    async fn open(&self, config: &TunnelConfig) -> Result<TunnelHandle, TunnelError> {
        tokio::time::sleep(self.latency).await;
        if !self.available.load(Ordering::SeqCst) {
            return Err(TunnelError::Unavailable);
        }
        let mut session = self.lock();
        if let Some(live) = session.as_ref() {
            return Err(TunnelError::Open(
                format!("session {} is still open", live.id).into(),
            ));
        }
        let handle = TunnelHandle::open(config.clone());
        tracing::info!(
            handle = %handle.id,
            session = %config.session_label,
            resolvers = ?config.resolver_set,
            "virtual tunnel opened"
        );
        *session = Some(handle.clone());
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn close(&self, handle: &TunnelHandle) -> Result<(), TunnelError> {
        tokio::time::sleep(self.latency).await;
        let mut session = self.lock();
        match session.as_ref().map(|live| live.id) {
            Some(id) if id == handle.id => {
                *session = None;
                tracing::info!(handle = %handle.id, "virtual tunnel closed");
                Ok(())
            }
            _ => Err(TunnelError::Close(unknown(handle.id).into())),
        }
    }
}

fn unknown(id: HandleId) -> String {
    format!("no open session {id}")
}
