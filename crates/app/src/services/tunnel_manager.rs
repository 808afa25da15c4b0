//! Tunnel manager: owns at most one open tunnel handle.
//!
//! Every operation runs under the slot lock, so a close always completes
//! before the next open begins and two handles never coexist.

use std::sync::{Mutex, PoisonError};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::Mutex as AsyncMutex;

use devicepilot_domain::error::TunnelError;
use devicepilot_domain::tunnel::{Profile, TunnelConfig, TunnelHandle, pick_resolver};

use crate::ports::TunnelTransport;

#[derive(Default)]
struct Slot {
    handle: Option<TunnelHandle>,
    /// Label of the most recently opened resolver candidate.
    last_label: Option<String>,
}

/// Establishes, rotates and tears down the single virtual tunnel.
pub struct TunnelManager<T> {
    transport: T,
    slot: AsyncMutex<Slot>,
    rng: Mutex<StdRng>,
}

impl<T: TunnelTransport> TunnelManager<T> {
    /// Create a manager seeded from OS entropy.
    pub fn new(transport: T) -> Self {
        Self::with_rng(transport, StdRng::from_entropy())
    }

    /// Create a manager with a caller-provided generator (deterministic tests).
    pub fn with_rng(transport: T, rng: StdRng) -> Self {
        Self {
            transport,
            slot: AsyncMutex::new(Slot::default()),
            rng: Mutex::new(rng),
        }
    }

    /// Choose the next resolver candidate of `profile`.
    ///
    /// The pick differs from the previously opened candidate whenever the
    /// profile offers more than one.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Validation`] if the profile is invalid.
    pub async fn select(&self, profile: &Profile) -> Result<TunnelConfig, TunnelError> {
        profile.validate()?;
        let previous = self.slot.lock().await.last_label.clone();
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let candidate = pick_resolver(&profile.resolvers, previous.as_deref(), &mut *rng)
            .ok_or_else(|| TunnelError::UnknownProfile(profile.name.clone()))?;
        Ok(profile.config_for(candidate))
    }

    /// Open a tunnel for `config`.
    ///
    /// No-op when an equivalent tunnel (same resolver set) is already open.
    /// Otherwise the current tunnel is closed first. On failure the manager
    /// ends with no tunnel open.
    ///
    /// # Errors
    ///
    /// Returns the [`TunnelError`] reported by the transport's `open`.
    pub async fn establish(&self, config: TunnelConfig) -> Result<(), TunnelError> {
        let mut slot = self.slot.lock().await;
        if let Some(current) = &slot.handle {
            if current.config.is_equivalent(&config) {
                tracing::debug!(session = %config.session_label, "equivalent tunnel already open");
                return Ok(());
            }
        }
        self.close_slot(&mut slot).await;
        self.open_into(&mut slot, config).await
    }

    /// Replace the current tunnel: close it, then open `config`.
    ///
    /// The existing handle is never mutated in place, even when the new
    /// resolver set is equivalent.
    ///
    /// # Errors
    ///
    /// Returns the [`TunnelError`] reported by the transport's `open`; the
    /// manager then has no tunnel open.
    pub async fn rotate(&self, config: TunnelConfig) -> Result<(), TunnelError> {
        let mut slot = self.slot.lock().await;
        self.close_slot(&mut slot).await;
        self.open_into(&mut slot, config).await
    }

    /// Close the tunnel if one is open. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the transport's close error. The handle is forgotten either
    /// way.
    pub async fn teardown(&self) -> Result<(), TunnelError> {
        let mut slot = self.slot.lock().await;
        match slot.handle.take() {
            Some(handle) => {
                let result = self.transport.close(&handle).await;
                match &result {
                    Ok(()) => tracing::info!(handle = %handle.id, "tunnel closed"),
                    Err(err) => tracing::warn!(%err, handle = %handle.id, "tunnel close failed"),
                }
                result
            }
            None => Ok(()),
        }
    }

    /// Label of the resolver candidate applied by the open tunnel.
    pub async fn resolver_label(&self) -> Option<String> {
        let slot = self.slot.lock().await;
        slot.handle.as_ref().map(|h| h.config.resolver_label.clone())
    }

    pub async fn is_open(&self) -> bool {
        self.slot.lock().await.handle.is_some()
    }

    async fn close_slot(&self, slot: &mut Slot) {
        if let Some(handle) = slot.handle.take() {
            if let Err(err) = self.transport.close(&handle).await {
                tracing::warn!(%err, handle = %handle.id, "closing previous tunnel failed, handle dropped");
            }
        }
    }

    async fn open_into(&self, slot: &mut Slot, config: TunnelConfig) -> Result<(), TunnelError> {
        match self.transport.open(&config).await {
            Ok(handle) => {
                tracing::info!(
                    handle = %handle.id,
                    session = %config.session_label,
                    resolvers = config.resolver_set.len(),
                    "tunnel established"
                );
                slot.last_label = Some(config.resolver_label);
                slot.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%err, session = %config.session_label, "tunnel open failed");
                Err(err)
            }
        }
    }
}
