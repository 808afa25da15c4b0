//! Positioning provider port.

use std::pin::Pin;

use tokio_stream::Stream;

use devicepilot_domain::error::PositioningError;
use devicepilot_domain::id::SubscriptionId;
use devicepilot_domain::location::ProviderUpdate;

/// Lazy, infinite stream of provider updates for one subscription.
pub type UpdateStream = Pin<Box<dyn Stream<Item = ProviderUpdate> + Send>>;

/// Source of location fixes.
///
/// The provider may deliver from an internal pool; the stream is treated
/// as a single logical producer. Subscribing again after an unsubscribe
/// restarts the sequence.
pub trait PositioningProvider: Send + Sync {
    /// Start delivering updates.
    ///
    /// # Errors
    ///
    /// Returns [`PositioningError`] when permission is missing or the
    /// provider cannot serve a subscription right now.
    fn subscribe(&self) -> Result<(SubscriptionId, UpdateStream), PositioningError>;

    /// Stop delivering updates for `subscription`. Takes effect immediately.
    fn unsubscribe(&self, subscription: SubscriptionId);

    fn is_enabled(&self) -> bool;
}
