//! Event bus port: publish status events, present them externally.

use devicepilot_domain::event::{StatusEvent, StatusPayload};

/// Publishes status events to interested subscribers.
///
/// Delivery is synchronous: when `publish` returns, every current
/// subscriber has seen the event.
pub trait EventPublisher {
    /// Publish an event to all current subscribers.
    fn publish(&self, event: StatusEvent);

    /// Stamp `payload` into a fresh event and publish it.
    fn emit(&self, payload: StatusPayload) {
        self.publish(StatusEvent::new(payload));
    }
}

impl<T: EventPublisher + ?Sized> EventPublisher for std::sync::Arc<T> {
    fn publish(&self, event: StatusEvent) {
        (**self).publish(event);
    }
}

/// External consumer that renders status events (display, logs, …).
pub trait StatusSink: Send + Sync {
    /// Called synchronously on publish; must not block.
    fn present(&self, event: &StatusEvent);
}
