//! In-process event bus with synchronous fan-out.
//!
//! Handlers registered with [`EventBus::subscribe`] run on the publishing
//! thread before `publish` returns. Heavy work belongs in a task spawned
//! by the handler, or behind [`EventBus::listen`], which hands out a tokio
//! [`broadcast`] receiver for async consumers.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

use devicepilot_domain::event::{StatusEvent, Topic};
use devicepilot_domain::id::SubscriptionId;

use crate::ports::{EventPublisher, StatusSink};

type Handler = Arc<dyn Fn(&StatusEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    /// `None` receives every topic.
    topic: Option<Topic>,
    handler: Handler,
}

/// In-process event bus.
///
/// Publishing succeeds even when there are no subscribers (the event is
/// simply dropped).
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    sender: broadcast::Sender<StatusEvent>,
}

impl EventBus {
    /// Create a new event bus; `capacity` bounds the async listener backlog.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            subscribers: Mutex::new(Vec::new()),
            sender,
        }
    }

    /// Register `handler` for events of `topic`.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.insert(Some(topic), Arc::new(handler))
    }

    /// Register `handler` for every event.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(handler))
    }

    /// Forward every event to an external sink.
    pub fn attach_sink<S: StatusSink + 'static>(&self, sink: Arc<S>) -> SubscriptionId {
        self.subscribe_all(move |event| sink.present(event))
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Async receiver of every event published *after* this call.
    #[must_use]
    pub fn listen(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn insert(&self, topic: Option<Topic>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.lock().push(Subscriber { id, topic, handler });
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: StatusEvent) {
        let topic = event.topic();
        // Handlers run outside the lock so they may publish or subscribe.
        let handlers: Vec<Handler> = self
            .lock()
            .iter()
            .filter(|s| s.topic.is_none_or(|t| t == topic))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in handlers {
            handler(&event);
        }

        // Fails only when nobody listens, which is fine.
        let _ = self.sender.send(event);
    }
}
