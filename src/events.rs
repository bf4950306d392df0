//! Session event bus.
//!
//! Handlers registered with [`EventBus::subscribe`] run synchronously, in
//! publish order, on whichever task publishes. They must not block. Async
//! consumers can instead take a `tokio::sync::broadcast` receiver from
//! [`EventBus::subscribe_channel`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use strum::IntoStaticStr;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::ServiceError;
use crate::state::session::{ParticipantId, Session};

/// Session lifecycle and data-change notifications.
#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
pub enum SessionEvent {
    SessionCreated(Arc<Session>),
    SessionJoined(Arc<Session>),
    SessionLeft,
    SessionKicked(ParticipantId),
    SessionRefreshed(Arc<Session>),
    ParticipantJoined(ParticipantId),
    ParticipantLeft(ParticipantId),
    ParticipantDataChanged {
        participant_id: ParticipantId,
        key: String,
        old_value: Option<String>,
        new_value: Option<String>,
    },
    SharedDataChanged {
        key: String,
        old_value: Option<String>,
        new_value: Option<String>,
    },
    HostMigrated(ParticipantId),
    SessionLost(ServiceError),
}

impl SessionEvent {
    /// Variant name, for logging.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Identifies one handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registry {
    next_id: u64,
    handlers: Vec<(SubscriptionId, Handler)>,
}

impl Registry {
    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(h, _)| *h != id);
        self.handlers.len() != before
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Typed publish/subscribe channel for [`SessionEvent`]s.
///
/// Cloning the bus is cheap and every clone shares the same subscribers.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EVENT_CHANNEL_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .field("channels", &self.tx.receiver_count())
            .finish()
    }
}

impl EventBus {
    /// Create a bus whose broadcast channel holds `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
            tx,
        }
    }

    /// Register a handler. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    #[must_use = "dropping the subscription unsubscribes the handler"]
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.handlers.push((id, Arc::new(handler)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Remove a handler by id. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.registry).remove(id)
    }

    /// Receive events on a broadcast channel instead of a callback.
    pub fn subscribe_channel(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Deliver an event to every handler, then to channel subscribers.
    pub fn publish(&self, event: SessionEvent) {
        trace!(event = event.name(), "publishing session event");

        // Snapshot the handler list so a handler may (un)subscribe.
        let handlers: Vec<Handler> = lock(&self.registry)
            .handlers
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(&event);
        }

        // `send` fails only when nobody holds a receiver.
        let _ = self.tx.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = SessionEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.registry).handlers.len()
    }
}

/// Handle to a registered handler.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the handler now.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    /// Keep the handler registered for the lifetime of the bus.
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(self.id);
        }
    }
}
