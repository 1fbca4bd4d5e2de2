//! Event notifier: fan-out of retry events to callbacks and channel subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::bus::{EventBus, Subscription};
use crate::event::{EventKind, RetryEvent};
use crate::in_memory_bus::InMemoryEventBus;

/// Handle returned by [`EventNotifier::on`]; pass it to [`EventNotifier::off`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

struct Registration {
    id: ListenerId,
    kind: EventKind,
    listener: Listener,
}

/// Publishes retry events to observers.
///
/// Listeners run synchronously on the publishing thread (usually the retry
/// worker), so they must return quickly. Long-running consumers should use
/// [`EventNotifier::subscribe`] and drain the channel on their own thread.
pub struct EventNotifier<B = InMemoryEventBus<RetryEvent>>
where
    B: EventBus<RetryEvent>,
{
    bus: B,
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventNotifier<InMemoryEventBus<RetryEvent>> {
    pub fn new() -> Self {
        Self::with_bus(InMemoryEventBus::new())
    }
}

impl Default for EventNotifier<InMemoryEventBus<RetryEvent>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> EventNotifier<B>
where
    B: EventBus<RetryEvent>,
{
    pub fn with_bus(bus: B) -> Self {
        Self {
            bus,
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback for one event kind.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                kind,
                listener: Arc::new(listener),
            });
        id
    }

    /// Remove a callback. Returns false if it was already removed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Channel subscription to every event regardless of kind.
    pub fn subscribe(&self) -> Subscription<RetryEvent> {
        self.bus.subscribe()
    }

    /// Deliver an event. Never fails: delivery problems are logged.
    pub fn publish(&self, event: RetryEvent) {
        let kind = event.kind();

        // Snapshot matching listeners so callbacks may call on()/off() themselves.
        let matching: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.listener.clone())
            .collect();

        trace!(
            event_type = event.event_type(),
            listeners = matching.len(),
            "publishing retry event"
        );

        for listener in matching {
            listener(&event);
        }

        if let Err(err) = self.bus.publish(event) {
            warn!(error = ?err, "failed to publish retry event to bus");
        }
    }
}

impl<B> core::fmt::Debug for EventNotifier<B>
where
    B: EventBus<RetryEvent>,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use qcretry_core::RetryJobId;

    use super::*;

    #[test]
    fn listeners_only_see_their_kind() {
        let notifier = EventNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        notifier.on(EventKind::QueueUpdated, move |e| {
            sink.lock().unwrap().push(e.event_type());
        });

        notifier.publish(RetryEvent::error(RetryJobId::new(), "disk full"));
        notifier.publish(RetryEvent::queue_updated(1, false));

        assert_eq!(*seen.lock().unwrap(), vec!["retry.queue.updated"]);
    }

    #[test]
    fn off_stops_delivery() {
        let notifier = EventNotifier::new();
        let count = Arc::new(AtomicU64::new(0));

        let c = count.clone();
        let id = notifier.on(EventKind::QueueUpdated, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        notifier.publish(RetryEvent::queue_updated(1, false));
        assert!(notifier.off(id));
        assert!(!notifier.off(id));
        notifier.publish(RetryEvent::queue_updated(0, false));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn channel_subscribers_receive_all_kinds() {
        let notifier = EventNotifier::new();
        let sub = notifier.subscribe();

        notifier.publish(RetryEvent::queue_updated(1, false));
        notifier.publish(RetryEvent::error(RetryJobId::new(), "boom"));

        let kinds: Vec<_> = sub.drain().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![EventKind::QueueUpdated, EventKind::Error]);
    }
}
