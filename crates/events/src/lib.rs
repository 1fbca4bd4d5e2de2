//! Retry notifications: event types, pub/sub bus, and the notifier.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod notifier;

pub use bus::{EventBus, Subscription};
pub use event::{
    EventKind, ImageCompletedEvent, ImageOutcome, JobCompletedEvent, JobErrorEvent,
    ProgressEvent, QueueUpdatedEvent, RetryEvent, RetryEventPayload,
};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use notifier::{EventNotifier, Listener, ListenerId};
