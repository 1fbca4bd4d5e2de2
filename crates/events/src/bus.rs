//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes retry notifications (progress ticks, job completion,
//! queue depth changes) to any number of observers.
//!
//! ## Delivery
//!
//! - **Best-effort, at-least-once**: a subscriber may miss events if it falls
//!   behind or disconnects, and may see an event twice after a reconnect.
//! - **Not the source of truth**: the QC status store and the queue status
//!   snapshot always reflect ground truth. Observers that need certainty poll
//!   those and treat events as a hint to refresh sooner.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription gets a copy of every event published after it was created
/// (broadcast semantics).
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = notifier.subscribe();
///
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => render(event),
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => refresh_from_status(),
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
///
/// Subscriptions are meant to be drained by one thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Transport-agnostic pub/sub abstraction.
///
/// `publish()` may fail (lock poisoning, closed transport). Callers on the
/// retry path log the failure and carry on: a lost notification never changes
/// the state observers can query.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
