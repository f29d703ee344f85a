//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is intentionally lightweight:
//!
//! - **Transport-agnostic**: in-memory channels here; a broker elsewhere.
//! - **Best-effort fan-out**: publishing never fails the publishing
//!   component; a transition that nobody observes is still a transition.
//! - **At-least-once acceptable**: consumers must be idempotent.
//!
//! Components hold an `Option<Arc<dyn EventBus>>` and stay fully functional
//! without one.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use crate::event::ResilienceEvent;

/// A subscription to the resilience event stream.
///
/// Each subscription gets a copy of every event published after it was
/// created (broadcast semantics). Subscriptions are designed for
/// single-threaded consumption.
#[derive(Debug)]
pub struct Subscription {
    receiver: Receiver<ResilienceEvent>,
}

impl Subscription {
    pub fn new(receiver: Receiver<ResilienceEvent>) -> Self {
        Self { receiver }
    }

    /// Block until the next event is available.
    pub fn recv(&self) -> Result<ResilienceEvent, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&self) -> Result<ResilienceEvent, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for an event.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<ResilienceEvent, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Pub/sub seam for resilience events.
///
/// `publish` is infallible by contract: implementations log delivery
/// problems and move on. The publishing component must never block or fail
/// because an observer went away.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: ResilienceEvent);

    fn subscribe(&self) -> Subscription;
}

impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    fn publish(&self, event: ResilienceEvent) {
        (**self).publish(event);
    }

    fn subscribe(&self) -> Subscription {
        (**self).subscribe()
    }
}
