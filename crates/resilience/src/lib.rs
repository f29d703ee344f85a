//! `reliefgrid-resilience` — composition point for the resilience layer.
//!
//! A thin facade owning the circuit registry, the rate limiter and the sync
//! engine, wired to a shared in-process event bus. Pure delegation: all
//! behavior lives in the component crates.

use std::sync::Arc;

use reliefgrid_circuit::CircuitRegistry;
use reliefgrid_events::{EventBus, InMemoryEventBus, Subscription};
use reliefgrid_ratelimit::RateLimiter;
use reliefgrid_sync::{ServerStateProvider, SyncEngine};


/// The resilience layer as one handle.
///
/// Constructed once at startup and passed by reference to callers; tests
/// build a fresh instance each.
pub struct Resilience<P: ServerStateProvider> {
    bus: Arc<InMemoryEventBus>,
    circuits: CircuitRegistry,
    limiter: RateLimiter,
    sync: SyncEngine<P>,
}

impl<P: ServerStateProvider> Resilience<P> {
    /// Wire the three components around a shared in-process event bus.
    pub fn new(provider: Arc<P>) -> Self {
        let bus = Arc::new(InMemoryEventBus::new());
        Self {
            circuits: CircuitRegistry::new().with_event_bus(bus.clone() as Arc<dyn EventBus>),
            limiter: RateLimiter::new().with_event_bus(bus.clone() as Arc<dyn EventBus>),
            sync: SyncEngine::new(provider).with_event_bus(bus.clone() as Arc<dyn EventBus>),
            bus,
        }
    }

    /// Circuit breakers for calls to unreliable downstream dependencies.
    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    /// Admission control per named resource and caller key.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Reconciliation of client mutations queued while offline.
    pub fn sync(&self) -> &SyncEngine<P> {
        &self.sync
    }

    /// Subscribe to every observable event the layer publishes.
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }
}
