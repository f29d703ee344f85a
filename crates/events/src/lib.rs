//! `reliefgrid-events` — observable-event plumbing for the resilience layer.
//!
//! Circuit transitions, rate-limit rejections and sync outcomes are published
//! as [`ResilienceEvent`] values through the [`EventBus`] seam so operators
//! can wire logging, metrics or alerting without the components knowing about
//! any of it.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::ResilienceEvent;
pub use in_memory_bus::InMemoryEventBus;
