//! `reliefgrid-circuit` — circuit breaker for unreliable downstream
//! dependencies.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - HalfOpen: bounded probes test whether the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_threshold consecutive failures
//! Open → HalfOpen: first call after open_timeout has elapsed
//! HalfOpen → Closed: success_threshold probe successes
//! HalfOpen → Open: any probe failure
//! ```
//!
//! The breaker is fully generic over the protected call: it reacts to
//! success/failure outcomes only, never inspecting what the operation does
//! or which kind of error it produced. Retry policy and timeouts belong to
//! the caller.

pub mod registry;
pub mod state;

pub use registry::{CircuitError, CircuitRegistry};
pub use state::{CircuitConfig, CircuitState, CircuitStatus};
