//! Named circuit registry and the execute path.

use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;

use reliefgrid_events::{EventBus, ResilienceEvent};

use crate::state::{Circuit, CircuitConfig, CircuitState, CircuitStatus};

/// Rejection or upstream failure surfaced by [`CircuitRegistry::execute`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The circuit did not admit the call and no fallback was supplied.
    /// The protected dependency was not touched.
    #[error("circuit '{name}' is open")]
    Open { name: String },

    /// The wrapped operation itself failed. The failure is already recorded
    /// in the breaker's counters and is re-raised untranslated.
    #[error("upstream operation failed: {0}")]
    Upstream(E),
}

/// Registry of named circuits.
///
/// One mutual-exclusion domain per circuit: the map is sharded and each
/// circuit's state sits behind its own `Mutex`, so unrelated circuits never
/// contend. The lock is held for bookkeeping only, never across the awaited
/// operation.
///
/// Construct once at startup and pass by handle; every test builds its own
/// registry.
pub struct CircuitRegistry {
    circuits: DashMap<String, Arc<Mutex<Circuit>>>,
    bus: Option<Arc<dyn EventBus>>,
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self {
            circuits: DashMap::new(),
            bus: None,
        }
    }

    /// Publish state transitions to `bus` in addition to logging them.
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Register a circuit with an explicit config.
    ///
    /// Registering a name that already exists replaces it with a fresh
    /// (closed, zero-count) circuit.
    pub fn register(&self, name: impl Into<String>, config: CircuitConfig) {
        let name = name.into();
        let circuit = Circuit::new(name.clone(), config, Utc::now());
        self.circuits.insert(name, Arc::new(Mutex::new(circuit)));
    }

    /// Run `op` behind the named circuit.
    ///
    /// On success the result is recorded and returned. On failure the error
    /// is recorded and re-raised as [`CircuitError::Upstream`]. A call the
    /// circuit does not admit fails fast with [`CircuitError::Open`] without
    /// touching the dependency. Unknown names are auto-registered with
    /// [`CircuitConfig::default`].
    pub async fn execute<F, Fut, T, E>(&self, name: &str, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cell = self.circuit(name);

        let (admitted, transition) = {
            let mut circuit = cell.lock().expect("circuit lock poisoned");
            circuit.try_admit(Utc::now())
        };
        if let Some((from, to)) = transition {
            self.notify_transition(name, from, to);
        }

        if !admitted {
            tracing::debug!(circuit = name, "call rejected, failing fast");
            return Err(CircuitError::Open {
                name: name.to_string(),
            });
        }

        let result = op().await;

        let transition = {
            let mut circuit = cell.lock().expect("circuit lock poisoned");
            match &result {
                Ok(_) => circuit.record_success(Utc::now()),
                Err(_) => circuit.record_failure(Utc::now()),
            }
        };
        if let Some((from, to)) = transition {
            self.notify_transition(name, from, to);
        }

        result.map_err(CircuitError::Upstream)
    }

    /// Like [`execute`](Self::execute), but degrade to `fallback()` instead
    /// of surfacing rejections and upstream failures.
    ///
    /// An upstream failure is still recorded in the breaker's counters before
    /// being suppressed.
    pub async fn execute_with_fallback<F, Fut, T, E, FB>(&self, name: &str, op: F, fallback: FB) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> T,
    {
        match self.execute(name, op).await {
            Ok(value) => value,
            Err(CircuitError::Open { .. }) => {
                tracing::debug!(circuit = name, "serving fallback while circuit open");
                fallback()
            }
            Err(CircuitError::Upstream(_)) => {
                tracing::debug!(circuit = name, "serving fallback after upstream failure");
                fallback()
            }
        }
    }

    /// Snapshot of one circuit, or `None` if the name was never used.
    pub fn status(&self, name: &str) -> Option<CircuitStatus> {
        let cell = self.circuits.get(name)?.value().clone();
        let circuit = cell.lock().expect("circuit lock poisoned");
        Some(circuit.snapshot())
    }

    /// Snapshots of every registered circuit, ordered by name.
    pub fn statuses(&self) -> Vec<CircuitStatus> {
        let mut out = Vec::with_capacity(self.circuits.len());
        for entry in self.circuits.iter() {
            let circuit = entry.value().lock().expect("circuit lock poisoned");
            out.push(circuit.snapshot());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Force a circuit to `Closed` with zeroed counters, regardless of its
    /// current state. Returns `false` if the name was never used.
    pub fn reset(&self, name: &str) -> bool {
        let Some(cell) = self.circuits.get(name).map(|entry| entry.value().clone()) else {
            return false;
        };
        let transition = {
            let mut circuit = cell.lock().expect("circuit lock poisoned");
            circuit.force_closed(Utc::now())
        };
        if let Some((from, to)) = transition {
            self.notify_transition(name, from, to);
        }
        true
    }

    fn circuit(&self, name: &str) -> Arc<Mutex<Circuit>> {
        if let Some(cell) = self.circuits.get(name) {
            return cell.value().clone();
        }
        self.circuits
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(circuit = name, "auto-registering circuit with defaults");
                Arc::new(Mutex::new(Circuit::new(
                    name,
                    CircuitConfig::default(),
                    Utc::now(),
                )))
            })
            .value()
            .clone()
    }

    fn notify_transition(&self, name: &str, from: CircuitState, to: CircuitState) {
        tracing::info!(
            circuit = name,
            from = from.as_str(),
            to = to.as_str(),
            "circuit state changed"
        );
        if let Some(bus) = &self.bus {
            bus.publish(ResilienceEvent::CircuitTransition {
                name: name.to_string(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
                at: Utc::now(),
            });
        }
    }
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Duration;
    use reliefgrid_events::InMemoryEventBus;

    use super::*;

    async fn ok_call() -> Result<&'static str, String> {
        Ok("ok")
    }

    async fn failing_call() -> Result<&'static str, String> {
        Err("boom".to_string())
    }

    #[tokio::test]
    async fn unknown_circuit_is_auto_registered_with_defaults() {
        let registry = CircuitRegistry::new();

        let value = registry.execute("payments", ok_call).await.unwrap();
        assert_eq!(value, "ok");

        let status = registry.status("payments").unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.success_count, 1);
    }

    #[tokio::test]
    async fn status_is_none_for_never_used_names() {
        let registry = CircuitRegistry::new();
        assert!(registry.status("ghost").is_none());
        assert!(!registry.reset("ghost"));
    }

    #[tokio::test]
    async fn threshold_failures_open_and_fast_fail_without_invoking_op() {
        let registry = CircuitRegistry::new();
        registry.register(
            "db",
            CircuitConfig::default()
                .with_failure_threshold(2)
                .with_open_timeout(Duration::milliseconds(60_000)),
        );

        for _ in 0..2 {
            let err = registry.execute("db", failing_call).await.unwrap_err();
            assert!(matches!(err, CircuitError::Upstream(_)));
        }
        assert_eq!(registry.status("db").unwrap().state, CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let err = registry
            .execute("db", || {
                invoked.fetch_add(1, Ordering::SeqCst);
                ok_call()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CircuitError::Open { .. }));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fallback_is_served_while_open_without_touching_the_dependency() {
        let registry = CircuitRegistry::new();
        registry.register(
            "db",
            CircuitConfig::default()
                .with_failure_threshold(2)
                .with_open_timeout(Duration::milliseconds(60_000)),
        );
        for _ in 0..2 {
            let _ = registry.execute("db", failing_call).await;
        }

        let invoked = AtomicU32::new(0);
        let value = registry
            .execute_with_fallback(
                "db",
                || {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    ok_call()
                },
                || "cached",
            )
            .await;
        assert_eq!(value, "cached");
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fallback_suppresses_but_still_records_upstream_failures() {
        let registry = CircuitRegistry::new();
        registry.register("db", CircuitConfig::default().with_failure_threshold(5));

        let value = registry
            .execute_with_fallback("db", failing_call, || "cached")
            .await;
        assert_eq!(value, "cached");
        assert_eq!(registry.status("db").unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn open_circuit_recovers_through_half_open_probes() {
        let registry = CircuitRegistry::new();
        registry.register(
            "db",
            CircuitConfig::default()
                .with_failure_threshold(2)
                .with_success_threshold(2)
                .with_open_timeout(Duration::milliseconds(50)),
        );
        for _ in 0..2 {
            let _ = registry.execute("db", failing_call).await;
        }
        assert_eq!(registry.status("db").unwrap().state, CircuitState::Open);

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        // First probe transitions Open → HalfOpen before evaluation.
        registry.execute("db", ok_call).await.unwrap();
        assert_eq!(registry.status("db").unwrap().state, CircuitState::HalfOpen);

        registry.execute("db", ok_call).await.unwrap();
        assert_eq!(registry.status("db").unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn failed_probe_reopens_the_circuit() {
        let registry = CircuitRegistry::new();
        registry.register(
            "db",
            CircuitConfig::default()
                .with_failure_threshold(1)
                .with_open_timeout(Duration::milliseconds(0)),
        );
        let _ = registry.execute("db", failing_call).await;

        // Zero timeout: the next call probes immediately, and its failure
        // reopens the circuit.
        let _ = registry.execute("db", failing_call).await;
        let status = registry.status("db").unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.success_count, 0);
    }

    #[tokio::test]
    async fn reset_forces_closed_from_open() {
        let registry = CircuitRegistry::new();
        registry.register("db", CircuitConfig::default().with_failure_threshold(1));
        let _ = registry.execute("db", failing_call).await;
        assert_eq!(registry.status("db").unwrap().state, CircuitState::Open);

        assert!(registry.reset("db"));
        let status = registry.status("db").unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert!(status.last_failure_at.is_none());
    }

    #[tokio::test]
    async fn transitions_are_published_to_the_event_bus() {
        let bus = Arc::new(InMemoryEventBus::new());
        let subscription = bus.subscribe();
        let registry =
            CircuitRegistry::new().with_event_bus(bus.clone() as Arc<dyn EventBus>);
        registry.register("db", CircuitConfig::default().with_failure_threshold(1));

        let _ = registry.execute("db", failing_call).await;

        match subscription.try_recv().unwrap() {
            ResilienceEvent::CircuitTransition { name, from, to, .. } => {
                assert_eq!(name, "db");
                assert_eq!(from, "closed");
                assert_eq!(to, "open");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn statuses_lists_all_circuits_by_name() {
        let registry = CircuitRegistry::new();
        registry.register("write-db", CircuitConfig::default());
        registry.register("geocoder", CircuitConfig::default());

        let names: Vec<String> = registry
            .statuses()
            .into_iter()
            .map(|status| status.name)
            .collect();
        assert_eq!(names, vec!["geocoder".to_string(), "write-db".to_string()]);
    }
}
