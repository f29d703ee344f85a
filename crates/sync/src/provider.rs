//! Lookup of authoritative server state.
//!
//! The engine never persists business entities itself; it asks an injected
//! provider what the server currently holds and compares timestamps. The
//! in-memory implementation backs tests and single-process development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use reliefgrid_core::EntityRef;

/// Authoritative state of an entity as the server last persisted it.
///
/// `version` is carried for integrators that move conflict detection to a
/// revision counter; the engine itself compares `last_modified` only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    pub payload: Value,
    pub last_modified: DateTime<Utc>,
    pub version: u64,
}

/// Failure while looking up authoritative state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("authoritative store unavailable: {0}")]
    Unavailable(String),
    #[error("authoritative store error: {0}")]
    Backend(String),
}

/// Source of authoritative entity state.
///
/// `fetch` may suspend (network, database); the engine holds no locks
/// across it. Returning `Ok(None)` means the server has never seen the
/// entity, which can never conflict.
#[async_trait]
pub trait ServerStateProvider: Send + Sync {
    async fn fetch(&self, entity: &EntityRef) -> Result<Option<ServerState>, ProviderError>;
}

/// In-memory provider for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryServerStateProvider {
    states: DashMap<EntityRef, ServerState>,
}

impl InMemoryServerStateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the authoritative state for an entity.
    pub fn upsert(&self, entity: EntityRef, state: ServerState) {
        self.states.insert(entity, state);
    }

    pub fn remove(&self, entity: &EntityRef) {
        self.states.remove(entity);
    }
}

#[async_trait]
impl ServerStateProvider for InMemoryServerStateProvider {
    async fn fetch(&self, entity: &EntityRef) -> Result<Option<ServerState>, ProviderError> {
        Ok(self.states.get(entity).map(|state| state.value().clone()))
    }
}
