//! The sync engine: queueing, conflict detection, resolution.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use reliefgrid_core::{ClientId, EntityRef, OperationId};
use reliefgrid_events::{EventBus, ResilienceEvent};

use crate::operation::{OfflineOperation, OperationDraft, SyncStatus};
use crate::provider::{ServerState, ServerStateProvider};
use crate::strategy::{AppliedResolution, ConflictStrategy, ManualResolution};

/// Per-operation outcome of a sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// No conflict; the client's write stands as-is.
    Synced,
    /// A conflict was detected and resolved automatically by policy.
    Resolved {
        resolution: AppliedResolution,
        client_payload: Value,
        server_snapshot: ServerState,
    },
    /// A conflict was detected and awaits manual resolution.
    Conflict {
        client_payload: Value,
        server_snapshot: ServerState,
    },
    /// The sync attempt itself failed; the caller decides whether to retry.
    Failed { error: String },
}

impl SyncOutcome {
    /// True for outcomes that left the operation `Synced`.
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Synced | SyncOutcome::Resolved { .. })
    }
}

/// Result of advancing one operation through the sync algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub operation_id: OperationId,
    pub outcome: SyncOutcome,
}

/// Aggregated result of syncing one client's pending queue.
#[derive(Debug, Clone, Serialize)]
pub struct SyncBatchResult {
    pub client_id: ClientId,
    pub synced: u32,
    pub failed: u32,
    pub conflicts: u32,
    pub results: Vec<SyncResult>,
    pub synced_at: DateTime<Utc>,
}

/// Misuse of the engine's manual surfaces.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("unknown operation: {0}")]
    UnknownOperation(OperationId),
    #[error("operation {0} is not in conflict")]
    NotInConflict(OperationId),
    #[error("operation {0} has no stored server snapshot")]
    MissingSnapshot(OperationId),
    #[error("merge resolution requires a merged payload")]
    MissingMergedPayload,
    #[error("operation {0} is not in a failed state")]
    NotRetryable(OperationId),
}

/// Offline synchronization engine.
///
/// Operations live in a sharded table keyed by id; each entry is mutated
/// under its own lock and only while holding `Syncing` status, so one
/// operation never has two writers. The provider fetch happens with no
/// table lock held. Batches run sequentially per client to preserve the
/// client-intended causal order; different clients sync concurrently.
///
/// Construct once at startup and pass by handle; every test builds its own
/// engine.
pub struct SyncEngine<P: ServerStateProvider> {
    operations: DashMap<OperationId, OfflineOperation>,
    provider: Arc<P>,
    strategy: Mutex<ConflictStrategy>,
    bus: Option<Arc<dyn EventBus>>,
}

impl<P: ServerStateProvider> SyncEngine<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self {
            operations: DashMap::new(),
            provider,
            strategy: Mutex::new(ConflictStrategy::default()),
            bus: None,
        }
    }

    /// Publish sync completions and detected conflicts to `bus` in addition
    /// to logging them.
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Queue a client mutation recorded while offline.
    ///
    /// The payload is stored untouched; validating its contents is the
    /// persisting collaborator's job.
    pub fn queue_operation(&self, draft: OperationDraft) -> OfflineOperation {
        let operation = OfflineOperation::new(draft);
        tracing::info!(
            operation = %operation.id,
            client = %operation.client_id,
            entity = %operation.entity,
            kind = operation.kind.as_str(),
            "queued offline operation"
        );
        self.operations.insert(operation.id, operation.clone());
        operation
    }

    /// Advance exactly one operation through conflict detection and
    /// resolution.
    pub async fn sync_operation(&self, id: OperationId) -> SyncResult {
        self.sync_operation_at(id, Utc::now()).await
    }

    /// [`sync_operation`](Self::sync_operation) against an explicit clock
    /// reading.
    pub async fn sync_operation_at(&self, id: OperationId, now: DateTime<Utc>) -> SyncResult {
        // Claim the operation: single writer per operation while Syncing.
        let (entity, client_timestamp, client_id, client_payload) = {
            let Some(mut operation) = self.operations.get_mut(&id) else {
                return failure(id, "operation not found");
            };
            if operation.status == SyncStatus::Syncing {
                return failure(id, "operation is already syncing");
            }
            operation.status = SyncStatus::Syncing;
            operation.server_snapshot = None;
            (
                operation.entity.clone(),
                operation.client_timestamp,
                operation.client_id,
                operation.payload.clone(),
            )
        };

        // No table lock is held across the fetch.
        let server = match self.provider.fetch(&entity).await {
            Ok(server) => server,
            Err(err) => {
                if let Some(mut operation) = self.operations.get_mut(&id) {
                    operation.status = SyncStatus::Failed;
                    operation.retry_count += 1;
                }
                tracing::error!(
                    operation = %id,
                    entity = %entity,
                    error = %err,
                    "failed to fetch authoritative state"
                );
                return failure(id, err.to_string());
            }
        };

        match server {
            // The server was modified after the client's offline write.
            Some(state) if state.last_modified > client_timestamp => {
                self.resolve(id, client_id, client_timestamp, client_payload, state, now)
            }
            // No authoritative state, or the client's write is the newer one.
            _ => {
                self.mark_synced(id, None, now);
                self.notify_synced(id, client_id, now);
                SyncResult {
                    operation_id: id,
                    outcome: SyncOutcome::Synced,
                }
            }
        }
    }

    /// Sync every pending operation of one client, oldest first.
    ///
    /// Sequential by design: the client-intended causal order is preserved.
    pub async fn sync_batch(&self, client_id: ClientId) -> SyncBatchResult {
        self.sync_batch_at(client_id, Utc::now()).await
    }

    /// [`sync_batch`](Self::sync_batch) against an explicit clock reading.
    pub async fn sync_batch_at(&self, client_id: ClientId, now: DateTime<Utc>) -> SyncBatchResult {
        let mut queue: Vec<(DateTime<Utc>, OperationId)> = self
            .operations
            .iter()
            .filter(|op| op.client_id == client_id && op.status == SyncStatus::Pending)
            .map(|op| (op.client_timestamp, op.id))
            .collect();
        // Ties broken by id; OperationId is time-ordered.
        queue.sort();

        let mut synced = 0;
        let mut failed = 0;
        let mut conflicts = 0;
        let mut results = Vec::with_capacity(queue.len());

        for (_, id) in queue {
            let result = self.sync_operation_at(id, now).await;
            match &result.outcome {
                SyncOutcome::Synced | SyncOutcome::Resolved { .. } => synced += 1,
                SyncOutcome::Conflict { .. } => conflicts += 1,
                SyncOutcome::Failed { .. } => failed += 1,
            }
            results.push(result);
        }

        tracing::info!(
            client = %client_id,
            synced,
            failed,
            conflicts,
            "offline batch sync complete"
        );

        SyncBatchResult {
            client_id,
            synced,
            failed,
            conflicts,
            results,
            synced_at: now,
        }
    }

    /// Operations of one client still waiting to sync, oldest first.
    pub fn pending_operations(&self, client_id: ClientId) -> Vec<OfflineOperation> {
        self.operations_with_status(client_id, SyncStatus::Pending)
    }

    /// Operations of one client awaiting manual conflict resolution, oldest
    /// first. This is the operator-facing conflict list; entries stay here
    /// until someone resolves them.
    pub fn conflict_operations(&self, client_id: ClientId) -> Vec<OfflineOperation> {
        self.operations_with_status(client_id, SyncStatus::Conflict)
    }

    /// Look up a single operation by id.
    pub fn operation(&self, id: OperationId) -> Option<OfflineOperation> {
        self.operations.get(&id).map(|op| op.value().clone())
    }

    /// Apply a manual three-way resolution to an operation in conflict.
    pub fn resolve_conflict_manually(
        &self,
        id: OperationId,
        resolution: ManualResolution,
        merged_payload: Option<Value>,
    ) -> Result<OfflineOperation, SyncError> {
        self.resolve_conflict_manually_at(id, resolution, merged_payload, Utc::now())
    }

    /// [`resolve_conflict_manually`](Self::resolve_conflict_manually)
    /// against an explicit clock reading.
    pub fn resolve_conflict_manually_at(
        &self,
        id: OperationId,
        resolution: ManualResolution,
        merged_payload: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<OfflineOperation, SyncError> {
        let resolved = {
            let mut operation = self
                .operations
                .get_mut(&id)
                .ok_or(SyncError::UnknownOperation(id))?;
            if operation.status != SyncStatus::Conflict {
                return Err(SyncError::NotInConflict(id));
            }

            match resolution {
                ManualResolution::UseClient => {}
                ManualResolution::UseServer => {
                    let snapshot = operation
                        .server_snapshot
                        .as_ref()
                        .ok_or(SyncError::MissingSnapshot(id))?;
                    operation.payload = snapshot.payload.clone();
                }
                ManualResolution::Merge => {
                    let merged = merged_payload.ok_or(SyncError::MissingMergedPayload)?;
                    operation.payload = merged;
                }
            }

            operation.status = SyncStatus::Synced;
            operation.server_snapshot = None;
            operation.synced_at = Some(now);
            operation.clone()
        };

        tracing::info!(
            operation = %id,
            resolution = resolution.as_str(),
            "conflict resolved manually"
        );
        self.notify_synced(id, resolved.client_id, now);
        Ok(resolved)
    }

    /// Requeue a failed operation for another sync attempt. The retry count
    /// is kept; it records how many attempts the operation has burned.
    pub fn retry_failed(&self, id: OperationId) -> Result<OfflineOperation, SyncError> {
        let mut operation = self
            .operations
            .get_mut(&id)
            .ok_or(SyncError::UnknownOperation(id))?;
        if operation.status != SyncStatus::Failed {
            return Err(SyncError::NotRetryable(id));
        }
        operation.status = SyncStatus::Pending;
        Ok(operation.clone())
    }

    /// Archive synced operations older than `retention`. Returns the number
    /// removed.
    pub fn clear_synced(&self, retention: Duration) -> usize {
        self.clear_synced_at(retention, Utc::now())
    }

    /// [`clear_synced`](Self::clear_synced) against an explicit clock
    /// reading.
    pub fn clear_synced_at(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - retention;
        let mut removed = 0;
        self.operations.retain(|_, operation| {
            let expired = operation.status == SyncStatus::Synced
                && operation.synced_at.is_some_and(|at| at <= cutoff);
            if expired {
                removed += 1;
            }
            !expired
        });
        if removed > 0 {
            tracing::info!(removed, "cleared synced offline operations");
        }
        removed
    }

    /// Set the default automatic-resolution policy applied by
    /// [`sync_operation`](Self::sync_operation).
    pub fn set_conflict_strategy(&self, strategy: ConflictStrategy) {
        *self.strategy.lock().expect("strategy lock poisoned") = strategy;
        tracing::info!(strategy = strategy.as_str(), "conflict strategy changed");
    }

    pub fn conflict_strategy(&self) -> ConflictStrategy {
        *self.strategy.lock().expect("strategy lock poisoned")
    }

    fn resolve(
        &self,
        id: OperationId,
        client_id: ClientId,
        client_timestamp: DateTime<Utc>,
        client_payload: Value,
        state: ServerState,
        now: DateTime<Utc>,
    ) -> SyncResult {
        let strategy = self.conflict_strategy();
        let applied = match strategy {
            ConflictStrategy::ClientWins => Some(AppliedResolution::ClientWins),
            ConflictStrategy::ServerWins => Some(AppliedResolution::ServerWins),
            ConflictStrategy::LastWriteWins => {
                if client_timestamp > state.last_modified {
                    Some(AppliedResolution::ClientWinsLww)
                } else {
                    Some(AppliedResolution::ServerWinsLww)
                }
            }
            // Merge has no automatic merge logic; like Manual it defers to
            // an operator.
            ConflictStrategy::Manual | ConflictStrategy::Merge => None,
        };

        match applied {
            Some(resolution) => {
                let server_payload = matches!(
                    resolution,
                    AppliedResolution::ServerWins | AppliedResolution::ServerWinsLww
                );
                self.mark_synced(
                    id,
                    server_payload.then(|| state.payload.clone()),
                    now,
                );
                tracing::warn!(
                    operation = %id,
                    strategy = strategy.as_str(),
                    resolution = resolution.as_str(),
                    "conflict resolved automatically"
                );
                self.notify_synced(id, client_id, now);
                SyncResult {
                    operation_id: id,
                    outcome: SyncOutcome::Resolved {
                        resolution,
                        client_payload,
                        server_snapshot: state,
                    },
                }
            }
            None => {
                if let Some(mut operation) = self.operations.get_mut(&id) {
                    operation.status = SyncStatus::Conflict;
                    operation.server_snapshot = Some(state.clone());
                }
                tracing::warn!(
                    operation = %id,
                    strategy = strategy.as_str(),
                    "conflict detected, awaiting manual resolution"
                );
                if let Some(bus) = &self.bus {
                    bus.publish(ResilienceEvent::ConflictDetected {
                        operation_id: id,
                        client_id,
                        at: now,
                    });
                }
                SyncResult {
                    operation_id: id,
                    outcome: SyncOutcome::Conflict {
                        client_payload,
                        server_snapshot: state,
                    },
                }
            }
        }
    }

    fn mark_synced(&self, id: OperationId, new_payload: Option<Value>, now: DateTime<Utc>) {
        if let Some(mut operation) = self.operations.get_mut(&id) {
            if let Some(payload) = new_payload {
                operation.payload = payload;
            }
            operation.status = SyncStatus::Synced;
            operation.server_snapshot = None;
            operation.synced_at = Some(now);
        }
    }

    fn notify_synced(&self, id: OperationId, client_id: ClientId, now: DateTime<Utc>) {
        if let Some(bus) = &self.bus {
            bus.publish(ResilienceEvent::SyncCompleted {
                operation_id: id,
                client_id,
                at: now,
            });
        }
    }

    fn operations_with_status(
        &self,
        client_id: ClientId,
        status: SyncStatus,
    ) -> Vec<OfflineOperation> {
        let mut out: Vec<OfflineOperation> = self
            .operations
            .iter()
            .filter(|op| op.client_id == client_id && op.status == status)
            .map(|op| op.value().clone())
            .collect();
        out.sort_by_key(|op| (op.client_timestamp, op.id));
        out
    }
}

fn failure(id: OperationId, error: impl Into<String>) -> SyncResult {
    SyncResult {
        operation_id: id,
        outcome: SyncOutcome::Failed {
            error: error.into(),
        },
    }
}
