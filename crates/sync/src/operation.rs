//! Queued offline mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use reliefgrid_core::{ClientId, EntityRef, OperationId};

use crate::provider::ServerState;

/// What the client did while offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

/// Where an operation sits in the sync lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Conflict,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Failed => "failed",
        }
    }
}

/// Client-supplied fields of a mutation to queue.
///
/// The payload is opaque at this layer: the engine compares timestamps and
/// identity, never payload contents. Payload validation belongs to the
/// collaborator that eventually persists the data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDraft {
    pub client_id: ClientId,
    pub entity: EntityRef,
    pub kind: OperationKind,
    pub payload: Value,
    pub client_timestamp: DateTime<Utc>,
}

/// A mutation recorded by a disconnected client, queued for reconciliation.
///
/// Invariant: `server_snapshot` is present exactly while `status` is
/// [`SyncStatus::Conflict`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineOperation {
    pub id: OperationId,
    pub client_id: ClientId,
    pub entity: EntityRef,
    pub kind: OperationKind,
    pub payload: Value,
    pub client_timestamp: DateTime<Utc>,
    pub status: SyncStatus,
    pub retry_count: u32,
    pub server_snapshot: Option<ServerState>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl OfflineOperation {
    pub(crate) fn new(draft: OperationDraft) -> Self {
        Self {
            id: OperationId::new(),
            client_id: draft.client_id,
            entity: draft.entity,
            kind: draft.kind,
            payload: draft.payload,
            client_timestamp: draft.client_timestamp,
            status: SyncStatus::Pending,
            retry_count: 0,
            server_snapshot: None,
            synced_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn new_operations_start_pending_with_zero_retries() {
        let draft = OperationDraft {
            client_id: ClientId::new(),
            entity: EntityRef::new("shelter", "s-1").unwrap(),
            kind: OperationKind::Update,
            payload: json!({"capacity": 120}),
            client_timestamp: Utc::now(),
        };

        let operation = OfflineOperation::new(draft);
        assert_eq!(operation.status, SyncStatus::Pending);
        assert_eq!(operation.retry_count, 0);
        assert!(operation.server_snapshot.is_none());
        assert!(operation.synced_at.is_none());
    }

    #[test]
    fn statuses_serialize_lowercase() {
        assert_eq!(
            serde_json::to_value(SyncStatus::Conflict).unwrap(),
            serde_json::Value::String("conflict".to_string())
        );
        assert_eq!(SyncStatus::Syncing.as_str(), "syncing");
        assert_eq!(OperationKind::Delete.as_str(), "delete");
    }
}
