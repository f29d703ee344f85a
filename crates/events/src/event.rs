//! Events published by the resilience components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reliefgrid_core::{ClientId, OperationId};

/// An observable state change somewhere in the resilience layer.
///
/// Events are notifications, not commands: consumers must tolerate loss and
/// duplication, and no component behavior depends on anyone listening.
/// Circuit states are carried as their lowercase string labels so consumers
/// do not need the component crates on their dependency path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResilienceEvent {
    /// A named circuit moved between states.
    CircuitTransition {
        name: String,
        from: String,
        to: String,
        at: DateTime<Utc>,
    },
    /// A rate-limit check rejected a caller.
    RateLimitExceeded {
        limit: String,
        key: String,
        at: DateTime<Utc>,
    },
    /// An offline operation reached `Synced` (automatically or manually).
    SyncCompleted {
        operation_id: OperationId,
        client_id: ClientId,
        at: DateTime<Utc>,
    },
    /// An offline operation entered `Conflict` and awaits manual resolution.
    ConflictDetected {
        operation_id: OperationId,
        client_id: ClientId,
        at: DateTime<Utc>,
    },
}
