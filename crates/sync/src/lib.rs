//! `reliefgrid-sync` — offline-first synchronization with conflict
//! detection.
//!
//! Clients record mutations while disconnected; after reconnection the
//! queued operations are pushed here and reconciled against authoritative
//! server state before collaborators persist them. Conflict detection is
//! strictly time-based: a conflict exists when the server's last-modified
//! time is later than the operation's client timestamp. That rule is simple
//! and fragile under clock skew between client and server; the carried
//! server snapshot includes a revision counter for integrators that need a
//! skew-proof comparison.
//!
//! A conflict is not an error. It is a terminal-pending state that stays
//! visible to operators until resolved, and neither side's data is ever
//! silently discarded.

pub mod engine;
pub mod operation;
pub mod provider;
pub mod strategy;

pub use engine::{SyncBatchResult, SyncEngine, SyncError, SyncOutcome, SyncResult};
pub use operation::{OfflineOperation, OperationDraft, OperationKind, SyncStatus};
pub use provider::{InMemoryServerStateProvider, ProviderError, ServerState, ServerStateProvider};
pub use strategy::{AppliedResolution, ConflictStrategy, ManualResolution};
