//! Conflict resolution policies.

use serde::{Deserialize, Serialize};

/// Default policy the engine applies when it detects a conflict.
///
/// `Merge` is accepted as configuration but carries no automatic merge
/// logic: it always defers to manual resolution, exactly like `Manual`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    ClientWins,
    ServerWins,
    LastWriteWins,
    Manual,
    Merge,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ClientWins => "client_wins",
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::LastWriteWins => "last_write_wins",
            ConflictStrategy::Manual => "manual",
            ConflictStrategy::Merge => "merge",
        }
    }
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::LastWriteWins
    }
}

/// Three-way choice exposed to manual resolution callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualResolution {
    UseClient,
    UseServer,
    Merge,
}

impl ManualResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManualResolution::UseClient => "use_client",
            ManualResolution::UseServer => "use_server",
            ManualResolution::Merge => "merge",
        }
    }
}

/// How an automatic resolution was decided, carried in sync results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedResolution {
    ClientWins,
    ServerWins,
    ClientWinsLww,
    ServerWinsLww,
}

impl AppliedResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppliedResolution::ClientWins => "client_wins",
            AppliedResolution::ServerWins => "server_wins",
            AppliedResolution::ClientWinsLww => "client_wins_lww",
            AppliedResolution::ServerWinsLww => "server_wins_lww",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_resolution_serializes_to_the_wire_names() {
        assert_eq!(
            serde_json::to_value(ManualResolution::UseClient).unwrap(),
            serde_json::Value::String("use_client".to_string())
        );
        assert_eq!(
            serde_json::to_value(ManualResolution::UseServer).unwrap(),
            serde_json::Value::String("use_server".to_string())
        );
        assert_eq!(
            serde_json::to_value(ManualResolution::Merge).unwrap(),
            serde_json::Value::String("merge".to_string())
        );
    }

    #[test]
    fn default_strategy_is_last_write_wins() {
        assert_eq!(ConflictStrategy::default(), ConflictStrategy::LastWriteWins);
    }
}
