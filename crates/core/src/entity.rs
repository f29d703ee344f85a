//! References to business entities owned by collaborators.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Reference to an entity managed outside the resilience layer.
///
/// The sync engine never interprets entity payloads; it only needs a stable
/// key to look up authoritative state. Entity ids are kept as strings because
/// collaborators use heterogeneous id schemes (UUIDs, slugs, composite keys).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> CoreResult<Self> {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        if entity_type.is_empty() {
            return Err(CoreError::validation("entity_type must not be empty"));
        }
        if entity_id.is_empty() {
            return Err(CoreError::validation("entity_id must not be empty"));
        }
        Ok(Self {
            entity_type,
            entity_id,
        })
    }
}

impl core::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}
