//! Core identifiers and shared domain types.

pub mod bitemporal;
pub mod error;
pub mod event;
pub mod graph;

pub use bitemporal::{Bitemporal, OPEN_END_MS};
pub use error::*;
pub use event::{EventPayload, Provider, RawEvent, RawEventHeaders, TypedEvent};
pub use graph::*;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an ingested event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derive a deterministic child id from a parent event id and an index.
    ///
    /// Parsing one raw event can produce several typed events; each derived id
    /// is stable across redeliveries so downstream writes stay idempotent.
    pub fn derive(&self, index: u32) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hasher.update(index.to_be_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a persisted graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<EventId> for NodeId {
    fn from(id: EventId) -> Self {
        Self(id.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_event_ids_are_deterministic() {
        let parent = EventId::new();
        assert_eq!(parent.derive(0), parent.derive(0));
        assert_ne!(parent.derive(0), parent.derive(1));
        assert_ne!(parent.derive(0), parent);
    }

    #[test]
    fn session_id_parse_rejects_garbage() {
        assert!(SessionId::parse("not-a-uuid").is_none());
        assert!(SessionId::parse("2c3a47bc-7dcf-4f5a-9d3e-111111111111").is_some());
    }
}
