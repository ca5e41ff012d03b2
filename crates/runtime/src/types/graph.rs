//! Graph entity records persisted by the memory aggregator.
//!
//! Only the parent-to-child direction of a relationship is stored; the
//! inverse is a query. All records carry the bitemporal quadruple when
//! written, managed by the repository layer.

use serde::{Deserialize, Serialize};

use super::{NodeId, SessionId};

/// Node labels in the memory graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeLabel {
    Session,
    Turn,
    Reasoning,
    ToolCall,
    DiffHunk,
    CodeArtifact,
    VfsSnapshot,
    File,
}

impl NodeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "Session",
            Self::Turn => "Turn",
            Self::Reasoning => "Reasoning",
            Self::ToolCall => "ToolCall",
            Self::DiffHunk => "DiffHunk",
            Self::CodeArtifact => "CodeArtifact",
            Self::VfsSnapshot => "VFSSnapshot",
            Self::File => "File",
        }
    }
}

/// Reference to a payload that may have been externalized to blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PayloadRef {
    Inline(String),
    Blob(String),
}

impl PayloadRef {
    pub fn blob_uri(&self) -> Option<&str> {
        match self {
            Self::Blob(uri) => Some(uri),
            Self::Inline(_) => None,
        }
    }

    pub fn inline(&self) -> Option<&str> {
        match self {
            Self::Inline(text) => Some(text),
            Self::Blob(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub started_at: i64,
    pub last_event_at: i64,
    pub title: Option<String>,
    pub user_id: Option<String>,
    pub preview: Option<String>,
}

/// Who or what closed a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnClosedBy {
    Usage,
    RoleFlip,
    IdleTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: NodeId,
    pub session_id: SessionId,
    pub ordinal: u32,
    pub role: String,
    pub summary: Option<String>,
    pub closed_by: Option<TurnClosedBy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRecord {
    pub id: NodeId,
    pub turn_id: NodeId,
    pub text: PayloadRef,
    pub order: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: NodeId,
    pub turn_id: NodeId,
    pub call_id: String,
    pub tool_name: String,
    pub input: PayloadRef,
    pub result: Option<PayloadRef>,
    pub status: ToolCallStatus,
    /// File paths this call touched, for `TOUCHES` edges.
    pub touches: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffHunkRecord {
    pub id: NodeId,
    pub turn_id: NodeId,
    pub session_id: SessionId,
    pub file_path: Option<String>,
    pub patch: Option<PayloadRef>,
    pub vt_start: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: NodeId,
    pub session_id: SessionId,
    pub blob_uri: String,
    pub vt: i64,
}

/// Durable notification published after every node write, consumed by the
/// indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCreated {
    pub node_type: NodeLabel,
    pub session_id: SessionId,
    pub node_id: NodeId,
    /// Inline content when it fits; otherwise `payload_ref` holds a blob URI.
    pub content: Option<String>,
    pub payload_ref: Option<String>,
    pub file_path: Option<String>,
    pub timestamp: i64,
}
