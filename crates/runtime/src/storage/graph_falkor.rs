//! FalkorDB graph backend.
//!
//! FalkorDB speaks the RESP protocol; Cypher goes through `GRAPH.QUERY`.
//! Queries are parameterized with a `CYPHER k=v ...` prefix and written to
//! return scalar columns only, so reply decoding never has to reconstruct
//! node objects. One logical graph name per deployment.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::graph::{sort_diffs, GraphRepository, UpsertOutcome};
use crate::types::{
    DiffHunkRecord, NodeId, PayloadRef, ReasoningRecord, SessionId, SessionRecord, SnapshotRecord,
    StorageError, ToolCallRecord, ToolCallStatus, TurnClosedBy, TurnRecord, OPEN_END_MS,
};

fn map_redis_error(e: redis::RedisError) -> StorageError {
    if e.is_timeout() {
        StorageError::Timeout(e.to_string())
    } else if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
        StorageError::ConnectionFailed(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

/// Scalar cell in a query result row.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphValue {
    Null,
    Int(i64),
    Double(f64),
    Text(String),
}

impl GraphValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        self.as_str().and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// Cypher parameter value.
#[derive(Debug, Clone)]
pub enum Param {
    Int(i64),
    Text(String),
    Null,
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Param {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

fn escape_cypher_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

fn render_params(params: &BTreeMap<&str, Param>) -> String {
    if params.is_empty() {
        return String::new();
    }
    let mut prefix = String::from("CYPHER ");
    for (name, value) in params {
        match value {
            Param::Int(i) => prefix.push_str(&format!("{name}={i} ")),
            Param::Text(s) => prefix.push_str(&format!("{name}='{}' ", escape_cypher_string(s))),
            Param::Null => prefix.push_str(&format!("{name}=null ")),
        }
    }
    prefix
}

/// Thin parameterized-Cypher client over RESP.
pub struct GraphClient {
    url: String,
    graph_name: String,
    manager: Mutex<Option<ConnectionManager>>,
    connected: AtomicBool,
}

impl GraphClient {
    pub fn new(url: impl Into<String>, graph_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            graph_name: graph_name.into(),
            manager: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub async fn connect(&self) -> Result<(), StorageError> {
        let mut guard = self.manager.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(map_redis_error)?;
        *guard = Some(manager);
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(url = %self.url, graph = %self.graph_name, "Graph store connected");
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), StorageError> {
        self.connected.store(false, Ordering::SeqCst);
        self.manager.lock().await.take();
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Run a Cypher query, returning scalar rows.
    pub async fn query(
        &self,
        cypher: &str,
        params: &BTreeMap<&str, Param>,
    ) -> Result<Vec<Vec<GraphValue>>, StorageError> {
        let mut conn = self
            .manager
            .lock()
            .await
            .clone()
            .ok_or(StorageError::NotConnected)?;
        let full = format!("{}{}", render_params(params), cypher);
        let reply: Value = redis::cmd("GRAPH.QUERY")
            .arg(&self.graph_name)
            .arg(&full)
            .arg("--compact")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(parse_result_set(&reply))
    }
}

/// Decode a `GRAPH.QUERY --compact` reply into scalar rows.
///
/// Compact replies are `[header, rows, stats]` for read queries and
/// `[stats]` for pure writes. Each compact cell is a `[type, value]` pair;
/// only scalar types appear because our queries return properties, never
/// whole nodes.
fn parse_result_set(reply: &Value) -> Vec<Vec<GraphValue>> {
    let Value::Array(sections) = reply else {
        return Vec::new();
    };
    if sections.len() < 3 {
        return Vec::new();
    }
    let Some(Value::Array(rows)) = sections.get(1) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| match row {
            Value::Array(cells) => Some(cells.iter().map(parse_compact_cell).collect()),
            _ => None,
        })
        .collect()
}

// Compact scalar type tags used by FalkorDB/RedisGraph.
const T_NULL: i64 = 1;
const T_STRING: i64 = 2;
const T_INTEGER: i64 = 3;
const T_BOOLEAN: i64 = 4;
const T_DOUBLE: i64 = 5;

fn parse_compact_cell(cell: &Value) -> GraphValue {
    let Value::Array(pair) = cell else {
        return parse_plain_cell(cell);
    };
    let (Some(tag), Some(raw)) = (pair.first(), pair.get(1)) else {
        return GraphValue::Null;
    };
    let Value::Int(tag) = tag else {
        return parse_plain_cell(cell);
    };
    match *tag {
        T_NULL => GraphValue::Null,
        T_STRING => match raw {
            Value::BulkString(b) => GraphValue::Text(String::from_utf8_lossy(b).into_owned()),
            Value::SimpleString(s) => GraphValue::Text(s.clone()),
            _ => GraphValue::Null,
        },
        T_INTEGER => match raw {
            Value::Int(i) => GraphValue::Int(*i),
            _ => GraphValue::Null,
        },
        T_BOOLEAN => match raw {
            Value::BulkString(b) => GraphValue::Int(i64::from(b == b"true")),
            Value::Int(i) => GraphValue::Int(*i),
            _ => GraphValue::Null,
        },
        T_DOUBLE => match raw {
            Value::BulkString(b) => String::from_utf8_lossy(b)
                .parse()
                .map(GraphValue::Double)
                .unwrap_or(GraphValue::Null),
            Value::Double(d) => GraphValue::Double(*d),
            _ => GraphValue::Null,
        },
        _ => GraphValue::Null,
    }
}

fn parse_plain_cell(cell: &Value) -> GraphValue {
    match cell {
        Value::Nil => GraphValue::Null,
        Value::Int(i) => GraphValue::Int(*i),
        Value::Double(d) => GraphValue::Double(*d),
        Value::BulkString(b) => GraphValue::Text(String::from_utf8_lossy(b).into_owned()),
        Value::SimpleString(s) => GraphValue::Text(s.clone()),
        _ => GraphValue::Null,
    }
}

fn payload_ref_to_columns(p: &PayloadRef) -> (Param, Param) {
    match p {
        PayloadRef::Inline(text) => (Param::Text(text.clone()), Param::Null),
        PayloadRef::Blob(uri) => (Param::Null, Param::Text(uri.clone())),
    }
}

fn payload_ref_from_columns(inline: &GraphValue, blob: &GraphValue) -> Option<PayloadRef> {
    if let Some(uri) = blob.as_str() {
        return Some(PayloadRef::Blob(uri.to_string()));
    }
    inline.as_str().map(|s| PayloadRef::Inline(s.to_string()))
}

/// `GraphRepository` over FalkorDB.
pub struct FalkorGraph {
    client: GraphClient,
}

impl FalkorGraph {
    pub fn new(url: impl Into<String>, graph_name: impl Into<String>) -> Self {
        Self {
            client: GraphClient::new(url, graph_name),
        }
    }

    pub fn client(&self) -> &GraphClient {
        &self.client
    }

    /// MERGE-style upsert: no-op when the open version's fingerprint
    /// matches, otherwise close it and append a new version. `props_cypher`
    /// renders the property map from the bound params.
    async fn versioned_upsert(
        &self,
        label: &str,
        id: &str,
        props_cypher: &str,
        mut params: BTreeMap<&'static str, Param>,
        at: i64,
    ) -> Result<UpsertOutcome, StorageError> {
        params.insert("id", Param::Text(id.to_string()));
        params.insert("now", Param::Int(at));
        params.insert("open_end", Param::Int(OPEN_END_MS));

        // Fetch the open version's fingerprint to decide between no-op,
        // create, and correction.
        let existing = self
            .client
            .query(
                &format!(
                    "MATCH (n:{label} {{id: $id}}) WHERE n.tt_end = $open_end \
                     RETURN n.fingerprint"
                ),
                &params,
            )
            .await?;

        let fingerprint = fingerprint_of(&params);
        params.insert("fingerprint", Param::Text(fingerprint.clone()));

        if let Some(row) = existing.first() {
            if row.first().and_then(|v| v.as_str()) == Some(fingerprint.as_str()) {
                return Ok(UpsertOutcome::Unchanged);
            }
            self.client
                .query(
                    &format!(
                        "MATCH (n:{label} {{id: $id}}) WHERE n.tt_end = $open_end \
                         SET n.tt_end = $now"
                    ),
                    &params,
                )
                .await?;
            self.client
                .query(
                    &format!(
                        "CREATE (n:{label} {{id: $id, fingerprint: $fingerprint, \
                         vt_start: $now, vt_end: $open_end, tt_start: $now, tt_end: $open_end{props_cypher}}})"
                    ),
                    &params,
                )
                .await?;
            return Ok(UpsertOutcome::Corrected);
        }

        self.client
            .query(
                &format!(
                    "CREATE (n:{label} {{id: $id, fingerprint: $fingerprint, \
                     vt_start: $now, vt_end: $open_end, tt_start: $now, tt_end: $open_end{props_cypher}}})"
                ),
                &params,
            )
            .await?;
        Ok(UpsertOutcome::Created)
    }

    async fn link(
        &self,
        parent_label: &str,
        parent_id: &str,
        rel: &str,
        child_label: &str,
        child_id: &str,
        at: i64,
    ) -> Result<(), StorageError> {
        let mut params = BTreeMap::new();
        params.insert("pid", Param::Text(parent_id.to_string()));
        params.insert("cid", Param::Text(child_id.to_string()));
        params.insert("now", Param::Int(at));
        params.insert("open_end", Param::Int(OPEN_END_MS));
        self.client
            .query(
                &format!(
                    "MATCH (p:{parent_label} {{id: $pid}}), (c:{child_label} {{id: $cid}}) \
                     WHERE p.tt_end = $open_end AND c.tt_end = $open_end \
                     MERGE (p)-[r:{rel}]->(c) \
                     ON CREATE SET r.vt_start = $now, r.vt_end = $open_end, \
                                   r.tt_start = $now, r.tt_end = $open_end"
                ),
                &params,
            )
            .await?;
        Ok(())
    }
}

/// Deterministic content fingerprint over the bound property params.
fn fingerprint_of(params: &BTreeMap<&'static str, Param>) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for (name, value) in params {
        if matches!(*name, "now" | "open_end" | "fingerprint") {
            continue;
        }
        hasher.update(name.as_bytes());
        match value {
            Param::Int(i) => hasher.update(i.to_be_bytes()),
            Param::Text(s) => hasher.update(s.as_bytes()),
            Param::Null => hasher.update([0u8]),
        }
        hasher.update([0xff]);
    }
    hex::encode(&hasher.finalize()[..16])
}

#[async_trait]
impl GraphRepository for FalkorGraph {
    async fn connect(&self) -> Result<(), StorageError> {
        self.client.connect().await
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.client.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    async fn upsert_session(
        &self,
        record: &SessionRecord,
        at: i64,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut params: BTreeMap<&'static str, Param> = BTreeMap::new();
        params.insert("started_at", Param::Int(record.started_at));
        params.insert("last_event_at", Param::Int(record.last_event_at));
        params.insert("title", record.title.clone().into());
        params.insert("user_id", record.user_id.clone().into());
        params.insert("preview", record.preview.clone().into());
        self.versioned_upsert(
            "Session",
            &record.id.to_string(),
            ", started_at: $started_at, last_event_at: $last_event_at, \
             title: $title, user_id: $user_id, preview: $preview",
            params,
            at,
        )
        .await
    }

    async fn upsert_turn(
        &self,
        record: &TurnRecord,
        at: i64,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut params: BTreeMap<&'static str, Param> = BTreeMap::new();
        params.insert("session_id", Param::Text(record.session_id.to_string()));
        params.insert("ordinal", record.ordinal.into());
        params.insert("role", record.role.clone().into());
        params.insert("summary", record.summary.clone().into());
        params.insert(
            "closed_by",
            record
                .closed_by
                .map(|c| match c {
                    TurnClosedBy::Usage => "usage",
                    TurnClosedBy::RoleFlip => "role_flip",
                    TurnClosedBy::IdleTimeout => "idle_timeout",
                })
                .into(),
        );
        let outcome = self
            .versioned_upsert(
                "Turn",
                &record.id.to_string(),
                ", session_id: $session_id, ordinal: $ordinal, role: $role, \
                 summary: $summary, closed_by: $closed_by",
                params,
                at,
            )
            .await?;
        if outcome == UpsertOutcome::Created {
            self.link(
                "Session",
                &record.session_id.to_string(),
                "HAS_TURN",
                "Turn",
                &record.id.to_string(),
                at,
            )
            .await?;
        }
        Ok(outcome)
    }

    async fn append_reasoning(
        &self,
        record: &ReasoningRecord,
        at: i64,
    ) -> Result<UpsertOutcome, StorageError> {
        let (text, text_ref) = payload_ref_to_columns(&record.text);
        let mut params: BTreeMap<&'static str, Param> = BTreeMap::new();
        params.insert("turn_id", Param::Text(record.turn_id.to_string()));
        params.insert("text", text);
        params.insert("text_ref", text_ref);
        params.insert("ord", record.order.into());
        let outcome = self
            .versioned_upsert(
                "Reasoning",
                &record.id.to_string(),
                ", turn_id: $turn_id, text: $text, text_ref: $text_ref, ord: $ord",
                params,
                at,
            )
            .await?;
        if outcome == UpsertOutcome::Created {
            self.link(
                "Turn",
                &record.turn_id.to_string(),
                "HAS_REASONING",
                "Reasoning",
                &record.id.to_string(),
                at,
            )
            .await?;
        }
        Ok(outcome)
    }

    async fn upsert_tool_call(
        &self,
        record: &ToolCallRecord,
        at: i64,
    ) -> Result<UpsertOutcome, StorageError> {
        let (input, input_ref) = payload_ref_to_columns(&record.input);
        let (result, result_ref) = record
            .result
            .as_ref()
            .map(payload_ref_to_columns)
            .unwrap_or((Param::Null, Param::Null));
        let mut params: BTreeMap<&'static str, Param> = BTreeMap::new();
        params.insert("turn_id", Param::Text(record.turn_id.to_string()));
        params.insert("call_id", Param::Text(record.call_id.clone()));
        params.insert("tool_name", record.tool_name.clone().into());
        params.insert("input", input);
        params.insert("input_ref", input_ref);
        params.insert("result", result);
        params.insert("result_ref", result_ref);
        params.insert(
            "status",
            Param::Text(
                match record.status {
                    ToolCallStatus::Pending => "pending",
                    ToolCallStatus::Succeeded => "succeeded",
                    ToolCallStatus::Failed => "failed",
                }
                .to_string(),
            ),
        );
        let outcome = self
            .versioned_upsert(
                "ToolCall",
                &record.id.to_string(),
                ", turn_id: $turn_id, call_id: $call_id, tool_name: $tool_name, \
                 input: $input, input_ref: $input_ref, result: $result, \
                 result_ref: $result_ref, status: $status",
                params,
                at,
            )
            .await?;
        if outcome == UpsertOutcome::Created {
            self.link(
                "Turn",
                &record.turn_id.to_string(),
                "HAS_TOOLCALL",
                "ToolCall",
                &record.id.to_string(),
                at,
            )
            .await?;
            for path in &record.touches {
                let mut params = BTreeMap::new();
                params.insert("cid", Param::Text(record.id.to_string()));
                params.insert("path", Param::Text(path.clone()));
                params.insert("now", Param::Int(at));
                params.insert("open_end", Param::Int(OPEN_END_MS));
                self.client
                    .query(
                        "MERGE (f:File {path: $path}) \
                         ON CREATE SET f.vt_start = $now, f.vt_end = $open_end, \
                                       f.tt_start = $now, f.tt_end = $open_end \
                         WITH f MATCH (c:ToolCall {id: $cid}) WHERE c.tt_end = $open_end \
                         MERGE (c)-[r:TOUCHES]->(f) \
                         ON CREATE SET r.vt_start = $now, r.vt_end = $open_end, \
                                       r.tt_start = $now, r.tt_end = $open_end",
                        &params,
                    )
                    .await?;
            }
        }
        Ok(outcome)
    }

    async fn complete_tool_call(
        &self,
        session_id: SessionId,
        call_id: &str,
        result: PayloadRef,
        status: ToolCallStatus,
        at: i64,
    ) -> Result<Option<NodeId>, StorageError> {
        let mut params = BTreeMap::new();
        params.insert("session_id", Param::Text(session_id.to_string()));
        params.insert("call_id", Param::Text(call_id.to_string()));
        params.insert("open_end", Param::Int(OPEN_END_MS));
        let rows = self
            .client
            .query(
                "MATCH (s:Session {id: $session_id})-[:HAS_TURN]->(:Turn)\
                 -[:HAS_TOOLCALL]->(c:ToolCall {call_id: $call_id}) \
                 WHERE c.tt_end = $open_end \
                 RETURN c.id, c.turn_id, c.tool_name, c.input, c.input_ref",
                &params,
            )
            .await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let id = row
            .first()
            .and_then(|v| v.as_uuid())
            .map(NodeId)
            .ok_or_else(|| StorageError::Serialization("tool call id".into()))?;
        let turn_id = row
            .get(1)
            .and_then(|v| v.as_uuid())
            .map(NodeId)
            .ok_or_else(|| StorageError::Serialization("tool call turn_id".into()))?;
        let record = ToolCallRecord {
            id,
            turn_id,
            call_id: call_id.to_string(),
            tool_name: row
                .get(2)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            input: row
                .get(3)
                .zip(row.get(4))
                .and_then(|(inline, blob)| payload_ref_from_columns(inline, blob))
                .unwrap_or(PayloadRef::Inline(String::new())),
            result: Some(result),
            status,
            touches: vec![],
        };
        self.upsert_tool_call(&record, at).await?;
        Ok(Some(id))
    }

    async fn append_diff(
        &self,
        record: &DiffHunkRecord,
        at: i64,
    ) -> Result<UpsertOutcome, StorageError> {
        let (patch, patch_ref) = record
            .patch
            .as_ref()
            .map(payload_ref_to_columns)
            .unwrap_or((Param::Null, Param::Null));
        let mut params: BTreeMap<&'static str, Param> = BTreeMap::new();
        params.insert("turn_id", Param::Text(record.turn_id.to_string()));
        params.insert("session_id", Param::Text(record.session_id.to_string()));
        params.insert("file_path", record.file_path.clone().into());
        params.insert("patch", patch);
        params.insert("patch_ref", patch_ref);
        params.insert("diff_vt", Param::Int(record.vt_start));
        let outcome = self
            .versioned_upsert(
                "DiffHunk",
                &record.id.to_string(),
                ", turn_id: $turn_id, session_id: $session_id, file_path: $file_path, \
                 patch: $patch, patch_ref: $patch_ref, diff_vt: $diff_vt",
                params,
                at,
            )
            .await?;
        if outcome == UpsertOutcome::Created {
            self.link(
                "Turn",
                &record.turn_id.to_string(),
                "HAS_DIFF",
                "DiffHunk",
                &record.id.to_string(),
                at,
            )
            .await?;
            if let Some(path) = &record.file_path {
                let mut params = BTreeMap::new();
                params.insert("did", Param::Text(record.id.to_string()));
                params.insert("path", Param::Text(path.clone()));
                params.insert("now", Param::Int(at));
                params.insert("open_end", Param::Int(OPEN_END_MS));
                self.client
                    .query(
                        "MERGE (f:File {path: $path}) \
                         ON CREATE SET f.vt_start = $now, f.vt_end = $open_end, \
                                       f.tt_start = $now, f.tt_end = $open_end \
                         WITH f MATCH (d:DiffHunk {id: $did}) WHERE d.tt_end = $open_end \
                         MERGE (d)-[r:MODIFIES]->(f) \
                         ON CREATE SET r.vt_start = $now, r.vt_end = $open_end, \
                                       r.tt_start = $now, r.tt_end = $open_end",
                        &params,
                    )
                    .await?;
            }
        }
        Ok(outcome)
    }

    async fn record_snapshot(
        &self,
        record: &SnapshotRecord,
        at: i64,
    ) -> Result<(), StorageError> {
        let mut params: BTreeMap<&'static str, Param> = BTreeMap::new();
        params.insert("session_id", Param::Text(record.session_id.to_string()));
        params.insert("blob_uri", Param::Text(record.blob_uri.clone()));
        params.insert("snapshot_vt", Param::Int(record.vt));
        self.versioned_upsert(
            "VFSSnapshot",
            &record.id.to_string(),
            ", session_id: $session_id, blob_uri: $blob_uri, snapshot_vt: $snapshot_vt",
            params,
            at,
        )
        .await?;
        Ok(())
    }

    async fn session(&self, id: SessionId) -> Result<Option<SessionRecord>, StorageError> {
        let mut params = BTreeMap::new();
        params.insert("id", Param::Text(id.to_string()));
        params.insert("open_end", Param::Int(OPEN_END_MS));
        let rows = self
            .client
            .query(
                "MATCH (s:Session {id: $id}) WHERE s.tt_end = $open_end \
                 RETURN s.started_at, s.last_event_at, s.title, s.user_id, s.preview",
                &params,
            )
            .await?;
        Ok(rows.first().map(|row| SessionRecord {
            id,
            started_at: row.first().and_then(|v| v.as_i64()).unwrap_or_default(),
            last_event_at: row.get(1).and_then(|v| v.as_i64()).unwrap_or_default(),
            title: row.get(2).and_then(|v| v.as_str()).map(String::from),
            user_id: row.get(3).and_then(|v| v.as_str()).map(String::from),
            preview: row.get(4).and_then(|v| v.as_str()).map(String::from),
        }))
    }

    async fn max_turn_ordinal(&self, session_id: SessionId) -> Result<Option<u32>, StorageError> {
        let mut params = BTreeMap::new();
        params.insert("session_id", Param::Text(session_id.to_string()));
        params.insert("open_end", Param::Int(OPEN_END_MS));
        let rows = self
            .client
            .query(
                "MATCH (t:Turn {session_id: $session_id}) WHERE t.tt_end = $open_end \
                 RETURN max(t.ordinal)",
                &params,
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.as_i64())
            .map(|v| v.max(0) as u32))
    }

    async fn turns_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<TurnRecord>, StorageError> {
        let mut params = BTreeMap::new();
        params.insert("session_id", Param::Text(session_id.to_string()));
        params.insert("open_end", Param::Int(OPEN_END_MS));
        let rows = self
            .client
            .query(
                "MATCH (t:Turn {session_id: $session_id}) WHERE t.tt_end = $open_end \
                 RETURN t.id, t.ordinal, t.role, t.summary, t.closed_by \
                 ORDER BY t.ordinal",
                &params,
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(TurnRecord {
                    id: NodeId(row.first()?.as_uuid()?),
                    session_id,
                    ordinal: row.get(1)?.as_i64()?.max(0) as u32,
                    role: row.get(2)?.as_str().unwrap_or_default().to_string(),
                    summary: row.get(3).and_then(|v| v.as_str()).map(String::from),
                    closed_by: row.get(4).and_then(|v| v.as_str()).and_then(|s| match s {
                        "usage" => Some(TurnClosedBy::Usage),
                        "role_flip" => Some(TurnClosedBy::RoleFlip),
                        "idle_timeout" => Some(TurnClosedBy::IdleTimeout),
                        _ => None,
                    }),
                })
            })
            .collect())
    }

    async fn latest_snapshot_at(
        &self,
        session_id: SessionId,
        at: i64,
    ) -> Result<Option<SnapshotRecord>, StorageError> {
        let mut params = BTreeMap::new();
        params.insert("session_id", Param::Text(session_id.to_string()));
        params.insert("at", Param::Int(at));
        params.insert("open_end", Param::Int(OPEN_END_MS));
        let rows = self
            .client
            .query(
                "MATCH (s:VFSSnapshot {session_id: $session_id}) \
                 WHERE s.tt_end = $open_end AND s.snapshot_vt <= $at \
                 RETURN s.id, s.blob_uri, s.snapshot_vt \
                 ORDER BY s.snapshot_vt DESC LIMIT 1",
                &params,
            )
            .await?;
        Ok(rows.first().and_then(|row| {
            Some(SnapshotRecord {
                id: NodeId(row.first()?.as_uuid()?),
                session_id,
                blob_uri: row.get(1)?.as_str()?.to_string(),
                vt: row.get(2)?.as_i64()?,
            })
        }))
    }

    async fn diffs_between(
        &self,
        session_id: SessionId,
        after: i64,
        until: i64,
    ) -> Result<Vec<DiffHunkRecord>, StorageError> {
        let mut params = BTreeMap::new();
        params.insert("session_id", Param::Text(session_id.to_string()));
        params.insert("after", Param::Int(after));
        params.insert("until", Param::Int(until));
        params.insert("open_end", Param::Int(OPEN_END_MS));
        let rows = self
            .client
            .query(
                "MATCH (d:DiffHunk {session_id: $session_id}) \
                 WHERE d.tt_end = $open_end AND d.diff_vt > $after AND d.diff_vt <= $until \
                 RETURN d.id, d.turn_id, d.file_path, d.patch, d.patch_ref, d.diff_vt \
                 ORDER BY d.diff_vt, d.id",
                &params,
            )
            .await?;
        let mut diffs: Vec<DiffHunkRecord> = rows
            .iter()
            .filter_map(|row| {
                Some(DiffHunkRecord {
                    id: NodeId(row.first()?.as_uuid()?),
                    turn_id: NodeId(row.get(1)?.as_uuid()?),
                    session_id,
                    file_path: row.get(2).and_then(|v| v.as_str()).map(String::from),
                    patch: row
                        .get(3)
                        .zip(row.get(4))
                        .and_then(|(inline, blob)| payload_ref_from_columns(inline, blob)),
                    vt_start: row.get(5)?.as_i64()?,
                })
            })
            .collect();
        sort_diffs(&mut diffs);
        Ok(diffs)
    }

    async fn open_version_count(&self, id: NodeId) -> Result<usize, StorageError> {
        let mut params = BTreeMap::new();
        params.insert("id", Param::Text(id.to_string()));
        params.insert("open_end", Param::Int(OPEN_END_MS));
        let rows = self
            .client
            .query(
                "MATCH (n {id: $id}) WHERE n.tt_end = $open_end RETURN count(n)",
                &params,
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            .max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cypher_string_escaping() {
        assert_eq!(escape_cypher_string("it's"), "it\\'s");
        assert_eq!(escape_cypher_string("a\\b"), "a\\\\b");
        assert_eq!(escape_cypher_string("line\nbreak"), "line\\nbreak");
    }

    #[test]
    fn param_prefix_rendering() {
        let mut params = BTreeMap::new();
        params.insert("id", Param::Text("abc".into()));
        params.insert("n", Param::Int(7));
        let rendered = render_params(&params);
        assert!(rendered.starts_with("CYPHER "));
        assert!(rendered.contains("id='abc'"));
        assert!(rendered.contains("n=7"));
    }

    #[test]
    fn compact_cells_decode_scalars() {
        let cell = Value::Array(vec![Value::Int(T_STRING), Value::BulkString(b"x".to_vec())]);
        assert_eq!(parse_compact_cell(&cell), GraphValue::Text("x".into()));

        let cell = Value::Array(vec![Value::Int(T_INTEGER), Value::Int(42)]);
        assert_eq!(parse_compact_cell(&cell), GraphValue::Int(42));

        let cell = Value::Array(vec![Value::Int(T_NULL), Value::Nil]);
        assert_eq!(parse_compact_cell(&cell), GraphValue::Null);

        let cell = Value::Array(vec![
            Value::Int(T_DOUBLE),
            Value::BulkString(b"0.5".to_vec()),
        ]);
        assert_eq!(parse_compact_cell(&cell), GraphValue::Double(0.5));
    }

    #[test]
    fn fingerprint_ignores_temporal_params() {
        let mut a: BTreeMap<&'static str, Param> = BTreeMap::new();
        a.insert("title", Param::Text("t".into()));
        a.insert("now", Param::Int(1));
        let mut b = a.clone();
        b.insert("now", Param::Int(999));
        assert_eq!(fingerprint_of(&a), fingerprint_of(&b));

        b.insert("title", Param::Text("changed".into()));
        assert_ne!(fingerprint_of(&a), fingerprint_of(&b));
    }
}
