//! Memory aggregator.
//!
//! Consumes typed events per partition, maintains the turn FSM, performs
//! idempotent bitemporal graph writes, externalizes large payloads to blob
//! storage, and emits downstream notifications: a durable node-created
//! stream for the indexer and ephemeral session updates for UI subscribers.
//! Deliveries are acknowledged only after the graph write completes.

pub mod turns;

pub use turns::{TurnAction, TurnFsm, TurnState};

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::config::AggregatorConfig;
use crate::index::Deduplicator;
use crate::retry::RetryPolicy;
use crate::storage::pubsub::{session_updates_channel, PubSub, SESSIONS_UPDATES_CHANNEL};
use crate::storage::{
    BrokerRecord, GraphRepository, MessageBroker, BlobStore, DLQ_MEMORY, TOPIC_EVENTS_PARSED,
    TOPIC_NODES_CREATED, TOPIC_TURNS_FINALIZED,
};
use crate::types::{
    now_ms, AggregateError, DiffHunkRecord, EventPayload, NodeCreated, NodeId, NodeLabel,
    PayloadRef, ReasoningRecord, SessionId, SessionRecord, ToolCallRecord, ToolCallStatus,
    TurnClosedBy, TurnRecord, TypedEvent,
};

const TITLE_MAX: usize = 80;
const PREVIEW_MAX: usize = 160;
const SUMMARY_MAX: usize = 2_000;

fn truncated(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}…")
}

struct SessionState {
    fsm: TurnFsm,
    record: SessionRecord,
    /// Running transcript summary of the open turn.
    turn_summary: String,
    turn_role: String,
    reasoning_order: u32,
}

/// The aggregation service.
pub struct MemoryAggregator {
    graph: Arc<dyn GraphRepository>,
    blob: Arc<dyn BlobStore>,
    broker: Arc<dyn MessageBroker>,
    pubsub: Arc<dyn PubSub>,
    dedup: Option<Arc<Deduplicator>>,
    config: AggregatorConfig,
    sessions: DashMap<SessionId, SessionState>,
    retry: RetryPolicy,
}

impl MemoryAggregator {
    pub fn new(
        config: AggregatorConfig,
        graph: Arc<dyn GraphRepository>,
        blob: Arc<dyn BlobStore>,
        broker: Arc<dyn MessageBroker>,
        pubsub: Arc<dyn PubSub>,
        dedup: Option<Arc<Deduplicator>>,
    ) -> Self {
        Self {
            graph,
            blob,
            broker,
            pubsub,
            dedup,
            config,
            sessions: DashMap::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Externalize payloads above the inline threshold.
    async fn payload_ref(&self, text: &str) -> Result<PayloadRef, AggregateError> {
        if text.len() <= self.config.inline_payload_max {
            return Ok(PayloadRef::Inline(text.to_string()));
        }
        let uri = self
            .blob
            .save(text.as_bytes())
            .await
            .map_err(AggregateError::Blob)?;
        Ok(PayloadRef::Blob(uri))
    }

    /// Recover or create the in-memory state for a session.
    async fn session_state(
        &self,
        session_id: SessionId,
        at: i64,
    ) -> Result<(), AggregateError> {
        if self.sessions.contains_key(&session_id) {
            return Ok(());
        }
        let existing = self
            .graph
            .session(session_id)
            .await
            .map_err(AggregateError::Graph)?;
        let next_ordinal = match &existing {
            Some(_) => self
                .graph
                .max_turn_ordinal(session_id)
                .await
                .map_err(AggregateError::Graph)?
                .map(|o| o + 1)
                .unwrap_or(0),
            None => 0,
        };
        let record = existing.unwrap_or(SessionRecord {
            id: session_id,
            started_at: at,
            last_event_at: at,
            title: None,
            user_id: None,
            preview: None,
        });
        self.sessions.insert(
            session_id,
            SessionState {
                fsm: TurnFsm::new(next_ordinal),
                record,
                turn_summary: String::new(),
                turn_role: "user".to_string(),
                reasoning_order: 0,
            },
        );
        Ok(())
    }

    async fn publish_node_created(&self, notification: &NodeCreated) -> Result<(), AggregateError> {
        let bytes = serde_json::to_vec(notification).map_err(|e| AggregateError::InvalidEvent {
            session_id: notification.session_id,
            reason: e.to_string(),
        })?;
        self.broker
            .send(
                TOPIC_NODES_CREATED,
                vec![BrokerRecord::new(notification.session_id.to_string(), bytes)],
            )
            .await
            .map_err(AggregateError::Notify)?;

        let update = serde_json::json!({
            "type": "node.created",
            "node_type": notification.node_type.as_str(),
            "session_id": notification.session_id.to_string(),
            "node_id": notification.node_id.to_string(),
            "payload_ref": notification.payload_ref,
        });
        let session_channel = session_updates_channel(&notification.session_id.to_string());
        // Ephemeral updates are best-effort; a failed publish never fails
        // the write path.
        if let Err(e) = self.pubsub.publish(&session_channel, &update).await {
            tracing::debug!(error = %e, "Session update publish failed");
        }
        if let Err(e) = self.pubsub.publish(SESSIONS_UPDATES_CHANNEL, &update).await {
            tracing::debug!(error = %e, "Sessions update publish failed");
        }
        Ok(())
    }

    async fn emit_turn_finalized(
        &self,
        session_id: SessionId,
        turn_id: NodeId,
        ordinal: u32,
        closed_by: TurnClosedBy,
    ) -> Result<(), AggregateError> {
        let message = serde_json::json!({
            "type": "turn.finalized",
            "session_id": session_id.to_string(),
            "turn_id": turn_id.to_string(),
            "ordinal": ordinal,
            "closed_by": closed_by,
        });
        let bytes = serde_json::to_vec(&message).unwrap_or_default();
        self.broker
            .send(
                TOPIC_TURNS_FINALIZED,
                vec![BrokerRecord::new(session_id.to_string(), bytes)],
            )
            .await
            .map_err(AggregateError::Notify)?;
        let channel = session_updates_channel(&session_id.to_string());
        if let Err(e) = self.pubsub.publish(&channel, &message).await {
            tracing::debug!(error = %e, "Turn-finalized update publish failed");
        }
        Ok(())
    }

    async fn write_turn(
        &self,
        session_id: SessionId,
        turn_id: NodeId,
        ordinal: u32,
        role: &str,
        summary: Option<String>,
        closed_by: Option<TurnClosedBy>,
        at: i64,
    ) -> Result<(), AggregateError> {
        let record = TurnRecord {
            id: turn_id,
            session_id,
            ordinal,
            role: role.to_string(),
            summary,
            closed_by,
        };
        self.graph
            .upsert_turn(&record, at)
            .await
            .map_err(AggregateError::Graph)?;
        Ok(())
    }

    /// Process one typed event. Transient storage errors bubble up for the
    /// retry wrapper in the consume loop.
    pub async fn handle_event(&self, event: &TypedEvent) -> Result<(), AggregateError> {
        let session_id = event.session_id;
        let at = event.occurred_at_ms();
        self.session_state(session_id, at).await?;

        // Session bookkeeping first: title on first user message, preview on
        // assistant text, last_event_at always.
        let session_record = {
            let mut state = self
                .sessions
                .get_mut(&session_id)
                .expect("session state created above");
            state.record.last_event_at = at;
            match &event.payload {
                EventPayload::UserMessage { text } if state.record.title.is_none() => {
                    state.record.title = Some(truncated(text, TITLE_MAX));
                }
                EventPayload::AssistantText { text, .. } => {
                    state.record.preview = Some(truncated(text, PREVIEW_MAX));
                }
                _ => {}
            }
            state.record.clone()
        };
        self.graph
            .upsert_session(&session_record, at)
            .await
            .map_err(AggregateError::Graph)?;

        // Drive the FSM, collecting the turn actions while holding the
        // state lock, then perform writes without it.
        let actions = {
            let mut state = self.sessions.get_mut(&session_id).expect("state exists");
            state.fsm.on_event(event.id, &event.payload, at)
        };

        let mut current_turn: Option<NodeId> = None;
        for action in actions {
            match action {
                TurnAction::Open {
                    turn_id,
                    ordinal,
                    role,
                } => {
                    let summary = match &event.payload {
                        EventPayload::UserMessage { text } => Some(truncated(text, SUMMARY_MAX)),
                        _ => None,
                    };
                    {
                        let mut state =
                            self.sessions.get_mut(&session_id).expect("state exists");
                        // The transcript restarts empty; the message text
                        // itself is appended by the payload arm below.
                        state.turn_summary = String::new();
                        state.turn_role = role.clone();
                        state.reasoning_order = 0;
                    }
                    self.write_turn(session_id, turn_id, ordinal, &role, summary.clone(), None, at)
                        .await?;
                    self.publish_node_created(&NodeCreated {
                        node_type: NodeLabel::Turn,
                        session_id,
                        node_id: turn_id,
                        content: summary,
                        payload_ref: None,
                        file_path: None,
                        timestamp: at,
                    })
                    .await?;
                    current_turn = Some(turn_id);
                }
                TurnAction::AppendChild { turn_id } => {
                    current_turn = Some(turn_id);
                }
                TurnAction::Close {
                    turn_id,
                    ordinal,
                    closed_by,
                } => {
                    let (summary, role) = {
                        let state = self.sessions.get(&session_id).expect("state exists");
                        (
                            (!state.turn_summary.is_empty()).then(|| state.turn_summary.clone()),
                            state.turn_role.clone(),
                        )
                    };
                    self.write_turn(
                        session_id,
                        turn_id,
                        ordinal,
                        &role,
                        summary,
                        Some(closed_by),
                        at,
                    )
                    .await?;
                    self.emit_turn_finalized(session_id, turn_id, ordinal, closed_by)
                        .await?;
                }
            }
        }

        let Some(turn_id) = current_turn else {
            return Ok(());
        };

        match &event.payload {
            EventPayload::Reasoning { text } => {
                // Near-duplicate thoughts collapse onto the existing node.
                if let Some(dedup) = &self.dedup {
                    match dedup.find_duplicate(&session_id.to_string(), text).await {
                        Ok(Some(existing)) => {
                            tracing::debug!(existing = %existing, "Collapsed duplicate thought");
                            return Ok(());
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::debug!(error = %e, "Deduplication probe failed, writing anyway");
                        }
                    }
                }
                let order = {
                    let mut state = self.sessions.get_mut(&session_id).expect("state exists");
                    let order = state.reasoning_order;
                    state.reasoning_order += 1;
                    order
                };
                let record = ReasoningRecord {
                    id: NodeId::from(event.id),
                    turn_id,
                    text: self.payload_ref(text).await?,
                    order,
                };
                self.graph
                    .append_reasoning(&record, at)
                    .await
                    .map_err(AggregateError::Graph)?;
                self.publish_node_created(&NodeCreated {
                    node_type: NodeLabel::Reasoning,
                    session_id,
                    node_id: record.id,
                    content: record.text.inline().map(String::from),
                    payload_ref: record.text.blob_uri().map(String::from),
                    file_path: None,
                    timestamp: at,
                })
                .await?;
            }

            EventPayload::AssistantText { text, .. } | EventPayload::UserMessage { text } => {
                let summary = {
                    let mut state = self.sessions.get_mut(&session_id).expect("state exists");
                    if !state.turn_summary.is_empty() {
                        state.turn_summary.push('\n');
                    }
                    state.turn_summary.push_str(text);
                    if state.turn_summary.len() > SUMMARY_MAX {
                        state.turn_summary = truncated(&state.turn_summary.clone(), SUMMARY_MAX);
                    }
                    state.turn_summary.clone()
                };
                if matches!(event.payload, EventPayload::AssistantText { .. }) {
                    let (ordinal, role) = {
                        let state = self.sessions.get(&session_id).expect("state exists");
                        match state.fsm.state() {
                            TurnState::Open { ordinal, .. } => (*ordinal, state.turn_role.clone()),
                            TurnState::Idle => return Ok(()),
                        }
                    };
                    self.write_turn(session_id, turn_id, ordinal, &role, Some(summary.clone()), None, at)
                        .await?;
                    self.publish_node_created(&NodeCreated {
                        node_type: NodeLabel::Turn,
                        session_id,
                        node_id: turn_id,
                        content: Some(summary),
                        payload_ref: None,
                        file_path: None,
                        timestamp: at,
                    })
                    .await?;
                }
            }

            EventPayload::ToolUse {
                call_id,
                tool_name,
                input,
            } => {
                let input_text =
                    serde_json::to_string(input).unwrap_or_else(|_| "null".to_string());
                let record = ToolCallRecord {
                    id: NodeId::from(event.id),
                    turn_id,
                    call_id: call_id.clone(),
                    tool_name: tool_name.clone(),
                    input: self.payload_ref(&input_text).await?,
                    result: None,
                    status: ToolCallStatus::Pending,
                    touches: touched_paths(input),
                };
                self.graph
                    .upsert_tool_call(&record, at)
                    .await
                    .map_err(AggregateError::Graph)?;
                self.publish_node_created(&NodeCreated {
                    node_type: NodeLabel::ToolCall,
                    session_id,
                    node_id: record.id,
                    content: record.input.inline().map(String::from),
                    payload_ref: record.input.blob_uri().map(String::from),
                    file_path: record.touches.first().cloned(),
                    timestamp: at,
                })
                .await?;
            }

            EventPayload::ToolResult {
                call_id,
                output,
                is_error,
            } => {
                let output_text =
                    serde_json::to_string(output).unwrap_or_else(|_| "null".to_string());
                let result = self.payload_ref(&output_text).await?;
                let status = if *is_error {
                    ToolCallStatus::Failed
                } else {
                    ToolCallStatus::Succeeded
                };
                let updated = self
                    .graph
                    .complete_tool_call(session_id, call_id, result, status, at)
                    .await
                    .map_err(AggregateError::Graph)?;
                if updated.is_none() {
                    tracing::debug!(%call_id, "Tool result without a matching call");
                }
            }

            EventPayload::Diff { file_path, patch } => {
                let patch_ref = match patch {
                    Some(patch) => Some(self.payload_ref(patch).await?),
                    None => None,
                };
                let record = DiffHunkRecord {
                    id: NodeId::from(event.id),
                    turn_id,
                    session_id,
                    file_path: file_path.clone(),
                    patch: patch_ref,
                    vt_start: at,
                };
                self.graph
                    .append_diff(&record, at)
                    .await
                    .map_err(AggregateError::Graph)?;
                self.publish_node_created(&NodeCreated {
                    node_type: NodeLabel::DiffHunk,
                    session_id,
                    node_id: record.id,
                    content: record.patch.as_ref().and_then(|p| p.inline()).map(String::from),
                    payload_ref: record
                        .patch
                        .as_ref()
                        .and_then(|p| p.blob_uri())
                        .map(String::from),
                    file_path: record.file_path.clone(),
                    timestamp: at,
                })
                .await?;
            }

            EventPayload::SystemInit { .. } | EventPayload::UsageMarker { .. } => {}
        }
        Ok(())
    }

    /// Close turns idle past the configured window.
    pub async fn close_idle_turns(&self) -> Result<(), AggregateError> {
        let now = now_ms();
        let idle_after = self.config.idle_close_after.as_millis() as i64;
        let mut closes = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            if let Some(action) = entry.value_mut().fsm.on_idle_check(now, idle_after) {
                closes.push((*entry.key(), action));
            }
        }
        for (session_id, action) in closes {
            if let TurnAction::Close {
                turn_id,
                ordinal,
                closed_by,
            } = action
            {
                self.write_turn(session_id, turn_id, ordinal, "user", None, Some(closed_by), now)
                    .await?;
                self.emit_turn_finalized(session_id, turn_id, ordinal, closed_by)
                    .await?;
            }
        }
        Ok(())
    }

    /// Consume the parsed topic until the subscription closes. Acks only
    /// after a successful write; permanent failures dead-letter and then
    /// the offset advances.
    pub async fn run(&self) -> Result<(), crate::types::StorageError> {
        let mut subscription = self.broker.subscribe(TOPIC_EVENTS_PARSED, "aggregator").await?;
        tracing::info!("Aggregator consuming {}", TOPIC_EVENTS_PARSED);
        let mut idle_tick = tokio::time::interval(std::time::Duration::from_secs(60));
        idle_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                delivery = subscription.next() => {
                    let Some(delivery) = delivery else { break };
                    let event: TypedEvent = match serde_json::from_slice(&delivery.record.value) {
                        Ok(event) => event,
                        Err(e) => {
                            self.dead_letter(&delivery.record.key, &delivery.record.value, &e.to_string()).await;
                            let _ = delivery.ack().await;
                            continue;
                        }
                    };
                    let result = self
                        .retry
                        .run(|| async { self.handle_event(&event).await }, |e| e.is_transient())
                        .await;
                    match result {
                        Ok(()) => {
                            if let Err(e) = delivery.ack().await {
                                tracing::warn!(error = %e, "Aggregator ack failed");
                            }
                        }
                        Err(e) if e.is_transient() => {
                            // Out of retries on a transient error: leave the
                            // delivery unacked so the partition redelivers.
                            tracing::warn!(error = %e, "Write failed after retries; blocking partition");
                            drop(delivery);
                        }
                        Err(e) => {
                            self.dead_letter(&delivery.record.key, &delivery.record.value, &e.to_string()).await;
                            let _ = delivery.ack().await;
                        }
                    }
                }
                _ = idle_tick.tick() => {
                    if let Err(e) = self.close_idle_turns().await {
                        tracing::warn!(error = %e, "Idle-turn sweep failed");
                    }
                }
            }
        }
        Ok(())
    }

    async fn dead_letter(&self, key: &str, payload: &[u8], error: &str) {
        let entry = serde_json::json!({
            "source_topic": TOPIC_EVENTS_PARSED,
            "error": error,
            "payload": String::from_utf8_lossy(payload),
        });
        let record = BrokerRecord::new(key.to_string(), serde_json::to_vec(&entry).unwrap_or_default());
        if let Err(e) = self.broker.send(DLQ_MEMORY, vec![record]).await {
            tracing::error!(error = %e, "Dead-letter publish failed");
        }
    }
}

/// File paths a tool call touches, extracted from common argument names.
fn touched_paths(input: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    for key in ["file_path", "path", "notebook_path"] {
        if let Some(path) = input.get(key).and_then(|v| v.as_str()) {
            paths.push(path.to_string());
        }
    }
    paths
}
