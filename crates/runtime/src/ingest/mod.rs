//! Ingestion boundary.
//!
//! Validates incoming provider events, stamps them bitemporally, and
//! publishes onto the raw topic keyed by session id so every event of a
//! session lands on one partition. Validation failures are rejected with a
//! stable error code and never retried; broker failures retry with capped
//! back-off and then dead-letter.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::retry::RetryPolicy;
use crate::storage::{BrokerRecord, MessageBroker, DLQ_INGESTION, TOPIC_EVENTS_RAW};
use crate::types::{
    now_ms, Bitemporal, EventId, IngestError, Provider, RawEvent, RawEventHeaders, SessionId,
};

/// Wire-format event arriving at the ingestion boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingEvent {
    pub event_id: String,
    pub ingest_timestamp: String,
    pub provider: String,
    pub payload: Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Result of an ingest call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted { event_id: EventId },
    Rejected { code: &'static str, reason: String },
}

/// Running counters, logged on interval by the service loop.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub dead_lettered: AtomicU64,
}

pub struct Ingestor {
    broker: Arc<dyn MessageBroker>,
    retry: RetryPolicy,
    stats: IngestStats,
}

impl Ingestor {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker,
            retry: RetryPolicy::default(),
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Validate and stamp an incoming event.
    fn validate(&self, incoming: &IncomingEvent) -> Result<RawEvent, (&'static str, String)> {
        let event_id = uuid::Uuid::parse_str(incoming.event_id.trim())
            .map(EventId)
            .map_err(|_| ("invalid_event_id", format!("not a uuid: {}", incoming.event_id)))?;

        let ingest_timestamp = chrono::DateTime::parse_from_rfc3339(&incoming.ingest_timestamp)
            .map(|t| t.with_timezone(&chrono::Utc))
            .map_err(|e| ("invalid_timestamp", e.to_string()))?;

        let provider = Provider::parse(&incoming.provider).ok_or_else(|| {
            (
                "unknown_provider",
                format!("unrecognized provider: {}", incoming.provider),
            )
        })?;

        let session_header = incoming
            .headers
            .get("x-session-id")
            .filter(|v| !v.is_empty())
            .ok_or(("missing_session_id", "x-session-id header required".to_string()))?;
        SessionId::parse(session_header).ok_or_else(|| {
            (
                "invalid_session_id",
                format!("not a uuid: {session_header}"),
            )
        })?;

        if !incoming.payload.is_object() {
            return Err(("invalid_payload", "payload must be a JSON object".to_string()));
        }

        Ok(RawEvent {
            event_id,
            ingest_timestamp,
            provider,
            payload: incoming.payload.clone(),
            headers: RawEventHeaders {
                session_id: session_header.clone(),
                working_dir: incoming.headers.get("x-working-dir").cloned(),
                git_remote: incoming.headers.get("x-git-remote").cloned(),
                agent_type: incoming.headers.get("x-agent-type").cloned(),
            },
            validity: Bitemporal::open_at(now_ms()),
        })
    }

    /// `ingest(event) -> accepted | rejected(reason)`.
    pub async fn ingest(&self, incoming: IncomingEvent) -> Result<IngestOutcome, IngestError> {
        let raw = match self.validate(&incoming) {
            Ok(raw) => raw,
            Err((code, reason)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(code, %reason, "Rejected event");
                return Ok(IngestOutcome::Rejected { code, reason });
            }
        };

        let key = raw.headers.session_id.clone();
        let bytes = serde_json::to_vec(&raw).map_err(|e| IngestError::Validation {
            code: "serialization",
            reason: e.to_string(),
        })?;

        let publish = self
            .retry
            .run(
                || {
                    let record = BrokerRecord::new(key.clone(), bytes.clone());
                    async move { self.broker.send(TOPIC_EVENTS_RAW, vec![record]).await }
                },
                |e| e.is_transient(),
            )
            .await;

        match publish {
            Ok(()) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(IngestOutcome::Accepted {
                    event_id: raw.event_id,
                })
            }
            Err(source) => {
                // Out of retries: dead-letter keyed by session id, then
                // surface the failure.
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                let entry = serde_json::json!({
                    "source_topic": TOPIC_EVENTS_RAW,
                    "error": source.to_string(),
                    "payload": raw,
                });
                let dlq_record =
                    BrokerRecord::new(key, serde_json::to_vec(&entry).unwrap_or_default());
                self.broker
                    .send(DLQ_INGESTION, vec![dlq_record])
                    .await
                    .map_err(IngestError::DeadLetterFailed)?;
                Err(IngestError::PublishFailed {
                    attempts: self.retry.max_attempts,
                    source,
                })
            }
        }
    }

    /// Log the counters; called on an interval by the host.
    pub fn log_stats(&self) {
        tracing::info!(
            accepted = self.stats.accepted.load(Ordering::Relaxed),
            rejected = self.stats.rejected.load(Ordering::Relaxed),
            dead_lettered = self.stats.dead_lettered.load(Ordering::Relaxed),
            "Ingest counters"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBroker;

    fn incoming(session: Option<&str>, provider: &str) -> IncomingEvent {
        let mut headers = HashMap::new();
        if let Some(session) = session {
            headers.insert("x-session-id".to_string(), session.to_string());
        }
        IncomingEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            ingest_timestamp: chrono::Utc::now().to_rfc3339(),
            provider: provider.to_string(),
            payload: serde_json::json!({"type": "user"}),
            headers,
        }
    }

    async fn connected_broker() -> Arc<MemoryBroker> {
        let broker = Arc::new(MemoryBroker::new(4));
        broker.connect().await.unwrap();
        broker
    }

    #[tokio::test]
    async fn valid_event_is_accepted_and_published() {
        let broker = connected_broker().await;
        let ingestor = Ingestor::new(Arc::clone(&broker) as Arc<dyn MessageBroker>);
        let session = uuid::Uuid::new_v4().to_string();

        let outcome = ingestor
            .ingest(incoming(Some(&session), "claude_code"))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Accepted { .. }));

        let mut sub = broker.subscribe(TOPIC_EVENTS_RAW, "test").await.unwrap();
        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.record.key, session);
        let raw: RawEvent = serde_json::from_slice(&delivery.record.value).unwrap();
        assert_eq!(raw.provider, Provider::ClaudeCode);
        assert!(raw.validity.is_open());
    }

    #[tokio::test]
    async fn missing_session_header_is_rejected() {
        let broker = connected_broker().await;
        let ingestor = Ingestor::new(broker);
        let outcome = ingestor.ingest(incoming(None, "claude_code")).await.unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Rejected {
                code: "missing_session_id",
                reason: "x-session-id header required".into()
            }
        );
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected_not_passed_through() {
        let broker = connected_broker().await;
        let ingestor = Ingestor::new(broker);
        let session = uuid::Uuid::new_v4().to_string();
        let outcome = ingestor
            .ingest(incoming(Some(&session), "cursor"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Rejected {
                code: "unknown_provider",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn same_session_lands_on_one_partition() {
        let broker = connected_broker().await;
        let ingestor = Ingestor::new(Arc::clone(&broker) as Arc<dyn MessageBroker>);
        let session = uuid::Uuid::new_v4().to_string();
        for _ in 0..4 {
            ingestor
                .ingest(incoming(Some(&session), "gemini"))
                .await
                .unwrap();
        }
        let mut sub = broker.subscribe(TOPIC_EVENTS_RAW, "check").await.unwrap();
        let mut partitions = std::collections::HashSet::new();
        for _ in 0..4 {
            let delivery = sub.next().await.unwrap();
            partitions.insert(delivery.partition);
            delivery.ack().await.unwrap();
        }
        assert_eq!(partitions.len(), 1);
    }
}
