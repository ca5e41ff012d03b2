//! Provider-event parsing.
//!
//! A registry maps each provider to its strategy; strategies turn one raw
//! event into zero or more typed events. The service derives per-session
//! monotonic sequence numbers and causal microsecond timestamps, then
//! publishes onto the parsed topic with the same partition key so ingestor
//! ordering survives.

pub mod anthropic;
pub mod buffer;
pub mod claude_code;
pub mod codex;
pub mod gemini;
pub mod openai;

pub use buffer::{DeltaBuffers, PendingMessage, PendingToolCall};

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ParserConfig;
use crate::storage::{
    BrokerRecord, MessageBroker, DLQ_INGESTION, TOPIC_EVENTS_PARSED, TOPIC_EVENTS_RAW,
};
use crate::types::{EventPayload, ParseError, Provider, RawEvent, SessionId, TypedEvent};

/// A provider-specific parsing strategy. Stateless per event apart from the
/// shared delta buffers.
pub trait ProviderStrategy: Send + Sync {
    fn provider(&self) -> Provider;

    fn parse(
        &self,
        raw: &RawEvent,
        session_id: SessionId,
        buffers: &DeltaBuffers,
    ) -> Result<Vec<EventPayload>, ParseError>;
}

/// Provider-to-strategy registry.
pub struct ParserRegistry {
    strategies: HashMap<Provider, Arc<dyn ProviderStrategy>>,
}

impl ParserRegistry {
    /// Registry with every supported provider. The OpenAI-family strategy
    /// serves OpenAI, xAI, and Codex-SSE.
    pub fn standard() -> Self {
        let mut strategies: HashMap<Provider, Arc<dyn ProviderStrategy>> = HashMap::new();
        for provider in [Provider::OpenAi, Provider::XAi, Provider::CodexSse] {
            strategies.insert(provider, Arc::new(openai::OpenAiFamilyStrategy::new(provider)));
        }
        strategies.insert(Provider::Anthropic, Arc::new(anthropic::AnthropicStrategy));
        strategies.insert(Provider::ClaudeCode, Arc::new(claude_code::ClaudeCodeStrategy));
        strategies.insert(Provider::Gemini, Arc::new(gemini::GeminiStrategy));
        strategies.insert(Provider::Codex, Arc::new(codex::CodexStrategy));
        Self { strategies }
    }

    pub fn strategy(&self, provider: Provider) -> Option<Arc<dyn ProviderStrategy>> {
        self.strategies.get(&provider).cloned()
    }
}

/// The parsing service: raw topic in, parsed topic out.
pub struct ParserService {
    registry: ParserRegistry,
    buffers: DeltaBuffers,
    broker: Arc<dyn MessageBroker>,
    sequences: DashMap<SessionId, u64>,
}

impl ParserService {
    pub fn new(config: &ParserConfig, broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            registry: ParserRegistry::standard(),
            buffers: DeltaBuffers::new(config.buffer_ttl),
            broker,
            sequences: DashMap::new(),
        }
    }

    /// Parse one raw event into stamped typed events.
    pub fn parse_event(&self, raw: &RawEvent) -> Result<Vec<TypedEvent>, ParseError> {
        let session_id = raw
            .session_id()
            .ok_or_else(|| ParseError::InvalidSessionId(raw.headers.session_id.clone()))?;
        let strategy = self
            .registry
            .strategy(raw.provider)
            .ok_or(ParseError::UnknownProvider {
                event_id: raw.event_id,
            })?;

        let payloads = strategy.parse(raw, session_id, &self.buffers)?;
        let base_us = raw.ingest_timestamp.timestamp_millis() * 1_000;
        let events = payloads
            .into_iter()
            .enumerate()
            .map(|(index, payload)| {
                let mut seq_entry = self.sequences.entry(session_id).or_insert(0);
                let seq = *seq_entry;
                *seq_entry += 1;
                drop(seq_entry);
                TypedEvent {
                    id: raw.event_id.derive(index as u32),
                    session_id,
                    seq,
                    // Micro-offset keeps events from one raw event strictly
                    // ordered without colliding with the next ingest stamp.
                    occurred_at_us: base_us + index as i64,
                    payload,
                }
            })
            .collect();
        Ok(events)
    }

    /// Consume the raw topic until the subscription closes.
    pub async fn run(&self) -> Result<(), crate::types::StorageError> {
        let mut subscription = self.broker.subscribe(TOPIC_EVENTS_RAW, "parser").await?;
        tracing::info!("Parser consuming {}", TOPIC_EVENTS_RAW);
        while let Some(delivery) = subscription.next().await {
            self.buffers.evict_idle();
            let key = delivery.record.key.clone();
            let raw: Result<RawEvent, _> = serde_json::from_slice(&delivery.record.value);
            let outcome = match raw {
                Ok(raw) => self.parse_event(&raw).map(|events| (raw, events)),
                Err(e) => {
                    self.dead_letter(&key, &delivery.record.value, &e.to_string())
                        .await;
                    let _ = delivery.ack().await;
                    continue;
                }
            };
            match outcome {
                Ok((_, events)) => {
                    let records: Vec<BrokerRecord> = events
                        .iter()
                        .filter_map(|event| {
                            serde_json::to_vec(event)
                                .ok()
                                .map(|bytes| BrokerRecord::new(key.clone(), bytes))
                        })
                        .collect();
                    if !records.is_empty() {
                        if let Err(e) = self.broker.send(TOPIC_EVENTS_PARSED, records).await {
                            tracing::warn!(error = %e, "Parsed-event publish failed; leaving delivery unacked");
                            continue;
                        }
                    }
                    let _ = delivery.ack().await;
                }
                Err(e) => {
                    // Unparseable events dead-letter with the original
                    // payload, then the offset advances.
                    self.dead_letter(&key, &delivery.record.value, &e.to_string())
                        .await;
                    let _ = delivery.ack().await;
                }
            }
        }
        Ok(())
    }

    async fn dead_letter(&self, key: &str, payload: &[u8], error: &str) {
        let entry = serde_json::json!({
            "source_topic": TOPIC_EVENTS_RAW,
            "error": error,
            "payload": String::from_utf8_lossy(payload),
        });
        let record = BrokerRecord::new(key.to_string(), serde_json::to_vec(&entry).unwrap_or_default());
        if let Err(e) = self.broker.send(DLQ_INGESTION, vec![record]).await {
            tracing::error!(error = %e, "Dead-letter publish failed");
        }
    }
}
