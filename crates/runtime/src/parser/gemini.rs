//! Gemini CLI strategy.
//!
//! Gemini session logs are event-typed and translate directly: user/model
//! messages, thoughts, function calls and responses, and a usage record.

use serde::Deserialize;
use serde_json::Value;

use super::buffer::DeltaBuffers;
use super::ProviderStrategy;
use crate::types::{EventPayload, ParseError, Provider, RawEvent, SessionId};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GeminiEvent {
    Init {
        #[serde(default)]
        working_dir: Option<String>,
    },
    User {
        #[serde(default)]
        content: String,
    },
    #[serde(alias = "model")]
    Assistant {
        #[serde(default)]
        content: String,
    },
    Thought {
        #[serde(default)]
        content: String,
    },
    FunctionCall {
        id: String,
        name: String,
        #[serde(default)]
        args: Value,
    },
    FunctionResponse {
        id: String,
        #[serde(default)]
        response: Value,
        #[serde(default)]
        is_error: bool,
    },
    Usage {
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
    },
}

pub struct GeminiStrategy;

impl ProviderStrategy for GeminiStrategy {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    fn parse(
        &self,
        raw: &RawEvent,
        _session_id: SessionId,
        _buffers: &DeltaBuffers,
    ) -> Result<Vec<EventPayload>, ParseError> {
        let event: GeminiEvent =
            serde_json::from_value(raw.payload.clone()).map_err(|e| ParseError::MalformedPayload {
                event_id: raw.event_id,
                reason: e.to_string(),
            })?;

        let payload = match event {
            GeminiEvent::Init { working_dir } => EventPayload::SystemInit {
                agent_type: raw.headers.agent_type.clone(),
                working_dir: working_dir.or_else(|| raw.headers.working_dir.clone()),
            },
            GeminiEvent::User { content } => EventPayload::UserMessage { text: content },
            GeminiEvent::Assistant { content } => EventPayload::AssistantText {
                message_id: None,
                text: content,
            },
            GeminiEvent::Thought { content } => EventPayload::Reasoning { text: content },
            GeminiEvent::FunctionCall { id, name, args } => EventPayload::ToolUse {
                call_id: id,
                tool_name: name,
                input: args,
            },
            GeminiEvent::FunctionResponse {
                id,
                response,
                is_error,
            } => EventPayload::ToolResult {
                call_id: id,
                output: response,
                is_error,
            },
            GeminiEvent::Usage {
                input_tokens,
                output_tokens,
            } => EventPayload::UsageMarker {
                input_tokens,
                output_tokens,
            },
        };
        Ok(vec![payload])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bitemporal, EventId, RawEventHeaders};
    use serde_json::json;
    use std::time::Duration;

    fn parse(payload: serde_json::Value) -> Vec<EventPayload> {
        let strategy = GeminiStrategy;
        let buffers = DeltaBuffers::new(Duration::from_secs(600));
        let raw = RawEvent {
            event_id: EventId::new(),
            ingest_timestamp: chrono::Utc::now(),
            provider: Provider::Gemini,
            payload,
            headers: RawEventHeaders::default(),
            validity: Bitemporal::open_at(0),
        };
        strategy.parse(&raw, SessionId::new(), &buffers).unwrap()
    }

    #[test]
    fn events_translate_one_to_one() {
        assert!(matches!(
            parse(json!({"type": "user", "content": "hi"}))[0],
            EventPayload::UserMessage { .. }
        ));
        assert!(matches!(
            parse(json!({"type": "model", "content": "hello"}))[0],
            EventPayload::AssistantText { .. }
        ));
        assert!(matches!(
            parse(json!({"type": "thought", "content": "hmm"}))[0],
            EventPayload::Reasoning { .. }
        ));
        assert!(matches!(
            parse(json!({"type": "function_call", "id": "f1", "name": "read_file", "args": {}}))[0],
            EventPayload::ToolUse { .. }
        ));
        assert!(matches!(
            parse(json!({"type": "usage", "input_tokens": 10, "output_tokens": 2}))[0],
            EventPayload::UsageMarker { .. }
        ));
    }
}
