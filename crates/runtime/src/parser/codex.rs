//! Codex CLI strategy.
//!
//! Codex rollout files carry response items in an explicit event-typed
//! stream: messages with typed content parts, function calls with string
//! arguments, their outputs, reasoning summaries, and token counts.

use serde::Deserialize;
use serde_json::Value;

use super::buffer::DeltaBuffers;
use super::ProviderStrategy;
use crate::types::{EventPayload, ParseError, Provider, RawEvent, SessionId};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CodexItem {
    SessionMeta {
        #[serde(default)]
        cwd: Option<String>,
    },
    Message {
        role: String,
        #[serde(default)]
        content: Vec<ContentPart>,
    },
    Reasoning {
        #[serde(default)]
        summary: Vec<SummaryPart>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        #[serde(default)]
        output: Value,
    },
    TokenCount {
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    InputText {
        #[serde(default)]
        text: String,
    },
    OutputText {
        #[serde(default)]
        text: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SummaryPart {
    SummaryText {
        #[serde(default)]
        text: String,
    },
}

pub struct CodexStrategy;

impl ProviderStrategy for CodexStrategy {
    fn provider(&self) -> Provider {
        Provider::Codex
    }

    fn parse(
        &self,
        raw: &RawEvent,
        _session_id: SessionId,
        _buffers: &DeltaBuffers,
    ) -> Result<Vec<EventPayload>, ParseError> {
        let item: CodexItem =
            serde_json::from_value(raw.payload.clone()).map_err(|e| ParseError::MalformedPayload {
                event_id: raw.event_id,
                reason: e.to_string(),
            })?;

        let mut events = Vec::new();
        match item {
            CodexItem::SessionMeta { cwd } => {
                events.push(EventPayload::SystemInit {
                    agent_type: raw.headers.agent_type.clone(),
                    working_dir: cwd.or_else(|| raw.headers.working_dir.clone()),
                });
            }
            CodexItem::Message { role, content } => {
                for part in content {
                    let text = match part {
                        ContentPart::InputText { text } | ContentPart::OutputText { text } => text,
                    };
                    if text.is_empty() {
                        continue;
                    }
                    if role == "user" {
                        events.push(EventPayload::UserMessage { text });
                    } else {
                        events.push(EventPayload::AssistantText {
                            message_id: None,
                            text,
                        });
                    }
                }
            }
            CodexItem::Reasoning { summary } => {
                let text: String = summary
                    .into_iter()
                    .map(|SummaryPart::SummaryText { text }| text)
                    .collect::<Vec<_>>()
                    .join("\n");
                if !text.is_empty() {
                    events.push(EventPayload::Reasoning { text });
                }
            }
            CodexItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let input: Value =
                    serde_json::from_str(&arguments).unwrap_or(Value::String(arguments));
                events.push(EventPayload::ToolUse {
                    call_id,
                    tool_name: name,
                    input,
                });
            }
            CodexItem::FunctionCallOutput { call_id, output } => {
                events.push(EventPayload::ToolResult {
                    call_id,
                    output,
                    is_error: false,
                });
            }
            CodexItem::TokenCount {
                input_tokens,
                output_tokens,
            } => {
                events.push(EventPayload::UsageMarker {
                    input_tokens,
                    output_tokens,
                });
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bitemporal, EventId, RawEventHeaders};
    use serde_json::json;
    use std::time::Duration;

    fn parse(payload: serde_json::Value) -> Vec<EventPayload> {
        let strategy = CodexStrategy;
        let buffers = DeltaBuffers::new(Duration::from_secs(600));
        let raw = RawEvent {
            event_id: EventId::new(),
            ingest_timestamp: chrono::Utc::now(),
            provider: Provider::Codex,
            payload,
            headers: RawEventHeaders::default(),
            validity: Bitemporal::open_at(0),
        };
        strategy.parse(&raw, SessionId::new(), &buffers).unwrap()
    }

    #[test]
    fn message_parts_map_by_role() {
        let events = parse(json!({
            "type": "message", "role": "user",
            "content": [{"type": "input_text", "text": "fix the bug"}]
        }));
        assert!(matches!(events[0], EventPayload::UserMessage { .. }));

        let events = parse(json!({
            "type": "message", "role": "assistant",
            "content": [{"type": "output_text", "text": "done"}]
        }));
        assert!(matches!(events[0], EventPayload::AssistantText { .. }));
    }

    #[test]
    fn function_call_arguments_parse_as_json() {
        let events = parse(json!({
            "type": "function_call", "call_id": "c1", "name": "shell",
            "arguments": "{\"command\": [\"ls\"]}"
        }));
        match &events[0] {
            EventPayload::ToolUse { input, .. } => assert_eq!(input["command"][0], "ls"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn token_count_is_a_usage_marker() {
        let events = parse(json!({
            "type": "token_count", "input_tokens": 9, "output_tokens": 3
        }));
        assert_eq!(
            events,
            vec![EventPayload::UsageMarker {
                input_tokens: 9,
                output_tokens: 3
            }]
        );
    }
}
