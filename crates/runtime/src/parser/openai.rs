//! OpenAI-family strategy: OpenAI, xAI, and Codex-SSE chat streams.
//!
//! Chunked `choices[].delta` fragments accumulate in the delta buffers keyed
//! by the chunk's message id. A non-null `finish_reason` or a `usage` object
//! closes the assistant message and flushes reasoning, text, and reassembled
//! tool calls. xAI's `reasoning_content` maps to `Reasoning`.

use serde::Deserialize;
use serde_json::Value;

use super::buffer::DeltaBuffers;
use super::ProviderStrategy;
use crate::types::{EventPayload, ParseError, Provider, RawEvent, SessionId};

#[derive(Debug, Deserialize)]
struct ChatChunk {
    id: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Option<Delta>,
    /// Non-streaming responses put the whole message here.
    #[serde(default)]
    message: Option<Delta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Delta {
    role: Option<String>,
    content: Option<String>,
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize, Default)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub struct OpenAiFamilyStrategy {
    provider: Provider,
}

impl OpenAiFamilyStrategy {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }

    fn flush(
        buffers: &DeltaBuffers,
        session_id: SessionId,
        message_id: &str,
        events: &mut Vec<EventPayload>,
    ) {
        let Some(pending) = buffers.take(session_id, message_id) else {
            return;
        };
        if !pending.reasoning.is_empty() {
            events.push(EventPayload::Reasoning {
                text: pending.reasoning,
            });
        }
        if !pending.text.is_empty() {
            events.push(EventPayload::AssistantText {
                message_id: Some(message_id.to_string()),
                text: pending.text,
            });
        }
        for (_, call) in pending.tool_calls {
            let input: Value = serde_json::from_str(&call.arguments)
                .unwrap_or(Value::String(call.arguments.clone()));
            events.push(EventPayload::ToolUse {
                call_id: call.call_id,
                tool_name: call.name,
                input,
            });
        }
    }
}

impl ProviderStrategy for OpenAiFamilyStrategy {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn parse(
        &self,
        raw: &RawEvent,
        session_id: SessionId,
        buffers: &DeltaBuffers,
    ) -> Result<Vec<EventPayload>, ParseError> {
        let chunk: ChatChunk =
            serde_json::from_value(raw.payload.clone()).map_err(|e| ParseError::MalformedPayload {
                event_id: raw.event_id,
                reason: e.to_string(),
            })?;

        let message_id = chunk.id.clone().unwrap_or_else(|| "stream".to_string());
        let mut events = Vec::new();
        let mut should_flush = false;

        for choice in &chunk.choices {
            let fragment = choice.delta.as_ref().or(choice.message.as_ref());
            if let Some(fragment) = fragment {
                if fragment.role.as_deref() == Some("user") {
                    if let Some(content) = &fragment.content {
                        events.push(EventPayload::UserMessage {
                            text: content.clone(),
                        });
                    }
                    continue;
                }
                let content = fragment.content.clone();
                let reasoning = fragment.reasoning_content.clone();
                let calls: Vec<(u32, Option<String>, Option<String>, Option<String>)> = fragment
                    .tool_calls
                    .iter()
                    .map(|c| {
                        (
                            c.index,
                            c.id.clone(),
                            c.function.as_ref().and_then(|f| f.name.clone()),
                            c.function.as_ref().and_then(|f| f.arguments.clone()),
                        )
                    })
                    .collect();
                buffers.update(session_id, &message_id, |pending| {
                    if let Some(content) = content {
                        pending.text.push_str(&content);
                    }
                    if let Some(reasoning) = reasoning {
                        pending.reasoning.push_str(&reasoning);
                    }
                    for (index, id, name, arguments) in calls {
                        let call = pending.tool_calls.entry(index).or_default();
                        if let Some(id) = id {
                            call.call_id = id;
                        }
                        if let Some(name) = name {
                            call.name = name;
                        }
                        if let Some(arguments) = arguments {
                            call.arguments.push_str(&arguments);
                        }
                    }
                });
            }
            if choice.finish_reason.is_some() {
                should_flush = true;
            }
        }

        if chunk.usage.is_some() {
            should_flush = true;
        }
        if should_flush {
            Self::flush(buffers, session_id, &message_id, &mut events);
        }
        if let Some(usage) = chunk.usage {
            events.push(EventPayload::UsageMarker {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            });
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

    fn raw(payload: serde_json::Value) -> RawEvent {
        RawEvent {
            event_id: EventId::new(),
            ingest_timestamp: chrono::Utc::now(),
            provider: Provider::XAi,
            payload,
            headers: RawEventHeaders::default(),
            validity: Bitemporal::open_at(0),
        }
    }

    fn parse_all(chunks: Vec<serde_json::Value>) -> Vec<EventPayload> {
        let strategy = OpenAiFamilyStrategy::new(Provider::XAi);
        let buffers = DeltaBuffers::new(Duration::from_secs(600));
        let session = SessionId::new();
        chunks
            .into_iter()
            .flat_map(|payload| strategy.parse(&raw(payload), session, &buffers).unwrap())
            .collect()
    }

    #[test]
    fn reassembles_chunked_assistant_text() {
        let events = parse_all(vec![
            json!({"id": "m1", "choices": [{"delta": {"role": "assistant", "content": "hel"}}]}),
            json!({"id": "m1", "choices": [{"delta": {"content": "lo"}}]}),
            json!({"id": "m1", "choices": [{"delta": {}, "finish_reason": "stop"}]}),
        ]);
        assert_eq!(
            events,
            vec![EventPayload::AssistantText {
                message_id: Some("m1".into()),
                text: "hello".into(),
            }]
        );
    }

    #[test]
    fn usage_closes_the_message_and_emits_marker() {
        let events = parse_all(vec![
            json!({"id": "m1", "choices": [{"delta": {"content": "hi"}}]}),
            json!({"id": "m1", "choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 1}}),
        ]);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], EventPayload::AssistantText { .. }));
        assert_eq!(
            events[1],
            EventPayload::UsageMarker {
                input_tokens: 3,
                output_tokens: 1
            }
        );
    }

    #[test]
    fn reasoning_content_maps_to_reasoning() {
        let events = parse_all(vec![
            json!({"id": "m1", "choices": [{"delta": {"reasoning_content": "let me think"}}]}),
            json!({"id": "m1", "choices": [{"delta": {"content": "done"}, "finish_reason": "stop"}]}),
        ]);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            EventPayload::Reasoning {
                text: "let me think".into()
            }
        );
    }

    #[test]
    fn tool_call_chunks_reassemble_by_index() {
        let events = parse_all(vec![
            json!({"id": "m1", "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_a", "function": {"name": "read_file", "arguments": "{\"pa"}}
            ]}}]}),
            json!({"id": "m1", "choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "th\": \"x.rs\"}"}}
            ]}}]}),
            json!({"id": "m1", "choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
        ]);
        assert_eq!(events.len(), 1);
        match &events[0] {
            EventPayload::ToolUse {
                call_id,
                tool_name,
                input,
            } => {
                assert_eq!(call_id, "call_a");
                assert_eq!(tool_name, "read_file");
                assert_eq!(input["path"], "x.rs");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn user_chunks_pass_through() {
        let events = parse_all(vec![json!({
            "id": "m0",
            "choices": [{"delta": {"role": "user", "content": "hello"}}]
        })]);
        assert_eq!(
            events,
            vec![EventPayload::UserMessage {
                text: "hello".into()
            }]
        );
    }
}
