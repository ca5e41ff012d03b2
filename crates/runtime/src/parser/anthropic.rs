//! Anthropic Messages API strategy.
//!
//! Walks the `message_start → content_block_start → *_delta →
//! content_block_stop → message_delta` stream. `thinking` blocks map to
//! `Reasoning`, `tool_use` blocks to `ToolUse`; the `message_delta` carrying
//! usage closes the message. Non-streamed user messages (including
//! `tool_result` blocks) translate directly.

use serde::Deserialize;
use serde_json::Value;

use super::buffer::DeltaBuffers;
use super::ProviderStrategy;
use crate::types::{EventPayload, ParseError, Provider, RawEvent, SessionId};

/// Synthetic buffer key: one Anthropic message is in flight per session
/// stream, and block events do not repeat the message id.
const STREAM_KEY: &str = "anthropic-stream";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {},
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: u32,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<DeltaUsage>,
    },
    MessageStop {},
    Ping {},
    /// Non-streamed message (request side or replayed response).
    Message {
        role: String,
        #[serde(default)]
        content: Vec<ContentBlock>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        #[serde(default)]
        text: String,
    },
    ThinkingDelta {
        #[serde(default)]
        thinking: String,
    },
    InputJsonDelta {
        #[serde(default)]
        partial_json: String,
    },
    SignatureDelta {
        #[serde(default)]
        #[allow(dead_code)]
        signature: String,
    },
}

#[derive(Debug, Deserialize, Default)]
struct DeltaUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

pub struct AnthropicStrategy;

impl AnthropicStrategy {
    fn flush(buffers: &DeltaBuffers, session_id: SessionId, events: &mut Vec<EventPayload>) {
        let Some(pending) = buffers.take(session_id, STREAM_KEY) else {
            return;
        };
        if !pending.reasoning.is_empty() {
            events.push(EventPayload::Reasoning {
                text: pending.reasoning,
            });
        }
        if !pending.text.is_empty() {
            events.push(EventPayload::AssistantText {
                message_id: None,
                text: pending.text,
            });
        }
        for (_, call) in pending.tool_calls {
            let input: Value = serde_json::from_str(&call.arguments)
                .unwrap_or_else(|_| Value::Object(Default::default()));
            events.push(EventPayload::ToolUse {
                call_id: call.call_id,
                tool_name: call.name,
                input,
            });
        }
    }

    fn translate_plain_message(
        role: &str,
        content: Vec<ContentBlock>,
        events: &mut Vec<EventPayload>,
    ) {
        for block in content {
            match block {
                ContentBlock::Text { text } if role == "user" => {
                    events.push(EventPayload::UserMessage { text });
                }
                ContentBlock::Text { text } => {
                    events.push(EventPayload::AssistantText {
                        message_id: None,
                        text,
                    });
                }
                ContentBlock::Thinking { thinking } => {
                    events.push(EventPayload::Reasoning { text: thinking });
                }
                ContentBlock::ToolUse { id, name, input } => {
                    events.push(EventPayload::ToolUse {
                        call_id: id,
                        tool_name: name,
                        input,
                    });
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    events.push(EventPayload::ToolResult {
                        call_id: tool_use_id,
                        output: content,
                        is_error,
                    });
                }
            }
        }
    }
}

impl ProviderStrategy for AnthropicStrategy {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn parse(
        &self,
        raw: &RawEvent,
        session_id: SessionId,
        buffers: &DeltaBuffers,
    ) -> Result<Vec<EventPayload>, ParseError> {
        let event: StreamEvent =
            serde_json::from_value(raw.payload.clone()).map_err(|e| ParseError::MalformedPayload {
                event_id: raw.event_id,
                reason: e.to_string(),
            })?;

        let mut events = Vec::new();
        match event {
            StreamEvent::MessageStart {} => {
                // A fresh message; drop any stale stream state.
                let _ = buffers.take(session_id, STREAM_KEY);
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::ToolUse { id, name, input } => {
                    let seed = if input.is_null() || input == Value::Object(Default::default()) {
                        String::new()
                    } else {
                        input.to_string()
                    };
                    buffers.update(session_id, STREAM_KEY, |pending| {
                        let call = pending.tool_calls.entry(index).or_default();
                        call.call_id = id;
                        call.name = name;
                        call.arguments = seed;
                    });
                }
                ContentBlock::Text { text } => {
                    buffers.update(session_id, STREAM_KEY, |p| p.text.push_str(&text));
                }
                ContentBlock::Thinking { thinking } => {
                    buffers.update(session_id, STREAM_KEY, |p| p.reasoning.push_str(&thinking));
                }
                ContentBlock::ToolResult { .. } => {}
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    buffers.update(session_id, STREAM_KEY, |p| p.text.push_str(&text));
                }
                BlockDelta::ThinkingDelta { thinking } => {
                    buffers.update(session_id, STREAM_KEY, |p| p.reasoning.push_str(&thinking));
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    buffers.update(session_id, STREAM_KEY, |p| {
                        p.tool_calls.entry(index).or_default().arguments.push_str(&partial_json);
                    });
                }
                BlockDelta::SignatureDelta { .. } => {}
            },
            StreamEvent::ContentBlockStop { .. } => {}
            StreamEvent::MessageDelta { usage } => {
                Self::flush(buffers, session_id, &mut events);
                if let Some(usage) = usage {
                    events.push(EventPayload::UsageMarker {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    });
                }
            }
            StreamEvent::MessageStop {} => {
                Self::flush(buffers, session_id, &mut events);
            }
            StreamEvent::Ping {} => {}
            StreamEvent::Message { role, content } => {
                Self::translate_plain_message(&role, content, &mut events);
            }
        }
        Ok(events)
    }
}
