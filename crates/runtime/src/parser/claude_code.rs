//! Claude-Code strategy.
//!
//! Claude Code emits an explicit event-typed stream (`system`, `user`,
//! `assistant`, `result`), so translation is direct with no delta reassembly.
//! File-mutating tool calls (`Edit`, `Write`, `MultiEdit`) additionally
//! synthesize `Diff` events so the code-change chain feeds the DiffHunk
//! path and VFS rehydration.

use serde::Deserialize;
use serde_json::Value;

use super::buffer::DeltaBuffers;
use super::ProviderStrategy;
use crate::types::{EventPayload, ParseError, Provider, RawEvent, SessionId};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogEvent {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    User {
        message: Message,
    },
    Assistant {
        message: Message,
    },
    Result {
        #[serde(default)]
        usage: Option<Usage>,
    },
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Content,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Content {
    Text(String),
    Blocks(Vec<Block>),
}

impl Default for Content {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
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

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct EditArgs {
    file_path: String,
    #[serde(default)]
    old_string: String,
    #[serde(default)]
    new_string: String,
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    file_path: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct MultiEditArgs {
    file_path: String,
    #[serde(default)]
    edits: Vec<SingleEdit>,
}

#[derive(Debug, Deserialize)]
struct SingleEdit {
    #[serde(default)]
    old_string: String,
    #[serde(default)]
    new_string: String,
}

fn search_replace_block(old: &str, new: &str) -> String {
    format!("<<<<<<< SEARCH\n{old}\n=======\n{new}\n>>>>>>> REPLACE\n")
}

/// Unified diff that creates a file with `content`.
fn creation_patch(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut patch = format!("@@ -0,0 +1,{} @@\n", lines.len().max(1));
    if lines.is_empty() {
        patch.push_str("+\n");
    } else {
        for line in lines {
            patch.push('+');
            patch.push_str(line);
            patch.push('\n');
        }
    }
    patch
}

/// Synthesize a `Diff` event from a file-mutating tool call, if it is one.
fn diff_for_tool_call(name: &str, input: &Value) -> Option<EventPayload> {
    match name {
        "Edit" => {
            let args: EditArgs = serde_json::from_value(input.clone()).ok()?;
            Some(EventPayload::Diff {
                file_path: Some(args.file_path),
                patch: Some(search_replace_block(&args.old_string, &args.new_string)),
            })
        }
        "Write" => {
            let args: WriteArgs = serde_json::from_value(input.clone()).ok()?;
            Some(EventPayload::Diff {
                file_path: Some(args.file_path),
                patch: Some(creation_patch(&args.content)),
            })
        }
        "MultiEdit" => {
            let args: MultiEditArgs = serde_json::from_value(input.clone()).ok()?;
            if args.edits.is_empty() {
                return None;
            }
            let patch = args
                .edits
                .iter()
                .map(|e| search_replace_block(&e.old_string, &e.new_string))
                .collect::<String>();
            Some(EventPayload::Diff {
                file_path: Some(args.file_path),
                patch: Some(patch),
            })
        }
        _ => None,
    }
}

pub struct ClaudeCodeStrategy;

impl ProviderStrategy for ClaudeCodeStrategy {
    fn provider(&self) -> Provider {
        Provider::ClaudeCode
    }

    fn parse(
        &self,
        raw: &RawEvent,
        _session_id: SessionId,
        _buffers: &DeltaBuffers,
    ) -> Result<Vec<EventPayload>, ParseError> {
        let event: LogEvent =
            serde_json::from_value(raw.payload.clone()).map_err(|e| ParseError::MalformedPayload {
                event_id: raw.event_id,
                reason: e.to_string(),
            })?;

        let mut events = Vec::new();
        match event {
            LogEvent::System { subtype, cwd } => {
                if subtype.as_deref() == Some("init") {
                    events.push(EventPayload::SystemInit {
                        agent_type: raw.headers.agent_type.clone(),
                        working_dir: cwd.or_else(|| raw.headers.working_dir.clone()),
                    });
                }
            }
            LogEvent::User { message } => match message.content {
                Content::Text(text) => {
                    if !text.is_empty() {
                        events.push(EventPayload::UserMessage { text });
                    }
                }
                Content::Blocks(blocks) => {
                    for block in blocks {
                        match block {
                            Block::Text { text } => {
                                events.push(EventPayload::UserMessage { text });
                            }
                            Block::ToolResult {
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
                            _ => {}
                        }
                    }
                }
            },
            LogEvent::Assistant { message } => match message.content {
                Content::Text(text) => {
                    if !text.is_empty() {
                        events.push(EventPayload::AssistantText {
                            message_id: None,
                            text,
                        });
                    }
                }
                Content::Blocks(blocks) => {
                    for block in blocks {
                        match block {
                            Block::Text { text } => {
                                events.push(EventPayload::AssistantText {
                                    message_id: None,
                                    text,
                                });
                            }
                            Block::Thinking { thinking } => {
                                events.push(EventPayload::Reasoning { text: thinking });
                            }
                            Block::ToolUse { id, name, input } => {
                                let diff = diff_for_tool_call(&name, &input);
                                events.push(EventPayload::ToolUse {
                                    call_id: id,
                                    tool_name: name,
                                    input,
                                });
                                if let Some(diff) = diff {
                                    events.push(diff);
                                }
                            }
                            Block::ToolResult {
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
            },
            LogEvent::Result { usage } => {
                let usage = usage.unwrap_or_default();
                events.push(EventPayload::UsageMarker {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                });
            }
        }
        Ok(events)
    }
}
