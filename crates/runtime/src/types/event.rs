//! Raw and typed event models for the ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Bitemporal, EventId, SessionId};

/// Event stream providers the pipeline understands.
///
/// Unknown providers are rejected at the ingestion boundary; there is no
/// silent pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    OpenAi,
    XAi,
    CodexSse,
    Anthropic,
    ClaudeCode,
    Gemini,
    Codex,
}

impl Provider {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "xai" => Some(Self::XAi),
            "codex_sse" | "codex-sse" => Some(Self::CodexSse),
            "anthropic" => Some(Self::Anthropic),
            "claude_code" | "claude-code" => Some(Self::ClaudeCode),
            "gemini" => Some(Self::Gemini),
            "codex" => Some(Self::Codex),
            _ => None,
        }
    }

    /// Whether this provider emits OpenAI-style chunked `choices[].delta`
    /// streams that need reassembly.
    pub fn is_openai_family(&self) -> bool {
        matches!(self, Self::OpenAi | Self::XAi | Self::CodexSse)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::OpenAi => "openai",
            Self::XAi => "xai",
            Self::CodexSse => "codex_sse",
            Self::Anthropic => "anthropic",
            Self::ClaudeCode => "claude_code",
            Self::Gemini => "gemini",
            Self::Codex => "codex",
        };
        f.write_str(name)
    }
}

/// Headers accompanying a raw event. The session id is mandatory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEventHeaders {
    #[serde(rename = "x-session-id")]
    pub session_id: String,
    #[serde(rename = "x-working-dir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "x-git-remote", skip_serializing_if = "Option::is_none")]
    pub git_remote: Option<String>,
    #[serde(rename = "x-agent-type", skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
}

/// A validated, bitemporally stamped event on the raw topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_id: EventId,
    pub ingest_timestamp: DateTime<Utc>,
    pub provider: Provider,
    pub payload: Value,
    pub headers: RawEventHeaders,
    #[serde(flatten)]
    pub validity: Bitemporal,
}

impl RawEvent {
    pub fn session_id(&self) -> Option<SessionId> {
        SessionId::parse(&self.headers.session_id)
    }
}

/// Typed domain event emitted by the parser onto the parsed topic.
///
/// `seq` is strictly monotonic per session; `occurred_at_us` is the causal
/// timestamp (ingest milliseconds scaled to microseconds plus an intra-event
/// offset) so events within one raw event order strictly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypedEvent {
    pub id: EventId,
    pub session_id: SessionId,
    pub seq: u64,
    pub occurred_at_us: i64,
    pub payload: EventPayload,
}

impl TypedEvent {
    /// Wall-clock milliseconds this event is valid from.
    pub fn occurred_at_ms(&self) -> i64 {
        self.occurred_at_us / 1_000
    }
}

/// Closed sum of the event shapes the aggregator understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    SystemInit {
        agent_type: Option<String>,
        working_dir: Option<String>,
    },
    UserMessage {
        text: String,
    },
    AssistantText {
        message_id: Option<String>,
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolUse {
        call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolResult {
        call_id: String,
        output: Value,
        is_error: bool,
    },
    Diff {
        file_path: Option<String>,
        patch: Option<String>,
    },
    UsageMarker {
        input_tokens: u64,
        output_tokens: u64,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SystemInit { .. } => "system_init",
            Self::UserMessage { .. } => "user_message",
            Self::AssistantText { .. } => "assistant_text",
            Self::Reasoning { .. } => "reasoning",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::Diff { .. } => "diff",
            Self::UsageMarker { .. } => "usage_marker",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parse_round_trips() {
        for p in [
            Provider::OpenAi,
            Provider::XAi,
            Provider::CodexSse,
            Provider::Anthropic,
            Provider::ClaudeCode,
            Provider::Gemini,
            Provider::Codex,
        ] {
            assert_eq!(Provider::parse(&p.to_string()), Some(p));
        }
        assert_eq!(Provider::parse("cursor"), None);
    }

    #[test]
    fn typed_event_serde_round_trip() {
        let event = TypedEvent {
            id: EventId::new(),
            session_id: SessionId::new(),
            seq: 7,
            occurred_at_us: 1_700_000_000_000_123,
            payload: EventPayload::ToolUse {
                call_id: "call_1".into(),
                tool_name: "Read".into(),
                input: serde_json::json!({"file_path": "src/lib.rs"}),
            },
        };
        let bytes = serde_json::to_vec(&event).unwrap();
        let back: TypedEvent = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.payload, event.payload);
        assert_eq!(back.seq, 7);
    }
}
