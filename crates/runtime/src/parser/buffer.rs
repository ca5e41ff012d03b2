//! Rolling reassembly buffers for streamed provider deltas.
//!
//! Keyed by `(session_id, message_id)` with idle-TTL eviction so abandoned
//! streams do not leak. Strategies accumulate partial text, reasoning, and
//! tool-call fragments here until a terminal marker flushes the message.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::types::SessionId;

/// A tool call being reassembled from indexed fragments.
#[derive(Debug, Clone, Default)]
pub struct PendingToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// An assistant message being reassembled from stream deltas.
#[derive(Debug, Clone, Default)]
pub struct PendingMessage {
    pub text: String,
    pub reasoning: String,
    /// Keyed by the provider's `tool_calls[].index`.
    pub tool_calls: BTreeMap<u32, PendingToolCall>,
}

struct Entry {
    message: PendingMessage,
    touched_at: Instant,
}

/// Buffer store shared by all streaming strategies.
pub struct DeltaBuffers {
    ttl: Duration,
    entries: DashMap<(SessionId, String), Entry>,
}

impl DeltaBuffers {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Apply `f` to the pending message for this key, creating it if absent.
    pub fn update<F>(&self, session_id: SessionId, message_id: &str, f: F)
    where
        F: FnOnce(&mut PendingMessage),
    {
        let mut entry = self
            .entries
            .entry((session_id, message_id.to_string()))
            .or_insert_with(|| Entry {
                message: PendingMessage::default(),
                touched_at: Instant::now(),
            });
        entry.touched_at = Instant::now();
        f(&mut entry.message);
    }

    /// Remove and return the pending message for this key.
    pub fn take(&self, session_id: SessionId, message_id: &str) -> Option<PendingMessage> {
        self.entries
            .remove(&(session_id, message_id.to_string()))
            .map(|(_, entry)| entry.message)
    }

    /// Drop entries idle longer than the TTL. Called opportunistically by
    /// the parser loop.
    pub fn evict_idle(&self) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.touched_at.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_then_take_round_trips() {
        let buffers = DeltaBuffers::new(Duration::from_secs(600));
        let session = SessionId::new();
        buffers.update(session, "msg-1", |m| m.text.push_str("hel"));
        buffers.update(session, "msg-1", |m| m.text.push_str("lo"));

        let message = buffers.take(session, "msg-1").unwrap();
        assert_eq!(message.text, "hello");
        assert!(buffers.take(session, "msg-1").is_none());
    }

    #[test]
    fn idle_entries_are_evicted() {
        let buffers = DeltaBuffers::new(Duration::from_millis(0));
        let session = SessionId::new();
        buffers.update(session, "msg-1", |m| m.text.push('x'));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(buffers.evict_idle(), 1);
        assert!(buffers.is_empty());
    }

    #[test]
    fn keys_are_isolated_by_session() {
        let buffers = DeltaBuffers::new(Duration::from_secs(600));
        let (a, b) = (SessionId::new(), SessionId::new());
        buffers.update(a, "m", |m| m.text.push('a'));
        buffers.update(b, "m", |m| m.text.push('b'));
        assert_eq!(buffers.take(a, "m").unwrap().text, "a");
        assert_eq!(buffers.take(b, "m").unwrap().text, "b");
    }
}
