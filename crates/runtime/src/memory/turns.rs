//! Per-session turn state machine.
//!
//! `Idle → Open → Closing → Idle`, driven entirely by typed events plus an
//! idle timer. One FSM instance exists per session and is only touched by
//! that session's partition task, so no state crosses partitions.

use crate::types::{EventId, EventPayload, NodeId, TurnClosedBy};

/// FSM state. `Closing` collapses into the close action since no event is
/// ever observed inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Open { turn_id: NodeId, ordinal: u32 },
}

/// What the aggregator must do in response to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnAction {
    Open {
        turn_id: NodeId,
        ordinal: u32,
        role: String,
    },
    AppendChild {
        turn_id: NodeId,
    },
    Close {
        turn_id: NodeId,
        ordinal: u32,
        closed_by: TurnClosedBy,
    },
}

#[derive(Debug)]
pub struct TurnFsm {
    state: TurnState,
    next_ordinal: u32,
    last_activity_ms: i64,
}

impl TurnFsm {
    /// `next_ordinal` seeds ordinal assignment; recovery passes
    /// `max_ordinal + 1`, fresh sessions pass 0.
    pub fn new(next_ordinal: u32) -> Self {
        Self {
            state: TurnState::Idle,
            next_ordinal,
            last_activity_ms: 0,
        }
    }

    pub fn state(&self) -> &TurnState {
        &self.state
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms
    }

    fn open(&mut self, event_id: EventId, role: &str) -> TurnAction {
        let turn_id = NodeId::from(event_id);
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.state = TurnState::Open { turn_id, ordinal };
        TurnAction::Open {
            turn_id,
            ordinal,
            role: role.to_string(),
        }
    }

    /// Feed one event; returns the actions to perform, in order.
    pub fn on_event(&mut self, event_id: EventId, payload: &EventPayload, at_ms: i64) -> Vec<TurnAction> {
        self.last_activity_ms = at_ms;
        match (&self.state, payload) {
            (_, EventPayload::SystemInit { .. }) => vec![],

            (TurnState::Idle, EventPayload::UserMessage { .. }) => {
                vec![self.open(event_id, "user")]
            }
            // A user message during an open turn implicitly closes it and
            // opens the next one.
            (TurnState::Open { turn_id, ordinal }, EventPayload::UserMessage { .. }) => {
                let close = TurnAction::Close {
                    turn_id: *turn_id,
                    ordinal: *ordinal,
                    closed_by: TurnClosedBy::RoleFlip,
                };
                self.state = TurnState::Idle;
                vec![close, self.open(event_id, "user")]
            }

            (TurnState::Open { turn_id, ordinal }, EventPayload::UsageMarker { .. }) => {
                let close = TurnAction::Close {
                    turn_id: *turn_id,
                    ordinal: *ordinal,
                    closed_by: TurnClosedBy::Usage,
                };
                self.state = TurnState::Idle;
                vec![close]
            }
            (TurnState::Idle, EventPayload::UsageMarker { .. }) => vec![],

            (TurnState::Open { turn_id, .. }, _) => vec![TurnAction::AppendChild {
                turn_id: *turn_id,
            }],
            // Assistant activity with no open turn (e.g. resumed stream):
            // open implicitly so the children are not lost.
            (TurnState::Idle, _) => {
                let open = self.open(event_id, "assistant");
                let TurnAction::Open { turn_id, .. } = open else {
                    unreachable!()
                };
                vec![open, TurnAction::AppendChild { turn_id }]
            }
        }
    }

    /// Close the open turn when idle longer than `idle_after_ms`.
    pub fn on_idle_check(&mut self, now_ms: i64, idle_after_ms: i64) -> Option<TurnAction> {
        if let TurnState::Open { turn_id, ordinal } = self.state {
            if now_ms - self.last_activity_ms >= idle_after_ms {
                self.state = TurnState::Idle;
                return Some(TurnAction::Close {
                    turn_id,
                    ordinal,
                    closed_by: TurnClosedBy::IdleTimeout,
                });
            }
        }
        None
    }
}
