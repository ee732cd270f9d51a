//! Engine events - what the host UI subscribes to
//!
//! One broadcast channel per tab. Events carry a correlation id so
//! determinism tests can diff two runs entry by entry.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taleweaver_domain::{ActorKey, Role, RuleId, Visibility};

/// An event emitted by a tab's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TurnStarted {
        turn: u64,
    },
    MessageAppended {
        role: Role,
        speaker: Option<ActorKey>,
        content: String,
        visibility: Visibility,
    },
    StateChanged {
        keys: Vec<String>,
    },
    TimerFired {
        rule: RuleId,
    },
    InferenceError {
        kind: String,
    },
    TurnCompleted {
        turn: u64,
    },
}

/// Envelope pairing an event with its correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    #[serde(flatten)]
    pub event: EngineEvent,
}

impl EventEnvelope {
    pub fn new(event: EngineEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let envelope = EventEnvelope::new(EngineEvent::TurnStarted { turn: 3 });
        let json = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(json["event"], "turn_started");
        assert_eq!(json["turn"], 3);
        assert!(json["id"].is_string());
    }
}
