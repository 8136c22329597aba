//! Control messages exchanged with application instances.
//!
//! Messages are JSON objects tagged by a `type` field.

use serde_json::{json, Value};

pub const ADVANCE_TO_NEW_GENERATION: &str = "advance-to-new-generation";
/// Legacy name of [`ADVANCE_TO_NEW_GENERATION`].
pub const SKIP_WAITING: &str = "SKIP_WAITING";
pub const CLEAR_ALL_GENERATIONS: &str = "clear-all-generations";
pub const TAKEOVER_OCCURRED: &str = "takeover-occurred";

/// A message sent by an application instance.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Promote the waiting generation now.
    AdvanceToNewGeneration,
    /// Delete every generation.
    ClearAllGenerations,
    /// Application notification for the other instances. The payload is
    /// relayed as received.
    Notify { kind: String, payload: Value },
}

impl ControlMessage {
    /// Interpret a message. `None` if it carries no string `type`.
    pub fn parse(message: &Value) -> Option<Self> {
        let kind = message.get("type")?.as_str()?;
        Some(match kind {
            ADVANCE_TO_NEW_GENERATION | SKIP_WAITING => ControlMessage::AdvanceToNewGeneration,
            CLEAR_ALL_GENERATIONS => ControlMessage::ClearAllGenerations,
            other => ControlMessage::Notify {
                kind: other.to_string(),
                payload: message.clone(),
            },
        })
    }

    /// Parse a JSON text. Invalid JSON is an error; a valid message without a
    /// `type` is `Ok(None)`.
    pub fn from_json(text: &str) -> Result<Option<Self>, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::parse(&value))
    }

    pub fn to_json(&self) -> Value {
        match self {
            ControlMessage::AdvanceToNewGeneration => json!({ "type": ADVANCE_TO_NEW_GENERATION }),
            ControlMessage::ClearAllGenerations => json!({ "type": CLEAR_ALL_GENERATIONS }),
            ControlMessage::Notify { payload, .. } => payload.clone(),
        }
    }
}

/// A message delivered to application instances.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// A new generation took over; instances may want to reload.
    TakeoverOccurred { generation: String },
    /// Notification relayed from another instance.
    Relay(Value),
}

impl OutboundMessage {
    /// The `type` field of the message.
    pub fn kind(&self) -> &str {
        match self {
            OutboundMessage::TakeoverOccurred { .. } => TAKEOVER_OCCURRED,
            OutboundMessage::Relay(payload) => payload.get("type").and_then(Value::as_str).unwrap_or_default(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            OutboundMessage::TakeoverOccurred { generation } => {
                json!({ "type": TAKEOVER_OCCURRED, "generation": generation })
            }
            OutboundMessage::Relay(payload) => payload.clone(),
        }
    }
}
