//! Messages, persisted inbox entries, and interpreter events

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{ActorId, CorrelationId, MessageId};

/// Event type delivered when a request or function call succeeds
pub const SUCCESS_EVENT: &str = "SUCCESS";

/// Event type delivered when an action fails
pub const ERROR_EVENT: &str = "ERROR";

/// Payload field carrying the idempotency key of the originating message
pub const IDEMPOTENCY_FIELD: &str = "idempotencyKey";

/// An outbound message, before it is pushed into an inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Event type name
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload
    pub payload: Value,
    /// Sending actor, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ActorId>,
    /// Request correlation for ask/reply pairs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<CorrelationId>,
}

impl Message {
    /// Create a message with no source
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            source: None,
            correlation: None,
        }
    }

    /// Set the sending actor
    pub fn from_actor(mut self, source: ActorId) -> Self {
        self.source = Some(source);
        self
    }

    /// Attach a correlation id
    pub fn correlated(mut self, correlation: Option<CorrelationId>) -> Self {
        self.correlation = correlation;
        self
    }
}

/// The persisted form of a message inside an inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxEntry {
    /// Identity of the persisted message object
    #[serde(skip)]
    pub id: MessageId,
    /// Event type name
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload
    pub payload: Value,
    /// Sending actor, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ActorId>,
    /// Receiving actor
    pub target: ActorId,
    /// Request correlation for ask/reply pairs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<CorrelationId>,
    /// Whether the entry has been handled
    pub processed: bool,
}

impl InboxEntry {
    /// Build the entry for `message` addressed to `target`
    pub fn pending(id: MessageId, target: ActorId, message: Message) -> Self {
        Self {
            id,
            event_type: message.event_type,
            payload: message.payload,
            source: message.source,
            target,
            correlation: message.correlation,
            processed: false,
        }
    }

    /// Decode an entry previously written to the store
    pub fn from_stored(id: MessageId, value: Value) -> Option<Self> {
        let mut entry: InboxEntry = serde_json::from_value(value).ok()?;
        entry.id = id;
        Some(entry)
    }
}

/// Derive the idempotency key for a persisted message
pub fn idempotency_key(id: &MessageId) -> String {
    let hash = blake3::hash(id.0.as_bytes());
    format!("idem_{}", hash.to_hex())
}

/// One event as seen by a behavior interpreter
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Event name
    pub name: String,
    /// Validated payload (merged with the idempotency key when delivered from an inbox)
    pub payload: Value,
    /// Actor that sent the message, if any
    pub source: Option<ActorId>,
    /// Correlation carried by the triggering message
    pub correlation: Option<CorrelationId>,
}

impl Event {
    /// Create an event with no source
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            source: None,
            correlation: None,
        }
    }

    /// Idempotency key carried in the payload, if any
    pub fn idempotency_key(&self) -> Option<&str> {
        self.payload.get(IDEMPOTENCY_FIELD).and_then(Value::as_str)
    }
}
