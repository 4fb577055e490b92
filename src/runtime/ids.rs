//! Identifiers shared across the runtime
//!
//! Everything the store persists is addressed by an opaque [`ObjectId`].
//! Actors, inboxes, contexts and messages are all store objects, so their
//! identifiers are aliases of the same type.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::RoutingError;

/// Opaque persisted-object identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub Uuid);

impl ObjectId {
    /// Create a new random ObjectId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Read an identifier out of a JSON value, if it is a well-formed string id
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        value.as_str().and_then(|text| text.parse().ok())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| RoutingError::InvalidTarget(s.to_string()))
    }
}

/// Actor identifier (the id of the actor's configuration record)
pub type ActorId = ObjectId;

/// Inbox identifier
pub type InboxId = ObjectId;

/// Persisted message identifier
pub type MessageId = ObjectId;

/// Correlates an `ask` request with its eventual reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    /// Create a new random CorrelationId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
