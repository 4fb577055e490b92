//! Error types for the Ensemble runtime
//!
//! Domain errors are `thiserror` enums, one per subsystem, folded into
//! [`RuntimeError`] at the embedding boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use super::ids::ObjectId;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Message routing failed
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Store-related errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Tool registry errors
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Behavior or actor configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A required collaborator was never wired in
    #[error("Missing infrastructure: {0}")]
    Infrastructure(String),
}

/// Failure to resolve a message target to an inbox
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    /// Target is not a persisted-object identifier
    #[error("target '{0}' is not an object identifier")]
    InvalidTarget(String),

    /// The actor configuration record could not be read
    #[error("configuration for actor {0} could not be read")]
    ConfigUnreadable(ObjectId),

    /// The configuration record lacks a usable inbox id
    #[error("actor {0} has no valid inbox")]
    MissingInbox(ObjectId),

    /// Inbox object vanished between resolution and push
    #[error("inbox {0} does not exist")]
    InboxNotFound(ObjectId),
}

/// Store contract errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Object not found
    #[error("object {0} not found")]
    NotFound(ObjectId),

    /// Writer is not allowed to touch the object
    #[error("permission denied on {id}: {reason}")]
    PermissionDenied {
        /// Object identifier
        id: ObjectId,
        /// Why the write was refused
        reason: String,
    },

    /// Operation shape or target value is unusable
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Convenience result alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Tool registry errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    /// Tool not found in registry
    #[error("tool not found: {name}")]
    NotFound {
        /// Tool name
        name: String,
    },

    /// Payload failed the tool's parameter schema
    #[error("invalid input for tool '{tool}': {}", .errors.join("; "))]
    Validation {
        /// Tool name
        tool: String,
        /// Individual schema violations
        errors: Vec<String>,
    },

    /// Tool refused the caller
    #[error("permission denied for tool '{tool}': {reason}")]
    PermissionDenied {
        /// Tool name
        tool: String,
        /// Reason given by the tool
        reason: String,
    },

    /// Tool ran and failed
    #[error("tool '{tool}' execution failed: {reason}")]
    ExecutionFailed {
        /// Tool name
        tool: String,
        /// Failure detail
        reason: String,
    },
}

/// Convenience result alias for tool operations
pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// Malformed behavior definition or actor configuration, raised at load time
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Action object did not carry exactly one known tag
    #[error("action must carry exactly one tag, found {0}")]
    ActionShape(String),

    /// Action config for a known tag is malformed
    #[error("invalid '{tag}' action: {reason}")]
    InvalidAction {
        /// Action tag
        tag: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// Named action reference does not exist
    #[error("unknown named action '{0}'")]
    UnknownNamedAction(String),

    /// Named actions refer to each other in a loop
    #[error("named action '{0}' is recursive")]
    RecursiveNamedAction(String),

    /// Transition points at a state that is not declared
    #[error("state '{from}' transitions to unknown state '{to}'")]
    UnknownState {
        /// Source state
        from: String,
        /// Missing target
        to: String,
    },

    /// Behavior definition is unusable
    #[error("invalid behavior: {0}")]
    InvalidBehavior(String),

    /// Actor configuration record is unusable
    #[error("invalid actor configuration for {actor}: {reason}")]
    InvalidActor {
        /// Actor identifier
        actor: ObjectId,
        /// Detail
        reason: String,
    },
}

/// Convenience result alias for configuration loading
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Expression evaluation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExprError {
    /// Expression text did not parse
    #[error("cannot parse expression '{expr}': {reason}")]
    Parse {
        /// Source text
        expr: String,
        /// Parser detail
        reason: String,
    },

    /// Operands have the wrong types for the operator
    #[error("type error in '{expr}': {reason}")]
    Type {
        /// Source text
        expr: String,
        /// Detail
        reason: String,
    },
}

/// Classification of a failed action, as carried in ERROR payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Caller was not allowed to perform the operation
    Permission,
    /// Operation was malformed, failed, or targeted something missing
    Structural,
    /// An ask went unanswered past its deadline
    Timeout,
}

impl ErrorKind {
    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Permission => "permission",
            ErrorKind::Structural => "structural",
            ErrorKind::Timeout => "timeout",
        }
    }
}

/// A failure raised while executing an action, destined for an ERROR event
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct ActionError {
    /// Classification
    pub kind: ErrorKind,
    /// Human readable detail
    pub message: String,
}

impl ActionError {
    /// Permission failure
    pub fn permission(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permission,
            message: message.into(),
        }
    }

    /// Structural failure
    pub fn structural(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Structural,
            message: message.into(),
        }
    }

    /// Unanswered ask
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: message.into(),
        }
    }

    /// Render the `{errors: [{kind, message}]}` payload of an ERROR event
    pub fn to_payload(&self) -> Value {
        json!({
            "errors": [{ "kind": self.kind.as_str(), "message": self.message }]
        })
    }
}

impl From<StoreError> for ActionError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::PermissionDenied { .. } => ActionError::permission(err.to_string()),
            _ => ActionError::structural(err.to_string()),
        }
    }
}

impl From<ToolError> for ActionError {
    fn from(err: ToolError) -> Self {
        match &err {
            ToolError::PermissionDenied { .. } => ActionError::permission(err.to_string()),
            _ => ActionError::structural(err.to_string()),
        }
    }
}

impl From<ExprError> for ActionError {
    fn from(err: ExprError) -> Self {
        ActionError::structural(err.to_string())
    }
}

impl From<RoutingError> for ActionError {
    fn from(err: RoutingError) -> Self {
        ActionError::structural(err.to_string())
    }
}

impl From<RuntimeError> for ActionError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Store(err) => err.into(),
            RuntimeError::Tool(err) => err.into(),
            other => ActionError::structural(other.to_string()),
        }
    }
}

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
