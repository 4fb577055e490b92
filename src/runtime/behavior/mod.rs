//! Behavior interpreters
//!
//! A behavior turns one event into effects for one actor. Two variants share
//! the [`Behavior`] contract and the action execution in
//! [`Activation`](super::activation::Activation):
//!
//! - [`StateMachine`]: named states with entry/exit actions and guarded
//!   transitions; the current state is persisted in the context as `state`.
//! - [`Process`]: a flat table of event handlers; any phase lives in context.
//!
//! Definitions are parsed and validated by [`load`] when the actor is
//! spawned, so malformed configuration never reaches message handling.

use serde_json::Value;

use super::RuntimeConfig;
use super::activation::ActionHost;
use super::actor::Actor;
use super::error::{ConfigError, ConfigResult};
use super::message::Event;

pub mod machine;
pub mod process;

pub use machine::{StateMachine, TransitionRecord};
pub use process::Process;

/// Outcome of handing one event to a behavior
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    /// A transition or handler applied
    pub handled: bool,
    /// Visible state changed; the caller schedules the rerender
    pub rerender: bool,
}

/// Interpreter for one actor
pub trait Behavior: Send {
    /// Variant name (`machine` or `process`)
    fn kind(&self) -> &'static str;

    /// Called once when the actor is spawned
    fn start(&mut self, host: &dyn ActionHost, actor: &Actor);

    /// Handle one event
    ///
    /// The rerender request is returned rather than scheduled, so the hook
    /// runs only after the actor is released.
    fn send(&mut self, host: &dyn ActionHost, actor: &Actor, event: &Event) -> Dispatch;

    /// Current state name, for state machines
    fn current_state(&self) -> Option<&str> {
        None
    }

    /// Committed transitions, oldest first, for state machines
    fn history(&self) -> Vec<TransitionRecord> {
        Vec::new()
    }

    /// Payload of the last handled event
    fn last_event(&self) -> &Value;

    /// Most recent tool or operation result
    fn last_result(&self) -> &Value;
}

/// Build a behavior from its definition
///
/// ```json
/// {"kind": "machine", "initial": "idle", "states": {..}, "actions": {..}}
/// {"kind": "process", "handlers": {"INC": [..]}, "actions": {..}}
/// ```
pub fn load(definition: &Value, config: &RuntimeConfig) -> ConfigResult<Box<dyn Behavior>> {
    let kind = definition
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| ConfigError::InvalidBehavior("missing 'kind'".to_string()))?;
    match kind {
        "machine" => Ok(Box::new(StateMachine::from_definition(definition, config)?)),
        "process" => Ok(Box::new(Process::from_definition(definition, config)?)),
        other => Err(ConfigError::InvalidBehavior(format!(
            "unknown behavior kind '{}'",
            other
        ))),
    }
}
