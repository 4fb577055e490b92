//! Flat-handler interpreter

use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use super::{Behavior, Dispatch};
use super::machine::STATE_FIELD;
use crate::runtime::RuntimeConfig;
use crate::runtime::action::{self, Action, NamedActions};
use crate::runtime::activation::{ActionHost, Activation};
use crate::runtime::actor::Actor;
use crate::runtime::error::{ConfigError, ConfigResult};
use crate::runtime::message::Event;

/// Event handlers with no explicit states
///
/// Any phase needed for branching lives in context fields read by guards.
/// A `state` field in the context, if present, is only consulted to
/// suppress rerenders.
pub struct Process {
    handlers: HashMap<String, Vec<Action>>,
    actions: NamedActions,
    suppressed: Vec<String>,
    last_event: Value,
    last_result: Value,
}

impl Process {
    /// Parse and validate a `{"kind": "process", ..}` definition
    pub fn from_definition(definition: &Value, config: &RuntimeConfig) -> ConfigResult<Self> {
        let actions = NamedActions::parse(definition.get("actions"))?;
        let raw = match definition.get("handlers") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(other) => {
                return Err(ConfigError::InvalidBehavior(format!(
                    "'handlers' must be an object, found {}",
                    other
                )));
            }
        };

        let mut handlers = HashMap::new();
        for (event, list) in raw.into_iter().flatten() {
            let list = action::parse_list(Some(list))?;
            actions.check_references(&list)?;
            handlers.insert(event.clone(), list);
        }

        Ok(Self {
            handlers,
            actions,
            suppressed: config.suppressed_states.clone(),
            last_event: Value::Null,
            last_result: Value::Null,
        })
    }

}

impl Behavior for Process {
    fn kind(&self) -> &'static str {
        "process"
    }

    fn start(&mut self, _host: &dyn ActionHost, actor: &Actor) {
        debug!(actor = %actor.id, handlers = self.handlers.len(), "Process started");
    }

    fn send(&mut self, host: &dyn ActionHost, actor: &Actor, event: &Event) -> Dispatch {
        let Some(handler) = self.handlers.get(&event.name) else {
            return Dispatch::default();
        };

        let mut activation = Activation::new(host, actor, &self.actions, event);
        activation.run(handler);

        let suppressed = activation
            .context()
            .get(STATE_FIELD)
            .and_then(Value::as_str)
            .is_some_and(|state| self.suppressed.iter().any(|s| s == state));

        self.last_event = event.payload.clone();
        self.last_result = activation.result.clone();
        let actions_run = activation.finish();

        Dispatch {
            handled: true,
            rerender: actions_run > 0 && !suppressed,
        }
    }

    fn last_event(&self) -> &Value {
        &self.last_event
    }

    fn last_result(&self) -> &Value {
        &self.last_result
    }
}
