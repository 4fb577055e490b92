//! State-machine interpreter

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use super::{Behavior, Dispatch};
use crate::runtime::RuntimeConfig;
use crate::runtime::action::{self, Action, Guard, NamedActions};
use crate::runtime::activation::{ActionHost, Activation, Flow};
use crate::runtime::actor::Actor;
use crate::runtime::error::{ConfigError, ConfigResult};
use crate::runtime::message::{Event, SUCCESS_EVENT};

/// Context field holding the persisted state name
pub const STATE_FIELD: &str = "state";

/// Name of the synthetic event used while entering the initial state
pub const INIT_EVENT: &str = "$init";

/// One committed transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Source state
    pub from: String,
    /// Target state
    pub to: String,
    /// Triggering event
    pub event: String,
    /// When the transition committed
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Transition {
    target: String,
    guard: Option<Guard>,
    actions: Vec<Action>,
}

#[derive(Debug, Clone, Default)]
struct StateNode {
    entry: Vec<Action>,
    exit: Vec<Action>,
    on: HashMap<String, Vec<Transition>>,
}

#[derive(Debug, Clone)]
struct MachineDefinition {
    initial: String,
    states: HashMap<String, StateNode>,
    actions: NamedActions,
}

impl MachineDefinition {
    fn parse(definition: &Value) -> ConfigResult<Self> {
        let invalid = |reason: String| ConfigError::InvalidBehavior(reason);

        let initial = definition
            .get("initial")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("state machine requires 'initial'".to_string()))?
            .to_string();
        let raw_states = definition
            .get("states")
            .and_then(Value::as_object)
            .ok_or_else(|| invalid("state machine requires 'states'".to_string()))?;
        let actions = NamedActions::parse(definition.get("actions"))?;

        let mut states = HashMap::new();
        for (name, raw) in raw_states {
            states.insert(name.clone(), parse_state(name, raw)?);
        }

        if !states.contains_key(&initial) {
            return Err(invalid(format!("initial state '{}' is not declared", initial)));
        }
        for (name, node) in &states {
            actions.check_references(&node.entry)?;
            actions.check_references(&node.exit)?;
            for transition in node.on.values().flatten() {
                if !states.contains_key(&transition.target) {
                    return Err(ConfigError::UnknownState {
                        from: name.clone(),
                        to: transition.target.clone(),
                    });
                }
                actions.check_references(&transition.actions)?;
            }
        }

        Ok(Self {
            initial,
            states,
            actions,
        })
    }
}

fn parse_state(name: &str, raw: &Value) -> ConfigResult<StateNode> {
    let Some(object) = raw.as_object() else {
        return Err(ConfigError::InvalidBehavior(format!(
            "state '{}' must be an object",
            name
        )));
    };
    let mut node = StateNode {
        entry: action::parse_list(object.get("entry"))?,
        exit: action::parse_list(object.get("exit"))?,
        on: HashMap::new(),
    };
    if let Some(on) = object.get("on") {
        let on = on.as_object().ok_or_else(|| {
            ConfigError::InvalidBehavior(format!("'on' of state '{}' must be an object", name))
        })?;
        for (event, raw) in on {
            let candidates = match raw {
                Value::Array(items) => items
                    .iter()
                    .map(parse_transition)
                    .collect::<ConfigResult<Vec<_>>>()?,
                single => vec![parse_transition(single)?],
            };
            node.on.insert(event.clone(), candidates);
        }
    }
    Ok(node)
}

fn parse_transition(raw: &Value) -> ConfigResult<Transition> {
    match raw {
        Value::String(target) => Ok(Transition {
            target: target.clone(),
            guard: None,
            actions: Vec::new(),
        }),
        Value::Object(object) => {
            let target = object
                .get("target")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ConfigError::InvalidBehavior(format!("transition {} lacks a target", raw))
                })?;
            Ok(Transition {
                target: target.to_string(),
                guard: object.get("guard").map(Guard::parse).transpose()?,
                actions: action::parse_list(object.get("actions"))?,
            })
        }
        other => Err(ConfigError::InvalidBehavior(format!(
            "transition must be a state name or object, found {}",
            other
        ))),
    }
}

/// Hierarchy-free state machine over named states
pub struct StateMachine {
    definition: MachineDefinition,
    current: String,
    history: VecDeque<TransitionRecord>,
    history_limit: usize,
    suppressed: Vec<String>,
    last_event: Value,
    last_result: Value,
}

impl StateMachine {
    /// Parse and validate a `{"kind": "machine", ..}` definition
    pub fn from_definition(definition: &Value, config: &RuntimeConfig) -> ConfigResult<Self> {
        let definition = MachineDefinition::parse(definition)?;
        Ok(Self {
            current: definition.initial.clone(),
            definition,
            history: VecDeque::new(),
            history_limit: config.history_limit,
            suppressed: config.suppressed_states.clone(),
            last_event: Value::Null,
            last_result: Value::Null,
        })
    }

    fn state_patch(state: &str) -> Map<String, Value> {
        let mut patch = Map::new();
        patch.insert(STATE_FIELD.to_string(), json!(state));
        patch
    }
}

/// Run entry actions of `state`, then auto-deliver SUCCESS after an invoke
fn enter(definition: &MachineDefinition, activation: &mut Activation<'_>, state: &str) {
    let Some(node) = definition.states.get(state) else {
        return;
    };
    activation.invoked = None;
    if activation.run(&node.entry) == Flow::Continue {
        if let Some(result) = activation.invoked.take() {
            if node.on.contains_key(SUCCESS_EVENT) {
                activation.notify_success(result);
            }
        }
    }
}

impl Behavior for StateMachine {
    fn kind(&self) -> &'static str {
        "machine"
    }

    fn start(&mut self, host: &dyn ActionHost, actor: &Actor) {
        let persisted = host
            .store()
            .read(&actor.context)
            .ok()
            .flatten()
            .and_then(|context| context.get(STATE_FIELD).and_then(Value::as_str).map(String::from));

        if let Some(state) = persisted.filter(|state| self.definition.states.contains_key(state)) {
            debug!(actor = %actor.id, %state, "Resuming state machine");
            self.current = state;
            return;
        }

        let initial = self.definition.initial.clone();
        let event = Event::new(INIT_EVENT, json!({}));
        let mut activation = Activation::new(host, actor, &self.definition.actions, &event);
        activation.set_state(&initial);
        activation.stage(Self::state_patch(&initial));
        enter(&self.definition, &mut activation, &initial);
        self.last_result = activation.result.clone();
        activation.finish();
        self.current = initial;
        debug!(actor = %actor.id, state = %self.current, "State machine started");
    }

    fn send(&mut self, host: &dyn ActionHost, actor: &Actor, event: &Event) -> Dispatch {
        let definition = &self.definition;
        let Some(node) = definition.states.get(&self.current) else {
            return Dispatch::default();
        };
        let Some(candidates) = node.on.get(&event.name) else {
            return Dispatch::default();
        };

        let mut activation = Activation::new(host, actor, &definition.actions, event);
        activation.set_state(&self.current);

        let chosen = candidates.iter().find(|transition| match &transition.guard {
            None => true,
            Some(guard) => activation.check_guard(guard).unwrap_or_else(|err| {
                warn!(actor = %actor.id, event = %event.name, error = %err, "Guard failed to evaluate");
                false
            }),
        });
        let Some(transition) = chosen else {
            debug!(actor = %actor.id, state = %self.current, event = %event.name, "No transition qualified");
            return Dispatch::default();
        };

        let from = std::mem::replace(&mut self.current, transition.target.clone());
        let mut flow = activation.run(&node.exit);
        if flow == Flow::Continue {
            flow = activation.run(&transition.actions);
        }

        self.history.push_back(TransitionRecord {
            from: from.clone(),
            to: transition.target.clone(),
            event: event.name.clone(),
            timestamp: Utc::now(),
        });
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        debug!(actor = %actor.id, %from, to = %transition.target, event = %event.name, "Transition");

        activation.set_state(&transition.target);
        activation.stage(Self::state_patch(&transition.target));

        let reenter = transition.target != from || !transition.actions.is_empty();
        if flow == Flow::Continue && reenter {
            enter(definition, &mut activation, &transition.target);
        }

        self.last_event = event.payload.clone();
        self.last_result = activation.result.clone();
        let actions_run = activation.finish();

        let changed = from != self.current;
        Dispatch {
            handled: true,
            rerender: (changed || actions_run > 0) && !self.suppressed.contains(&self.current),
        }
    }

    fn current_state(&self) -> Option<&str> {
        Some(&self.current)
    }

    fn history(&self) -> Vec<TransitionRecord> {
        self.history.iter().cloned().collect()
    }

    fn last_event(&self) -> &Value {
        &self.last_event
    }

    fn last_result(&self) -> &Value {
        &self.last_result
    }
}
