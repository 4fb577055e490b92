//! Action definitions
//!
//! Actions are parsed once, when a behavior is loaded. Every action object
//! must carry exactly one known tag; anything else is a configuration error.
//! A bare string is shorthand for a named action reference.
//!
//! ```json
//! [
//!   {"guard": {"schema": {"required": ["ready"]}}},
//!   {"ctx": {"count": "$context.count + 1"}},
//!   {"op": {"create": {"title": "$item.title"}}},
//!   {"tell": {"target": "<id>", "type": "PING", "payload": {}}},
//!   {"ask": {"target": "<id>", "type": "FETCH"}},
//!   {"function": {"payload": {"q": "$item.q"}}},
//!   "reset"
//! ]
//! ```

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use super::error::{ConfigError, ConfigResult};
use super::ids::{ActorId, ObjectId};

/// Tags recognised in action objects
pub const ACTION_TAGS: [&str; 8] = [
    "ctx", "op", "tell", "ask", "function", "guard", "named", "invoke",
];

/// One step of a handler, transition, or entry/exit list
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Stage a context patch (template resolved per pass)
    Ctx(Value),
    /// One store operation
    Op(OpAction),
    /// Fire-and-forget message
    Tell(SendAction),
    /// Request expecting a later, correlated reply; stops the pass
    Ask(SendAction),
    /// Run the actor's attached function; stops the pass
    Function {
        /// Payload template, the event payload when absent
        payload: Option<Value>,
    },
    /// Guard marker gating the block up to the next marker
    Guard(Guard),
    /// Reference to a definition-level named action list
    Named(String),
    /// Synchronous call of another actor's attached function
    Invoke {
        /// Actor whose function runs
        target: ActorId,
        /// Payload template, the event payload when absent
        payload: Option<Value>,
    },
}

/// Store operation templates
#[derive(Debug, Clone, PartialEq)]
pub enum OpAction {
    /// Create an object from the resolved template
    Create(Value),
    /// Merge-patch an object
    Update {
        /// Template resolving to the object id
        id: Value,
        /// Patch template
        patch: Value,
    },
    /// Delete an object
    Delete {
        /// Template resolving to the object id
        id: Value,
    },
}

/// Message send configuration shared by tell and ask
#[derive(Debug, Clone, PartialEq)]
pub struct SendAction {
    /// Receiving actor, fixed at load time
    pub target: ActorId,
    /// Event type template
    pub event_type: Value,
    /// Payload template
    pub payload: Value,
}

/// Guard condition
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// Constant outcome
    Literal(bool),
    /// JSON schema checked against the guard subject
    Schema(Value),
    /// Expression template, truthiness decides
    Expr(Value),
}

impl Guard {
    /// Parse a guard from its configuration value
    pub fn parse(value: &Value) -> ConfigResult<Self> {
        match value {
            Value::Bool(flag) => Ok(Guard::Literal(*flag)),
            Value::Object(map) if map.len() == 1 && map.contains_key("schema") => {
                let schema = &map["schema"];
                if schema.is_object() || schema.is_boolean() {
                    Ok(Guard::Schema(schema.clone()))
                } else {
                    Err(invalid("guard", "schema must be an object or boolean"))
                }
            }
            Value::String(text) if text.starts_with('$') => Ok(Guard::Expr(value.clone())),
            other => Err(invalid(
                "guard",
                format!("expected a boolean, {{schema}} or expression, found {}", other),
            )),
        }
    }
}

fn invalid(tag: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidAction {
        tag,
        reason: reason.into(),
    }
}

impl Action {
    /// Parse one action
    pub fn parse(value: &Value) -> ConfigResult<Self> {
        let map = match value {
            Value::String(name) => return Ok(Action::Named(name.clone())),
            Value::Object(map) => map,
            other => return Err(ConfigError::ActionShape(other.to_string())),
        };

        let mut tags = map.keys().filter(|key| ACTION_TAGS.contains(&key.as_str()));
        let (Some(tag), None, 1) = (tags.next(), tags.next(), map.len()) else {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            return Err(ConfigError::ActionShape(format!("[{}]", keys.join(", "))));
        };
        let config = &map[tag];

        match tag.as_str() {
            "ctx" => {
                if config.is_object() {
                    Ok(Action::Ctx(config.clone()))
                } else {
                    Err(invalid("ctx", "patch must be an object"))
                }
            }
            "op" => OpAction::parse(config).map(Action::Op),
            "tell" => SendAction::parse("tell", config).map(Action::Tell),
            "ask" => SendAction::parse("ask", config).map(Action::Ask),
            "function" => Ok(Action::Function {
                payload: optional_payload("function", config)?,
            }),
            "guard" => Guard::parse(config).map(Action::Guard),
            "named" => config
                .as_str()
                .map(|name| Action::Named(name.to_string()))
                .ok_or_else(|| invalid("named", "reference must be a string")),
            "invoke" => {
                let object = config
                    .as_object()
                    .ok_or_else(|| invalid("invoke", "config must be an object"))?;
                Ok(Action::Invoke {
                    target: literal_target("invoke", object)?,
                    payload: object.get("payload").cloned(),
                })
            }
            _ => Err(ConfigError::ActionShape(tag.clone())),
        }
    }

    /// Short tag name, used in logs
    pub fn tag(&self) -> &'static str {
        match self {
            Action::Ctx(_) => "ctx",
            Action::Op(_) => "op",
            Action::Tell(_) => "tell",
            Action::Ask(_) => "ask",
            Action::Function { .. } => "function",
            Action::Guard(_) => "guard",
            Action::Named(_) => "named",
            Action::Invoke { .. } => "invoke",
        }
    }
}

fn optional_payload(tag: &'static str, config: &Value) -> ConfigResult<Option<Value>> {
    match config {
        Value::Null | Value::Bool(true) => Ok(None),
        Value::Object(map) => {
            if map.keys().any(|key| key != "payload") {
                return Err(invalid(tag, "only 'payload' may be configured"));
            }
            Ok(map.get("payload").cloned())
        }
        other => Err(invalid(tag, format!("unexpected config {}", other))),
    }
}

fn literal_target(tag: &'static str, config: &Map<String, Value>) -> ConfigResult<ActorId> {
    let target = config
        .get("target")
        .ok_or_else(|| invalid(tag, "missing target"))?;
    ObjectId::from_value(target).ok_or_else(|| {
        invalid(
            tag,
            format!("target must be a literal actor identifier, found {}", target),
        )
    })
}

impl SendAction {
    fn parse(tag: &'static str, config: &Value) -> ConfigResult<Self> {
        let object = config
            .as_object()
            .ok_or_else(|| invalid(tag, "config must be an object"))?;
        let event_type = object
            .get("type")
            .filter(|value| value.is_string())
            .cloned()
            .ok_or_else(|| invalid(tag, "missing event type"))?;
        Ok(Self {
            target: literal_target(tag, object)?,
            event_type,
            payload: object
                .get("payload")
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new())),
        })
    }
}

impl OpAction {
    fn parse(config: &Value) -> ConfigResult<Self> {
        let object = config
            .as_object()
            .filter(|object| object.len() == 1)
            .ok_or_else(|| invalid("op", "expected exactly one of create, update, delete"))?;
        let (kind, body) = object.iter().next().ok_or_else(|| invalid("op", "empty"))?;
        let field = |name: &str| {
            body.get(name)
                .cloned()
                .ok_or_else(|| invalid("op", format!("{} requires '{}'", kind, name)))
        };
        match kind.as_str() {
            "create" => Ok(OpAction::Create(body.clone())),
            "update" => Ok(OpAction::Update {
                id: field("id")?,
                patch: field("patch")?,
            }),
            "delete" => Ok(OpAction::Delete { id: field("id")? }),
            other => Err(invalid("op", format!("unknown operation '{}'", other))),
        }
    }
}

/// Parse an action list; a single action is accepted in place of a list
pub fn parse_list(value: Option<&Value>) -> ConfigResult<Vec<Action>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(Action::parse).collect(),
        Some(single) => Ok(vec![Action::parse(single)?]),
    }
}

/// Named action lists declared at the definition level (`"actions": {..}`)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedActions {
    lists: HashMap<String, Vec<Action>>,
}

impl NamedActions {
    /// Parse the `actions` map of a behavior definition
    pub fn parse(value: Option<&Value>) -> ConfigResult<Self> {
        let mut lists = HashMap::new();
        match value {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                for (name, list) in map {
                    lists.insert(name.clone(), parse_list(Some(list))?);
                }
            }
            Some(other) => {
                return Err(ConfigError::InvalidBehavior(format!(
                    "'actions' must be an object, found {}",
                    other
                )));
            }
        }
        let named = Self { lists };
        named.check_cycles()?;
        Ok(named)
    }

    /// Look up a named list
    pub fn get(&self, name: &str) -> Option<&[Action]> {
        self.lists.get(name).map(Vec::as_slice)
    }

    /// Ensure every named reference in `actions` exists
    pub fn check_references(&self, actions: &[Action]) -> ConfigResult<()> {
        for action in actions {
            if let Action::Named(name) = action {
                if !self.lists.contains_key(name) {
                    return Err(ConfigError::UnknownNamedAction(name.clone()));
                }
            }
        }
        Ok(())
    }

    fn check_cycles(&self) -> ConfigResult<()> {
        let mut done = HashSet::new();
        for name in self.lists.keys() {
            let mut path = Vec::new();
            self.visit(name, &mut path, &mut done)?;
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> ConfigResult<()> {
        if done.contains(name) {
            return Ok(());
        }
        if path.contains(&name) {
            return Err(ConfigError::RecursiveNamedAction(name.to_string()));
        }
        let list = self
            .lists
            .get(name)
            .ok_or_else(|| ConfigError::UnknownNamedAction(name.to_string()))?;
        path.push(name);
        for action in list {
            if let Action::Named(next) = action {
                self.visit(next, path, done)?;
            }
        }
        path.pop();
        done.insert(name);
        Ok(())
    }
}
