//! Activation: the execution context of one interpreter pass
//!
//! An activation is created for each event a behavior handles. It holds the
//! context as read at the start of the pass, the working context that `ctx`
//! patches are applied to, and the most recent tool/operation result. Both interpreter
//! variants run their action lists through it, and it performs the single
//! context write of the pass in [`Activation::finish`].
//!
//! Failures raised by operations, tools and sends are never returned to the
//! caller: they become an `ERROR` event for the triggering message's source
//! and for the acting actor, and the pass stops.

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::action::{Action, Guard, NamedActions, OpAction, SendAction};
use super::actor::Actor;
use super::error::ActionError;
use super::expr::{self, ExpressionResolver};
use super::ids::{ActorId, CorrelationId, MessageId, ObjectId};
use super::message::{ERROR_EVENT, Event, Message, SUCCESS_EVENT};
use super::schema::SchemaValidator;
use super::store::{Store, StoreOp, diff_patch, merge_patch};
use super::tools::{ActorView, ToolRegistry};

/// Everything an activation needs from the surrounding runtime
///
/// Implemented by the supervisor. Deliveries made through the host are
/// queued; they are never handled before the current pass returns.
pub trait ActionHost: Send + Sync {
    /// Store holding contexts, inboxes and messages
    fn store(&self) -> &dyn Store;

    /// Registry used by the `function` and `invoke` actions
    fn tools(&self) -> &ToolRegistry;

    /// Schema validator for schema guards
    fn validator(&self) -> &dyn SchemaValidator;

    /// Expression resolver for action templates
    fn resolver(&self) -> &dyn ExpressionResolver;

    /// Push a message to `target` and schedule it for handling
    fn deliver(&self, target: ActorId, message: Message) -> Result<MessageId, ActionError>;

    /// Event types accepted by `target`
    fn interface_of(&self, target: ActorId) -> Result<Vec<String>, ActionError>;

    /// Record an outstanding ask and return its correlation id
    fn register_request(&self, asker: ActorId, target: ActorId, event: &str) -> CorrelationId;

    /// Run `target`'s attached function synchronously
    fn invoke(&self, target: ActorId, payload: &Value) -> Result<Value, ActionError>;
}

/// Whether the remaining actions of the pass should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep going
    Continue,
    /// Stop processing further actions this pass
    Stop,
}

/// Strip tool-call metadata from a raw tool result
pub fn clean_result(raw: Value) -> Value {
    let mut value = match raw {
        Value::Object(mut map) => match map.remove("structuredContent") {
            Some(content) => content,
            None => Value::Object(map),
        },
        other => other,
    };
    if let Value::Object(map) = &mut value {
        map.remove("_meta");
        map.remove("toolCallId");
        map.remove("isError");
    }
    value
}

/// Payload of a SUCCESS reply: the triggering payload plus `result`
pub fn success_payload(payload: &Value, result: Value) -> Value {
    let mut reply = match payload {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    reply.insert("result".to_string(), result);
    Value::Object(reply)
}

/// Execution context of one pass
pub struct Activation<'a> {
    host: &'a dyn ActionHost,
    actor: &'a Actor,
    named: &'a NamedActions,
    event: &'a Event,
    base: Value,
    working: Value,
    state: Option<String>,
    creates: usize,
    /// Most recent operation or tool result
    pub result: Value,
    /// Result of the last successful `invoke`, cleaned
    pub invoked: Option<Value>,
    /// Number of side-effecting actions executed
    pub actions_run: usize,
}

impl<'a> Activation<'a> {
    /// Start a pass for `actor` handling `event`
    pub fn new(
        host: &'a dyn ActionHost,
        actor: &'a Actor,
        named: &'a NamedActions,
        event: &'a Event,
    ) -> Self {
        let base = match host.store().read(&actor.context) {
            Ok(Some(value)) if value.is_object() => value,
            Ok(_) => json!({}),
            Err(err) => {
                warn!(actor = %actor.id, error = %err, "Context unreadable, starting from empty");
                json!({})
            }
        };
        Self {
            host,
            actor,
            named,
            event,
            working: base.clone(),
            base,
            state: None,
            creates: 0,
            result: Value::Null,
            invoked: None,
            actions_run: 0,
        }
    }

    /// Context as persisted before this pass
    pub fn base(&self) -> &Value {
        &self.base
    }

    /// Context with every staged patch applied
    pub fn context(&self) -> Value {
        self.working.clone()
    }

    /// Set the state name exposed to schema guards
    pub fn set_state(&mut self, state: &str) {
        self.state = Some(state.to_string());
    }

    /// Stage a context patch; a null value removes the key
    pub fn stage(&mut self, patch: Map<String, Value>) {
        merge_patch(&mut self.working, &Value::Object(patch));
    }

    fn scope(&self) -> Value {
        expr::scope(&self.context(), &self.event.payload, &self.result)
    }

    fn resolve(&self, template: &Value) -> Result<Value, ActionError> {
        Ok(self.host.resolver().resolve(template, &self.scope())?)
    }

    /// Evaluate a guard against the current context
    ///
    /// Schema guards validate the context, with `state` set to the current
    /// state name when the pass belongs to a state machine.
    pub fn check_guard(&self, guard: &Guard) -> Result<bool, ActionError> {
        match guard {
            Guard::Literal(flag) => Ok(*flag),
            Guard::Schema(schema) => {
                let mut subject = self.context();
                if let (Some(state), Value::Object(map)) = (&self.state, &mut subject) {
                    map.insert("state".to_string(), Value::String(state.clone()));
                }
                Ok(self.host.validator().validate(schema, &subject).valid)
            }
            Guard::Expr(template) => Ok(expr::truthy(&self.resolve(template)?)),
        }
    }

    /// Run an action list, honouring guard markers
    pub fn run(&mut self, actions: &[Action]) -> Flow {
        let mut skipping = false;
        for action in actions {
            if let Action::Guard(guard) = action {
                skipping = match self.check_guard(guard) {
                    Ok(pass) => !pass,
                    Err(err) => return self.fail(err),
                };
                continue;
            }
            if skipping {
                continue;
            }
            if self.execute(action) == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn execute(&mut self, action: &Action) -> Flow {
        debug!(actor = %self.actor.id, action = action.tag(), "Executing action");
        if let Action::Named(name) = action {
            let named = self.named;
            return match named.get(name) {
                Some(list) => self.run(list),
                None => self.fail(ActionError::structural(format!(
                    "unknown named action '{}'",
                    name
                ))),
            };
        }

        self.actions_run += 1;
        let outcome = match action {
            Action::Ctx(template) => self.ctx(template),
            Action::Op(op) => self.op(op),
            Action::Tell(send) => self.tell(send),
            Action::Ask(send) => self.ask(send),
            Action::Function { payload } => self.function(payload.as_ref()),
            Action::Invoke { target, payload } => self.invoke(*target, payload.as_ref()),
            Action::Guard(_) | Action::Named(_) => Ok(Flow::Continue),
        };
        match outcome {
            Ok(flow) => flow,
            Err(err) => self.fail(err),
        }
    }

    fn ctx(&mut self, template: &Value) -> Result<Flow, ActionError> {
        match self.resolve(template)? {
            Value::Object(patch) => {
                self.stage(patch);
                Ok(Flow::Continue)
            }
            other => Err(ActionError::structural(format!(
                "context patch resolved to {}",
                other
            ))),
        }
    }

    fn object_id(&self, template: &Value) -> Result<ObjectId, ActionError> {
        let value = self.resolve(template)?;
        ObjectId::from_value(&value)
            .ok_or_else(|| ActionError::structural(format!("{} is not an object id", value)))
    }

    fn op(&mut self, op: &OpAction) -> Result<Flow, ActionError> {
        let op = match op {
            OpAction::Create(template) => {
                // Later creates in the same pass get a derived key.
                let idempotency_key = self.event.idempotency_key().map(|key| match self.creates {
                    0 => key.to_string(),
                    n => format!("{}:{}", key, n),
                });
                self.creates += 1;
                StoreOp::Create {
                    value: self.resolve(template)?,
                    idempotency_key,
                }
            }
            OpAction::Update { id, patch } => StoreOp::Update {
                id: self.object_id(id)?,
                patch: self.resolve(patch)?,
            },
            OpAction::Delete { id } => StoreOp::Delete {
                id: self.object_id(id)?,
            },
        };
        debug!(actor = %self.actor.id, op = op.name(), "Executing store operation");
        self.result = self.host.store().execute(op)?;
        Ok(Flow::Continue)
    }

    fn outbound(&self, send: &SendAction) -> Result<Message, ActionError> {
        let event_type = match self.resolve(&send.event_type)? {
            Value::String(name) => name,
            other => {
                return Err(ActionError::structural(format!(
                    "event type resolved to {}",
                    other
                )));
            }
        };
        Ok(Message::new(event_type, self.resolve(&send.payload)?).from_actor(self.actor.id))
    }

    fn tell(&mut self, send: &SendAction) -> Result<Flow, ActionError> {
        let message = self.outbound(send)?.correlated(self.event.correlation);
        self.host.deliver(send.target, message)?;
        Ok(Flow::Continue)
    }

    fn ask(&mut self, send: &SendAction) -> Result<Flow, ActionError> {
        let message = self.outbound(send)?;
        let accepted = self.host.interface_of(send.target)?;
        if !accepted.contains(&message.event_type) {
            return Err(ActionError::structural(format!(
                "actor {} does not accept '{}'",
                send.target, message.event_type
            )));
        }
        let correlation =
            self.host
                .register_request(self.actor.id, send.target, &message.event_type);
        self.host
            .deliver(send.target, message.correlated(Some(correlation)))?;
        debug!(actor = %self.actor.id, target = %send.target, %correlation, "Ask sent");
        Ok(Flow::Stop)
    }

    fn function(&mut self, template: Option<&Value>) -> Result<Flow, ActionError> {
        let tool = self
            .actor
            .function
            .clone()
            .ok_or_else(|| ActionError::structural("actor has no attached function"))?;
        let payload = match template {
            Some(template) => self.resolve(template)?,
            None => self.event.payload.clone(),
        };
        let view = ActorView {
            id: self.actor.id,
            context: self.context(),
        };
        let raw = self.host.tools().execute(&tool, &view, &payload)?;
        let cleaned = clean_result(raw);
        self.result = cleaned.clone();

        let reply = success_payload(&self.event.payload, cleaned);
        self.reply(SUCCESS_EVENT, reply);
        Ok(Flow::Stop)
    }

    fn invoke(&mut self, target: ActorId, template: Option<&Value>) -> Result<Flow, ActionError> {
        let payload = match template {
            Some(template) => self.resolve(template)?,
            None => self.event.payload.clone(),
        };
        let cleaned = clean_result(self.host.invoke(target, &payload)?);
        self.result = cleaned.clone();
        self.invoked = Some(cleaned);
        Ok(Flow::Continue)
    }

    /// Send a reply event to the triggering message's source and to self
    fn reply(&self, event_type: &str, payload: Value) {
        let mut targets = Vec::with_capacity(2);
        if let Some(source) = self.event.source.filter(|source| *source != self.actor.id) {
            targets.push(source);
        }
        targets.push(self.actor.id);

        for target in targets {
            let message = Message::new(event_type, payload.clone())
                .from_actor(self.actor.id)
                .correlated(self.event.correlation);
            if let Err(err) = self.host.deliver(target, message) {
                warn!(actor = %self.actor.id, %target, error = %err, "Reply could not be delivered");
            }
        }
    }

    /// Convert an action failure into ERROR events and stop the pass
    pub fn fail(&mut self, err: ActionError) -> Flow {
        warn!(
            actor = %self.actor.id,
            event = %self.event.name,
            kind = err.kind.as_str(),
            error = %err.message,
            "Action failed"
        );
        if self.event.name == ERROR_EVENT {
            // A failing ERROR handler must not feed itself.
            return Flow::Stop;
        }
        self.reply(ERROR_EVENT, err.to_payload());
        Flow::Stop
    }

    /// Deliver SUCCESS to self carrying `result` (used after a successful invoke)
    pub fn notify_success(&self, result: Value) {
        let message = Message::new(SUCCESS_EVENT, success_payload(&self.event.payload, result))
            .from_actor(self.actor.id)
            .correlated(self.event.correlation);
        if let Err(err) = self.host.deliver(self.actor.id, message) {
            warn!(actor = %self.actor.id, error = %err, "SUCCESS could not be delivered");
        }
    }

    /// Write the staged changes as the single context write of this pass
    pub fn finish(self) -> usize {
        let op = StoreOp::Update {
            id: self.actor.context,
            patch: diff_patch(&self.base, &self.working),
        };
        if let Err(err) = self.host.store().execute(op) {
            warn!(actor = %self.actor.id, error = %err, "Context flush failed");
            let err = ActionError::from(err);
            if self.event.name != ERROR_EVENT {
                let message = Message::new(ERROR_EVENT, err.to_payload()).from_actor(self.actor.id);
                if let Err(err) = self.host.deliver(self.actor.id, message) {
                    warn!(actor = %self.actor.id, error = %err, "ERROR could not be delivered");
                }
            }
        }
        self.actions_run
    }
}
