//! Supervisor: actor registry, cooperative scheduling and ask bookkeeping
//!
//! The supervisor owns every running actor and pumps pending inbox entries
//! into their behaviors. Scheduling is cooperative: deliveries only enqueue
//! the target, and a single pump loop drains one entry per actor per round,
//! so an actor's handling of one message never interleaves with another
//! message for the same actor. Messages sent while a pump is running are
//! handled by that same pump, after the current pass returns.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::RuntimeConfig;
use super::activation::ActionHost;
use super::actor::{Actor, ActorConfig};
use super::behavior::{self, Behavior, TransitionRecord};
use super::error::{ActionError, Result};
use super::expr::{ExpressionResolver, Expressions};
use super::ids::{ActorId, CorrelationId, InboxId, MessageId, ObjectId};
use super::inbox::{ActorDirectory, ENTRIES_FIELD, InboxEngine, Verdict};
use super::message::{ERROR_EVENT, Event, InboxEntry, Message, SUCCESS_EVENT};
use super::schema::{JsonSchema, SchemaValidator};
use super::store::{Store, StoreOp, Subscription};
use super::tools::{ActorView, ToolRegistry};

/// Receives rerender requests for actors whose visible state changed
pub trait RerenderHook: Send + Sync {
    /// Schedule a rerender of `actor`
    fn schedule_rerender(&self, actor: ActorId);
}

impl<F> RerenderHook for F
where
    F: Fn(ActorId) + Send + Sync,
{
    fn schedule_rerender(&self, actor: ActorId) {
        self(actor)
    }
}

/// Hook that ignores rerender requests
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRerender;

impl RerenderHook for NoRerender {
    fn schedule_rerender(&self, _actor: ActorId) {}
}

/// An ask awaiting its reply
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    /// Actor that asked
    pub asker: ActorId,
    /// Actor asked
    pub target: ActorId,
    /// Event type of the request
    pub event: String,
    /// When the request times out
    pub deadline: DateTime<Utc>,
}

/// A timed-out ask whose answer, if it arrives, is dropped
#[derive(Debug, Clone, Copy)]
struct ExpiredRequest {
    asker: ActorId,
    expired_at: DateTime<Utc>,
}

/// Clears the pump flag when dropped, including during unwinding
struct PumpGuard<'a>(&'a AtomicBool);

impl Drop for PumpGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ActorRuntime {
    actor: Actor,
    behavior: Box<dyn Behavior>,
    cursor: usize,
    subscription: Option<Subscription>,
}

struct RunningActor {
    inbox: InboxId,
    runtime: Arc<Mutex<ActorRuntime>>,
}

/// FIFO of actors with pending work, each queued at most once
#[derive(Default)]
struct ReadyQueue {
    order: VecDeque<ActorId>,
    queued: HashSet<ActorId>,
}

impl ReadyQueue {
    fn push(&mut self, actor: ActorId) {
        if self.queued.insert(actor) {
            self.order.push_back(actor);
        }
    }

    fn pop(&mut self) -> Option<ActorId> {
        let actor = self.order.pop_front()?;
        self.queued.remove(&actor);
        Some(actor)
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Builder for [`Supervisor`]
pub struct SupervisorBuilder {
    config: RuntimeConfig,
    store: Arc<dyn Store>,
    tools: Option<Arc<ToolRegistry>>,
    validator: Option<Arc<dyn SchemaValidator>>,
    resolver: Option<Arc<dyn ExpressionResolver>>,
    rerender: Option<Arc<dyn RerenderHook>>,
}

impl SupervisorBuilder {
    /// Use a shared tool registry
    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Use a custom schema validator
    pub fn validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Use a custom expression resolver
    pub fn resolver(mut self, resolver: Arc<dyn ExpressionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Receive rerender requests
    pub fn rerender_hook(mut self, hook: Arc<dyn RerenderHook>) -> Self {
        self.rerender = Some(hook);
        self
    }

    /// Build the supervisor
    pub fn build(self) -> Arc<Supervisor> {
        let validator = self.validator.unwrap_or_else(|| Arc::new(JsonSchema));
        let inbox = InboxEngine::new(
            self.store.clone(),
            validator.clone(),
            self.config.mutation_event.clone(),
        );
        Arc::new_cyclic(|me| Supervisor {
            me: me.clone(),
            config: self.config,
            store: self.store,
            inbox,
            tools: self.tools.unwrap_or_default(),
            validator,
            resolver: self.resolver.unwrap_or_else(|| Arc::new(Expressions)),
            rerender: self.rerender.unwrap_or_else(|| Arc::new(NoRerender)),
            actors: RwLock::new(HashMap::new()),
            ready: Mutex::new(ReadyQueue::default()),
            pumping: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            expired: Mutex::new(HashMap::new()),
        })
    }
}

/// Owner of all running actors
pub struct Supervisor {
    me: Weak<Supervisor>,
    config: RuntimeConfig,
    store: Arc<dyn Store>,
    inbox: InboxEngine,
    tools: Arc<ToolRegistry>,
    validator: Arc<dyn SchemaValidator>,
    resolver: Arc<dyn ExpressionResolver>,
    rerender: Arc<dyn RerenderHook>,
    actors: RwLock<HashMap<ActorId, RunningActor>>,
    ready: Mutex<ReadyQueue>,
    pumping: AtomicBool,
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
    expired: Mutex<HashMap<CorrelationId, ExpiredRequest>>,
}

impl Supervisor {
    /// Start building a supervisor over `store`
    pub fn builder(config: RuntimeConfig, store: Arc<dyn Store>) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            store,
            tools: None,
            validator: None,
            resolver: None,
            rerender: None,
        }
    }

    /// Runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Inbox engine used for every delivery
    pub fn inbox(&self) -> &InboxEngine {
        &self.inbox
    }

    /// Whether `actor` is running
    pub fn is_running(&self, actor: ActorId) -> bool {
        self.actors.read().contains_key(&actor)
    }

    /// Ids of all running actors
    pub fn running(&self) -> Vec<ActorId> {
        let mut ids: Vec<ActorId> = self.actors.read().keys().copied().collect();
        ids.sort();
        ids
    }

    fn runtime(&self, actor: ActorId) -> Option<Arc<Mutex<ActorRuntime>>> {
        self.actors
            .read()
            .get(&actor)
            .map(|running| running.runtime.clone())
    }

    /// Current state of a running state-machine actor
    pub fn current_state(&self, actor: ActorId) -> Option<String> {
        let runtime = self.runtime(actor)?;
        let runtime = runtime.lock();
        runtime.behavior.current_state().map(String::from)
    }

    /// Transition history of a running state-machine actor
    pub fn history(&self, actor: ActorId) -> Vec<TransitionRecord> {
        let Some(runtime) = self.runtime(actor) else {
            return Vec::new();
        };
        let runtime = runtime.lock();
        runtime.behavior.history()
    }

    /// Payload of the last event a running actor handled
    pub fn last_event(&self, actor: ActorId) -> Option<Value> {
        let runtime = self.runtime(actor)?;
        let runtime = runtime.lock();
        Some(runtime.behavior.last_event().clone())
    }

    /// Load `actor` from its configuration record and start its behavior
    ///
    /// Spawning an actor that is already running is a no-op.
    pub fn spawn(&self, id: ActorId) -> Result<()> {
        if self.is_running(id) {
            return Ok(());
        }
        let record = self.inbox.read_config(id)?;
        let config = ActorConfig::from_value(id, record)?;
        let actor = Actor::from_config(id, &config);
        let behavior = behavior::load(&config.behavior, &self.config)?;
        let kind = behavior.kind();

        let runtime = Arc::new(Mutex::new(ActorRuntime {
            actor,
            behavior,
            cursor: 0,
            subscription: None,
        }));
        {
            let mut actors = self.actors.write();
            if actors.contains_key(&id) {
                return Ok(());
            }
            actors.insert(
                id,
                RunningActor {
                    inbox: config.inbox,
                    runtime: runtime.clone(),
                },
            );
        }

        let me = self.me.clone();
        let subscription = self.store.subscribe(
            &config.inbox,
            Arc::new(move |_inbox: &ObjectId, _value: &Value| {
                if let Some(supervisor) = me.upgrade() {
                    supervisor.schedule_drain(id);
                }
            }),
        );
        info!(actor = %id, kind, "Actor spawned");

        {
            let mut guard = runtime.lock();
            let ActorRuntime {
                actor,
                behavior,
                subscription: slot,
                ..
            } = &mut *guard;
            *slot = Some(subscription);
            behavior.start(self, actor);
        }
        self.schedule_drain(id);
        Ok(())
    }

    /// Stop a running actor; its inbox and context stay in the store
    pub fn stop(&self, id: ActorId) -> bool {
        let Some(running) = self.actors.write().remove(&id) else {
            return false;
        };
        if let Some(subscription) = running.runtime.lock().subscription.take() {
            subscription.unsubscribe();
        }
        self.pending.lock().retain(|_, request| request.asker != id);
        self.expired.lock().retain(|_, request| request.asker != id);
        info!(actor = %id, "Actor stopped");
        true
    }

    /// Deliver a message and run the pump until no work is left
    pub fn deliver(&self, target: ActorId, message: Message) -> Result<MessageId> {
        let id = self.inbox.deliver(self, target, message)?;
        self.pump();
        Ok(id)
    }

    /// Queue `actor` for draining
    pub fn schedule_drain(&self, actor: ActorId) {
        self.ready.lock().push(actor);
    }

    /// Drain queued actors until the ready queue is empty
    ///
    /// Returns the number of inbox entries handled. A call made while another
    /// pump is running returns immediately; the running pump picks up the work.
    pub fn pump(&self) -> usize {
        let mut handled = 0;
        loop {
            if self.pumping.swap(true, Ordering::AcqRel) {
                return handled;
            }
            {
                let _pumping = PumpGuard(&self.pumping);
                loop {
                    let next = self.ready.lock().pop();
                    let Some(actor) = next else {
                        break;
                    };
                    if self.drain_one(actor) {
                        handled += 1;
                    }
                }
            }
            // Work queued by another thread between the last pop and the store.
            if self.ready.lock().is_empty() {
                return handled;
            }
        }
    }

    fn drain_one(&self, id: ActorId) -> bool {
        let Some(runtime) = self.runtime(id) else {
            return false;
        };
        let mut guard = runtime.lock();
        let inbox = match self.store.read(&guard.actor.inbox) {
            Ok(Some(inbox)) => inbox,
            Ok(None) | Err(_) => {
                warn!(actor = %id, "Inbox unreadable");
                return false;
            }
        };
        let entries: Vec<MessageId> = inbox
            .get(ENTRIES_FIELD)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(ObjectId::from_value).collect())
            .unwrap_or_default();

        while guard.cursor < entries.len() {
            let message_id = entries[guard.cursor];
            guard.cursor += 1;
            let stored = self.store.read(&message_id).ok().flatten();
            let Some(entry) = stored.and_then(|value| InboxEntry::from_stored(message_id, value))
            else {
                warn!(actor = %id, message = %message_id, "Inbox entry unreadable");
                continue;
            };
            if entry.processed {
                continue;
            }
            let rerender = self.handle_entry(&mut guard, entry);
            let more = guard.cursor < entries.len();
            drop(guard);
            if more {
                self.schedule_drain(id);
            }
            if rerender {
                debug!(actor = %id, "Rerender scheduled");
                self.rerender.schedule_rerender(id);
            }
            return true;
        }
        false
    }

    /// Handle one entry; returns whether the actor should be rerendered
    fn handle_entry(&self, runtime: &mut ActorRuntime, entry: InboxEntry) -> bool {
        let ActorRuntime {
            actor, behavior, ..
        } = runtime;
        let verdict =
            self.inbox
                .validate_message(actor, &entry.id, &entry.event_type, &entry.payload);
        let mut rerender = false;
        match verdict {
            Verdict::Invalid(errors) => {
                warn!(actor = %actor.id, event = %entry.event_type, ?errors, "Message rejected");
            }
            Verdict::Valid(payload) if entry.event_type == self.inbox.mutation_event() => {
                self.apply_mutation(actor, &entry, payload);
            }
            Verdict::Valid(payload) => {
                if self.accept_reply(actor.id, &entry) {
                    let event = Event {
                        name: entry.event_type.clone(),
                        payload,
                        source: entry.source,
                        correlation: entry.correlation,
                    };
                    let dispatch = behavior.send(self, actor, &event);
                    debug!(actor = %actor.id, event = %event.name, handled = dispatch.handled, "Event dispatched");
                    rerender = dispatch.rerender;
                }
            }
        }

        let processed = StoreOp::Update {
            id: entry.id,
            patch: json!({ "processed": true }),
        };
        if let Err(err) = self.store.execute(processed) {
            warn!(actor = %actor.id, message = %entry.id, error = %err, "Could not mark entry processed");
        }
        rerender
    }

    /// Settle the pending request an answer correlates to; `false` drops a late answer
    ///
    /// Any correlated message reaching the asker answers its request, except
    /// the asker's own non-reply messages (such as the request of a self-ask).
    fn accept_reply(&self, receiver: ActorId, entry: &InboxEntry) -> bool {
        let Some(correlation) = entry.correlation else {
            return true;
        };
        let is_reply = entry.event_type == SUCCESS_EVENT || entry.event_type == ERROR_EVENT;
        if entry.source == Some(receiver) && !is_reply {
            return true;
        }
        let late = self
            .expired
            .lock()
            .get(&correlation)
            .is_some_and(|request| request.asker == receiver);
        if late {
            debug!(actor = %receiver, %correlation, "Dropping reply to expired request");
            return false;
        }
        let mut pending = self.pending.lock();
        if pending
            .get(&correlation)
            .is_some_and(|request| request.asker == receiver)
        {
            pending.remove(&correlation);
        }
        true
    }

    fn apply_mutation(&self, actor: &Actor, entry: &InboxEntry, payload: Value) {
        let outcome = serde_json::from_value::<StoreOp>(payload)
            .map_err(|err| ActionError::structural(format!("malformed mutation: {}", err)))
            .and_then(|op| {
                debug!(actor = %actor.id, op = op.name(), "Applying mutation");
                self.store.execute(op).map_err(ActionError::from)
            });
        let Err(err) = outcome else {
            return;
        };
        warn!(actor = %actor.id, kind = err.kind.as_str(), error = %err.message, "Mutation failed");
        if let Some(source) = entry.source {
            let message = Message::new(ERROR_EVENT, err.to_payload())
                .from_actor(actor.id)
                .correlated(entry.correlation);
            if let Err(err) = self.inbox.deliver(self, source, message) {
                warn!(actor = %actor.id, error = %err, "ERROR could not be delivered");
            }
        }
    }

    /// Outstanding asks
    pub fn pending_requests(&self) -> Vec<(CorrelationId, PendingRequest)> {
        self.pending
            .lock()
            .iter()
            .map(|(id, request)| (*id, request.clone()))
            .collect()
    }

    /// Time out every ask whose deadline is at or before `now`
    ///
    /// Each asker receives an `ERROR` of kind `timeout`; a reply arriving
    /// afterwards is dropped. Returns the number of expired requests.
    pub fn expire_requests(&self, now: DateTime<Utc>) -> usize {
        // Answers later than one more timeout window are no longer tracked.
        let window = self.ask_timeout();
        self.expired
            .lock()
            .retain(|_, request| {
                request
                    .expired_at
                    .checked_add_signed(window)
                    .is_none_or(|until| until > now)
            });

        let overdue: Vec<(CorrelationId, PendingRequest)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, request)| request.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|request| (id, request)))
                .collect()
        };

        for (correlation, request) in &overdue {
            self.expired.lock().insert(
                *correlation,
                ExpiredRequest {
                    asker: request.asker,
                    expired_at: now,
                },
            );
            warn!(
                asker = %request.asker,
                target = %request.target,
                event = %request.event,
                %correlation,
                "Ask timed out"
            );
            let err = ActionError::timeout(format!(
                "no reply to '{}' from {} within {} ms",
                request.event, request.target, self.config.ask_timeout_ms
            ));
            let message = Message::new(ERROR_EVENT, err.to_payload());
            if let Err(err) = self.inbox.deliver(self, request.asker, message) {
                warn!(asker = %request.asker, error = %err, "Timeout could not be delivered");
            }
        }
        if !overdue.is_empty() {
            self.pump();
        }
        overdue.len()
    }

    /// Number of timed-out asks whose late answers are still being dropped
    pub fn expired_requests(&self) -> usize {
        self.expired.lock().len()
    }

    fn ask_timeout(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.config.ask_timeout_ms).unwrap_or(i64::MAX))
    }
}

impl ActorDirectory for Supervisor {
    fn live_inbox(&self, actor: ActorId) -> Option<InboxId> {
        self.actors.read().get(&actor).map(|running| running.inbox)
    }

    fn spawn(&self, actor: ActorId) -> Result<()> {
        Supervisor::spawn(self, actor)
    }

    fn schedule_drain(&self, actor: ActorId) {
        Supervisor::schedule_drain(self, actor)
    }
}

impl ActionHost for Supervisor {
    fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    fn validator(&self) -> &dyn SchemaValidator {
        self.validator.as_ref()
    }

    fn resolver(&self) -> &dyn ExpressionResolver {
        self.resolver.as_ref()
    }

    fn deliver(&self, target: ActorId, message: Message) -> std::result::Result<MessageId, ActionError> {
        Ok(self.inbox.deliver(self, target, message)?)
    }

    fn interface_of(&self, target: ActorId) -> std::result::Result<Vec<String>, ActionError> {
        let record = self.inbox.read_config(target)?;
        let config = ActorConfig::from_value(target, record)
            .map_err(|err| ActionError::structural(err.to_string()))?;
        Ok(config.interface)
    }

    fn register_request(&self, asker: ActorId, target: ActorId, event: &str) -> CorrelationId {
        let correlation = CorrelationId::new();
        let deadline = Utc::now()
            .checked_add_signed(self.ask_timeout())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.pending.lock().insert(
            correlation,
            PendingRequest {
                asker,
                target,
                event: event.to_string(),
                deadline,
            },
        );
        correlation
    }

    fn invoke(&self, target: ActorId, payload: &Value) -> std::result::Result<Value, ActionError> {
        let record = self.inbox.read_config(target)?;
        let config = ActorConfig::from_value(target, record)
            .map_err(|err| ActionError::structural(err.to_string()))?;
        let tool = config
            .function
            .ok_or_else(|| ActionError::structural(format!("actor {} has no function", target)))?;
        let context = self
            .store
            .read(&config.context)?
            .unwrap_or_else(|| json!({}));
        let view = ActorView {
            id: target,
            context,
        };
        Ok(self.tools.execute(&tool, &view, payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_queue_dedupes() {
        let mut queue = ReadyQueue::default();
        let a = ActorId::new();
        let b = ActorId::new();
        queue.push(a);
        queue.push(b);
        queue.push(a);
        assert_eq!(queue.pop(), Some(a));
        queue.push(a);
        assert_eq!(queue.pop(), Some(b));
        assert_eq!(queue.pop(), Some(a));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_closure_rerender_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hook: Arc<dyn RerenderHook> = Arc::new(move |actor: ActorId| sink.lock().push(actor));
        let actor = ActorId::new();
        hook.schedule_rerender(actor);
        NoRerender.schedule_rerender(actor);
        assert_eq!(*seen.lock(), vec![actor]);
    }
}
