//! Inbox engine: target resolution, message validation and delivery
//!
//! Every actor owns an inbox object `{owner, entries: [message ids]}`.
//! Delivery persists the message as its own store object, appends its id to
//! the inbox, and hands the target to the [`ActorDirectory`] so it is
//! spawned or scheduled for draining. Appends to one inbox are serialized by
//! a per-inbox mutex, which gives FIFO order per inbox. A mutex lives only
//! while some delivery to its inbox is in flight.

use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use super::actor::{Actor, ActorConfig};
use super::error::{Result, RoutingError, RuntimeError, StoreError};
use super::ids::{ActorId, InboxId, MessageId, ObjectId};
use super::message::{IDEMPOTENCY_FIELD, InboxEntry, Message, idempotency_key};
use super::schema::{SchemaRegistry, SchemaValidator};
use super::store::{Store, StoreOp};

/// Field of the inbox object holding message ids
pub const ENTRIES_FIELD: &str = "entries";

/// What the inbox engine needs to know about running actors
pub trait ActorDirectory: Send + Sync {
    /// Inbox of `actor` if it is running
    fn live_inbox(&self, actor: ActorId) -> Option<InboxId>;

    /// Start `actor` from its configuration record
    fn spawn(&self, actor: ActorId) -> Result<()>;

    /// Queue `actor` for draining its pending entries
    fn schedule_drain(&self, actor: ActorId);
}

/// Outcome of message validation
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Payload to hand to the interpreter, idempotency key merged in
    Valid(Value),
    /// Reasons the message was rejected
    Invalid(Vec<String>),
}

impl Verdict {
    /// Whether the message passed
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid(_))
    }
}

/// Resolves, validates and delivers messages
pub struct InboxEngine {
    store: Option<Arc<dyn Store>>,
    schemas: RwLock<SchemaRegistry>,
    validator: Arc<dyn SchemaValidator>,
    mutation_event: String,
    locks: Mutex<HashMap<InboxId, Arc<Mutex<()>>>>,
}

impl InboxEngine {
    /// Create an engine over `store`
    pub fn new(
        store: Arc<dyn Store>,
        validator: Arc<dyn SchemaValidator>,
        mutation_event: impl Into<String>,
    ) -> Self {
        let mut engine = Self::detached(validator, mutation_event);
        engine.store = Some(store);
        engine
    }

    /// Create an engine with no store; every delivery fails
    pub fn detached(validator: Arc<dyn SchemaValidator>, mutation_event: impl Into<String>) -> Self {
        let mutation_event = mutation_event.into();
        Self {
            store: None,
            schemas: RwLock::new(SchemaRegistry::new(&mutation_event)),
            validator,
            mutation_event,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Store handle, or an infrastructure error when none is configured
    pub fn store(&self) -> Result<&Arc<dyn Store>> {
        self.store
            .as_ref()
            .ok_or_else(|| RuntimeError::Infrastructure("no store configured".to_string()))
    }

    /// Reserved event type for raw store mutations
    pub fn mutation_event(&self) -> &str {
        &self.mutation_event
    }

    /// Register a runtime-wide payload schema for an event type
    pub fn register_schema(&self, event_type: &str, schema: Value) {
        let hash = self.schemas.write().register(event_type, schema);
        debug!(event = event_type, %hash, "Schema registered");
    }

    /// Parse a raw target into an actor id
    pub fn resolve_target(target: &str) -> std::result::Result<ActorId, RoutingError> {
        target.parse()
    }

    /// Read the configuration record of `actor`
    pub fn read_config(&self, actor: ActorId) -> Result<Value> {
        match self.store()?.read(&actor) {
            Ok(Some(record)) => Ok(record),
            Ok(None) | Err(_) => Err(RoutingError::ConfigUnreadable(actor).into()),
        }
    }

    /// Find the inbox of `target`, preferring the live actor
    pub fn resolve_inbox_for_target(
        &self,
        directory: &dyn ActorDirectory,
        target: ActorId,
    ) -> Result<InboxId> {
        if let Some(inbox) = directory.live_inbox(target) {
            return Ok(inbox);
        }
        let record = self.read_config(target)?;
        ActorConfig::inbox_of(&record).ok_or_else(|| RoutingError::MissingInbox(target).into())
    }

    /// Check a message against the actor's interface and payload schema
    ///
    /// Fails closed: an undeclared event type or a missing schema rejects.
    pub fn validate_message(
        &self,
        actor: &Actor,
        message_id: &MessageId,
        event_type: &str,
        payload: &Value,
    ) -> Verdict {
        if !actor.accepts(event_type) {
            return Verdict::Invalid(vec![format!(
                "'{}' is not in the interface of actor {}",
                event_type, actor.id
            )]);
        }

        let schema = match actor.schemas.get(event_type) {
            Some(schema) => schema.clone(),
            None => match self.schemas.read().get(event_type) {
                Some(definition) => definition.schema.clone(),
                None => {
                    return Verdict::Invalid(vec![format!("no schema for '{}'", event_type)]);
                }
            },
        };

        let validation = self.validator.validate(&schema, payload);
        if !validation.valid {
            return Verdict::Invalid(validation.errors);
        }

        if event_type == self.mutation_event {
            let has_op = payload
                .as_object()
                .is_some_and(|object| object.contains_key("op"));
            if !has_op {
                return Verdict::Invalid(vec![
                    "mutation payload must be an object with an 'op' field".to_string(),
                ]);
            }
        }

        let mut merged = match payload {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        merged.insert(
            IDEMPOTENCY_FIELD.to_string(),
            Value::String(idempotency_key(message_id)),
        );
        Verdict::Valid(Value::Object(merged))
    }

    fn inbox_lock(&self, inbox: InboxId) -> Arc<Mutex<()>> {
        self.locks.lock().entry(inbox).or_default().clone()
    }

    /// Drop the inbox mutex once no other delivery holds a handle to it
    fn release_inbox_lock(&self, inbox: InboxId, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock();
        // One handle in the table, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&inbox);
        }
    }

    /// Store the message object and push its id onto the inbox
    fn append(
        store: &dyn Store,
        inbox: InboxId,
        target: ActorId,
        message: Message,
    ) -> Result<MessageId> {
        let entry = InboxEntry::pending(ObjectId::new(), target, message);
        let value = serde_json::to_value(&entry)
            .map_err(|err| StoreError::InvalidOperation(err.to_string()))?;
        let created = store.execute(StoreOp::Create {
            value,
            idempotency_key: None,
        })?;
        let message_id = created
            .get("id")
            .and_then(ObjectId::from_value)
            .ok_or_else(|| StoreError::InvalidOperation("create returned no object id".to_string()))?;

        store
            .execute(StoreOp::Push {
                id: inbox,
                field: ENTRIES_FIELD.to_string(),
                item: json!(message_id),
            })
            .map_err(|err| match err {
                StoreError::NotFound(_) => RuntimeError::from(RoutingError::InboxNotFound(inbox)),
                other => other.into(),
            })?;
        Ok(message_id)
    }

    /// Persist `message` in the inbox of `target` and wake the target
    pub fn deliver(
        &self,
        directory: &dyn ActorDirectory,
        target: ActorId,
        message: Message,
    ) -> Result<MessageId> {
        let store = self.store()?;
        let inbox = self.resolve_inbox_for_target(directory, target)?;
        let event_type = message.event_type.clone();

        let lock = self.inbox_lock(inbox);
        let appended = {
            let _guard = lock.lock();
            Self::append(store.as_ref(), inbox, target, message)
        };
        self.release_inbox_lock(inbox, lock);
        let message_id = appended?;

        debug!(%target, %inbox, message = %message_id, event = %event_type, "Message delivered");

        if directory.live_inbox(target).is_some() {
            directory.schedule_drain(target);
        } else if let Err(err) = directory.spawn(target) {
            error!(%target, error = %err, "Failed to spawn message target");
        }
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::schema::JsonSchema;
    use crate::runtime::store::MemoryStore;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Directory {
        live: HashMap<ActorId, InboxId>,
        spawned: Mutex<Vec<ActorId>>,
        drained: Mutex<Vec<ActorId>>,
    }

    impl ActorDirectory for Directory {
        fn live_inbox(&self, actor: ActorId) -> Option<InboxId> {
            self.live.get(&actor).copied()
        }

        fn spawn(&self, actor: ActorId) -> Result<()> {
            self.spawned.lock().push(actor);
            Ok(())
        }

        fn schedule_drain(&self, actor: ActorId) {
            self.drained.lock().push(actor);
        }
    }

    fn engine(store: Arc<MemoryStore>) -> InboxEngine {
        InboxEngine::new(store, Arc::new(JsonSchema), "MUTATE")
    }

    fn actor_with(store: &MemoryStore) -> (ActorId, InboxId) {
        let inbox = create(store, json!({"entries": []}));
        let context = create(store, json!({}));
        let actor = create(
            store,
            json!({"interface": ["PING"], "inbox": inbox, "context": context, "behavior": {}}),
        );
        (actor, inbox)
    }

    fn create(store: &MemoryStore, value: Value) -> ObjectId {
        let result = store
            .execute(StoreOp::Create {
                value,
                idempotency_key: None,
            })
            .unwrap();
        ObjectId::from_value(&result["id"]).unwrap()
    }

    fn test_actor(interface: &[&str]) -> Actor {
        Actor {
            id: ActorId::new(),
            interface: interface.iter().map(|s| s.to_string()).collect(),
            context: ObjectId::new(),
            inbox: ObjectId::new(),
            children: BTreeMap::new(),
            function: None,
            schemas: BTreeMap::new(),
        }
    }

    #[test]
    fn test_resolve_reads_config_when_not_running() {
        let store = Arc::new(MemoryStore::new());
        let (actor, inbox) = actor_with(&store);
        let engine = engine(store);
        let directory = Directory::default();
        assert_eq!(
            engine.resolve_inbox_for_target(&directory, actor).unwrap(),
            inbox
        );
    }

    #[test]
    fn test_resolve_prefers_live_inbox() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store);
        let actor = ActorId::new();
        let live = InboxId::new();
        let directory = Directory {
            live: HashMap::from([(actor, live)]),
            ..Default::default()
        };
        assert_eq!(
            engine.resolve_inbox_for_target(&directory, actor).unwrap(),
            live
        );
    }

    #[test]
    fn test_resolve_routing_errors() {
        let store = Arc::new(MemoryStore::new());
        let broken = create(&store, json!({"interface": [], "inbox": "not-an-id"}));
        let engine = engine(store);
        let directory = Directory::default();

        let missing = ActorId::new();
        assert!(matches!(
            engine.resolve_inbox_for_target(&directory, missing),
            Err(RuntimeError::Routing(RoutingError::ConfigUnreadable(_)))
        ));
        assert!(matches!(
            engine.resolve_inbox_for_target(&directory, broken),
            Err(RuntimeError::Routing(RoutingError::MissingInbox(_)))
        ));
        assert!(InboxEngine::resolve_target("nope").is_err());
    }

    #[test]
    fn test_deliver_appends_and_spawns() {
        let store = Arc::new(MemoryStore::new());
        let (actor, inbox) = actor_with(&store);
        let engine = engine(store.clone());
        let directory = Directory::default();

        let first = engine
            .deliver(&directory, actor, Message::new("PING", json!({"n": 1})))
            .unwrap();
        let second = engine
            .deliver(&directory, actor, Message::new("PING", json!({"n": 2})))
            .unwrap();

        let entries = store.read(&inbox).unwrap().unwrap()["entries"].clone();
        assert_eq!(entries, json!([first, second]));
        let stored = store.read(&first).unwrap().unwrap();
        assert_eq!(stored["type"], "PING");
        assert_eq!(stored["processed"], false);
        assert_eq!(stored["target"], json!(actor));
        assert_eq!(directory.spawned.lock().len(), 2);
    }

    #[test]
    fn test_inbox_locks_are_released_after_delivery() {
        let store = Arc::new(MemoryStore::new());
        let (actor, inbox) = actor_with(&store);
        let engine = engine(store.clone());
        let directory = Directory::default();

        engine
            .deliver(&directory, actor, Message::new("PING", json!({})))
            .unwrap();
        assert!(engine.locks.lock().is_empty());

        // A failed append releases its lock too.
        store.execute(StoreOp::Delete { id: inbox }).unwrap();
        let err = engine
            .deliver(&directory, actor, Message::new("PING", json!({})))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Routing(RoutingError::InboxNotFound(_))));
        assert!(engine.locks.lock().is_empty());
    }

    #[test]
    fn test_deliver_without_store_is_infrastructure_error() {
        let engine = InboxEngine::detached(Arc::new(JsonSchema), "MUTATE");
        let err = engine
            .deliver(&Directory::default(), ActorId::new(), Message::new("PING", json!({})))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Infrastructure(_)));
    }

    #[test]
    fn test_validate_fails_closed() {
        let engine = engine(Arc::new(MemoryStore::new()));
        let id = MessageId::new();
        let actor = test_actor(&["PING", "SUCCESS"]);

        // Not in the interface.
        assert!(!engine
            .validate_message(&actor, &id, "PONG", &json!({}))
            .is_valid());
        // In the interface but no schema anywhere.
        assert!(!engine
            .validate_message(&actor, &id, "PING", &json!({}))
            .is_valid());

        engine.register_schema("PING", json!({"type": "object"}));
        match engine.validate_message(&actor, &id, "PING", &json!({"n": 1})) {
            Verdict::Valid(payload) => {
                assert_eq!(payload["n"], 1);
                assert_eq!(payload[IDEMPOTENCY_FIELD], json!(idempotency_key(&id)));
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn test_actor_schema_takes_precedence() {
        let engine = engine(Arc::new(MemoryStore::new()));
        engine.register_schema("PING", json!({"type": "object"}));
        let mut actor = test_actor(&["PING"]);
        actor.schemas.insert(
            "PING".into(),
            json!({"type": "object", "required": ["n"]}),
        );
        assert!(!engine
            .validate_message(&actor, &MessageId::new(), "PING", &json!({}))
            .is_valid());
    }

    #[test]
    fn test_mutation_requires_op() {
        let engine = engine(Arc::new(MemoryStore::new()));
        let mut actor = test_actor(&["MUTATE"]);
        actor.schemas.insert("MUTATE".into(), json!({"type": "object"}));
        let id = MessageId::new();
        assert!(!engine
            .validate_message(&actor, &id, "MUTATE", &json!({"value": 1}))
            .is_valid());
        assert!(engine
            .validate_message(&actor, &id, "MUTATE", &json!({"op": "delete", "id": id}))
            .is_valid());
    }
}
