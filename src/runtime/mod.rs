//! Runtime orchestrator and public API
//!
//! This module provides the main `Runtime` struct that wires the store, the
//! tool registry and the supervisor together and exposes the public
//! interface for embedding the runtime.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

// Submodules
pub mod action;
pub mod activation;
pub mod actor;
pub mod behavior;
pub mod error;
pub mod expr;
pub mod ids;
pub mod inbox;
pub mod message;
pub mod schema;
pub mod storage;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod tools;

use actor::{ActorConfig, ActorSpec};
use error::{ConfigError, Result, StoreError};
use ids::{ActorId, MessageId, ObjectId};
use message::Message;
use store::{MemoryStore, Store, StoreOp};
use supervisor::{NoRerender, RerenderHook, Supervisor};
use tools::ToolRegistry;

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How long an ask may stay unanswered before it times out
    pub ask_timeout_ms: u64,

    /// States in which rerender requests are suppressed
    pub suppressed_states: Vec<String>,

    /// Reserved event type for raw store mutations
    pub mutation_event: String,

    /// Number of transitions kept per state machine
    pub history_limit: usize,

    /// Install a `debug`-level tracing subscriber when the runtime is built
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ask_timeout_ms: 30_000,
            suppressed_states: vec!["dragging".to_string()],
            mutation_event: "MUTATE".to_string(),
            history_limit: 100,
            debug: false,
        }
    }
}

/// The main runtime orchestrator
///
/// Owns the in-process store and the supervisor. Every public call that
/// delivers a message runs the supervisor's pump until no work is left.
pub struct Runtime {
    config: RuntimeConfig,
    store: Arc<MemoryStore>,
    tools: Arc<ToolRegistry>,
    supervisor: Arc<Supervisor>,
}

impl Runtime {
    /// Create a runtime with an empty store and tool registry
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(ToolRegistry::new()),
            Arc::new(NoRerender),
        )
    }

    /// Create a runtime from existing parts
    pub fn with_parts(
        config: RuntimeConfig,
        store: Arc<MemoryStore>,
        tools: Arc<ToolRegistry>,
        rerender: Arc<dyn RerenderHook>,
    ) -> Self {
        if config.debug && telemetry::init_tracing(true) {
            info!("Debug tracing enabled");
        }
        let supervisor = Supervisor::builder(config.clone(), store.clone())
            .tools(tools.clone())
            .rerender_hook(rerender)
            .build();
        Self {
            config,
            store,
            tools,
            supervisor,
        }
    }

    /// Load configuration and a saved store image
    pub fn load(config_path: &Path, store_path: &Path) -> anyhow::Result<Self> {
        let config = storage::load_config(config_path)?;
        Self::restore(config, store_path)
    }

    /// Create a runtime over a saved store image
    ///
    /// No actor is running afterwards; actors are respawned on their next
    /// delivery, or explicitly with [`Runtime::spawn`].
    pub fn restore(config: RuntimeConfig, store_path: &Path) -> anyhow::Result<Self> {
        let store = storage::load_store(store_path)?;
        info!(objects = store.len(), "Store restored");
        Ok(Self::with_parts(
            config,
            Arc::new(store),
            Arc::new(ToolRegistry::new()),
            Arc::new(NoRerender),
        ))
    }

    /// Persist the store image
    pub fn save(&self, store_path: &Path) -> anyhow::Result<()> {
        storage::save_store(store_path, &self.store)
    }

    /// Get the current configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Get the store
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Get the tool registry
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Get the supervisor
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Register a runtime-wide payload schema for an event type
    pub fn register_schema(&self, event_type: &str, schema: Value) {
        self.supervisor.inbox().register_schema(event_type, schema);
    }

    fn create_object(&self, value: Value) -> Result<ObjectId> {
        let created = self.store.execute(StoreOp::Create {
            value,
            idempotency_key: None,
        })?;
        created
            .get("id")
            .and_then(ObjectId::from_value)
            .ok_or_else(|| StoreError::InvalidOperation("create returned no id".to_string()).into())
    }

    /// Persist a new actor (inbox, context and configuration record)
    ///
    /// The behavior definition is validated first, so a malformed definition
    /// fails here rather than when the first message arrives.
    pub fn create_actor(&self, spec: ActorSpec) -> Result<ActorId> {
        behavior::load(&spec.behavior, &self.config)?;
        if !spec.context.is_object() {
            return Err(ConfigError::InvalidBehavior(format!(
                "initial context must be an object, found {}",
                spec.context
            ))
            .into());
        }

        let inbox = self.create_object(json!({ "entries": [] }))?;
        let context = self.create_object(spec.context)?;
        let config = ActorConfig {
            interface: spec.interface,
            inbox,
            context,
            behavior: spec.behavior,
            function: spec.function,
            children: spec.children,
            schemas: spec.schemas,
        };
        let record = serde_json::to_value(&config)
            .map_err(|err| StoreError::InvalidOperation(err.to_string()))?;
        let actor = self.create_object(record)?;
        self.store.execute(StoreOp::Update {
            id: inbox,
            patch: json!({ "owner": actor }),
        })?;
        info!(%actor, %inbox, %context, "Actor created");
        Ok(actor)
    }

    /// Start an actor and handle anything already in its inbox
    pub fn spawn(&self, actor: ActorId) -> Result<()> {
        self.supervisor.spawn(actor)?;
        self.supervisor.pump();
        Ok(())
    }

    /// Stop a running actor
    pub fn stop(&self, actor: ActorId) -> bool {
        self.supervisor.stop(actor)
    }

    /// Deliver a message, then run until no work is left
    pub fn send(&self, target: ActorId, message: Message) -> Result<MessageId> {
        self.supervisor.deliver(target, message)
    }

    /// Deliver a message to a raw target identifier
    pub fn send_to(&self, target: &str, message: Message) -> Result<MessageId> {
        let target = inbox::InboxEngine::resolve_target(target)?;
        self.send(target, message)
    }

    /// Deliver a message with no source actor
    pub fn tell(&self, target: ActorId, event_type: &str, payload: Value) -> Result<MessageId> {
        self.send(target, Message::new(event_type, payload))
    }

    /// Read an actor's persisted context
    pub fn context(&self, actor: ActorId) -> Result<Value> {
        let record = self.supervisor.inbox().read_config(actor)?;
        let config = ActorConfig::from_value(actor, record)?;
        self.store
            .read(&config.context)?
            .ok_or_else(|| StoreError::NotFound(config.context).into())
    }

    /// Current state of a running state-machine actor
    pub fn current_state(&self, actor: ActorId) -> Option<String> {
        self.supervisor.current_state(actor)
    }

    /// Time out overdue asks, see [`Supervisor::expire_requests`]
    pub fn expire_requests(&self, now: chrono::DateTime<chrono::Utc>) -> usize {
        self.supervisor.expire_requests(now)
    }

    /// Run the supervisor until no work is left
    pub fn pump(&self) -> usize {
        self.supervisor.pump()
    }
}

// Re-export commonly used types
pub use activation::ActionHost;
pub use behavior::Behavior;
pub use error::{ActionError, ErrorKind, RuntimeError};
pub use supervisor::PendingRequest;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_partial_json() {
        let config: RuntimeConfig = serde_json::from_value(json!({"ask_timeout_ms": 5})).unwrap();
        assert_eq!(config.ask_timeout_ms, 5);
        assert_eq!(config.mutation_event, "MUTATE");
        assert_eq!(config.suppressed_states, vec!["dragging".to_string()]);
    }

    #[test]
    fn test_debug_config_installs_subscriber() {
        let runtime = Runtime::new(RuntimeConfig {
            debug: true,
            ..RuntimeConfig::default()
        });
        assert!(runtime.config().debug);
        assert!(!telemetry::init_tracing(false));
    }

    #[test]
    fn test_create_actor_persists_records() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let actor = runtime
            .create_actor(
                ActorSpec::new(["INC"], json!({"kind": "process", "handlers": {}}))
                    .with_context(json!({"count": 0})),
            )
            .unwrap();
        let record = runtime.store().read(&actor).unwrap().unwrap();
        let config = ActorConfig::from_value(actor, record).unwrap();
        let inbox = runtime.store().read(&config.inbox).unwrap().unwrap();
        assert_eq!(inbox["entries"], json!([]));
        assert_eq!(inbox["owner"], json!(actor));
        assert_eq!(runtime.context(actor).unwrap(), json!({"count": 0}));
        assert!(!runtime.supervisor().is_running(actor));
    }

    #[test]
    fn test_create_actor_rejects_bad_behavior() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let err = runtime
            .create_actor(ActorSpec::new(
                ["INC"],
                json!({"kind": "process", "handlers": {"INC": [{"bogus": 1}]}}),
            ))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Config(ConfigError::ActionShape(_))));
        assert!(runtime.store().is_empty());
    }
}
