//! Integration tests for the flat-handler interpreter
//!
//! Covers batched context writes, guard blocks, store operations with
//! idempotent redelivery, the attached function, and error replies.

use ensemble::runtime::actor::{ActorConfig, ActorSpec};
use ensemble::runtime::error::ToolError;
use ensemble::runtime::ids::{ActorId, ObjectId};
use ensemble::runtime::message::Message;
use ensemble::runtime::store::{MemoryStore, Store, StoreOp};
use ensemble::runtime::supervisor::RerenderHook;
use ensemble::runtime::tools::{ToolDefinition, ToolRegistry};
use ensemble::{Runtime, RuntimeConfig};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;

fn runtime_with_schemas(events: &[&str]) -> Runtime {
    let runtime = Runtime::new(RuntimeConfig::default());
    for event in events {
        runtime.register_schema(event, json!({"type": "object"}));
    }
    runtime
}

fn process(handlers: Value) -> Value {
    json!({"kind": "process", "handlers": handlers})
}

fn context_id(runtime: &Runtime, actor: ActorId) -> ObjectId {
    let record = runtime.store().read(&actor).unwrap().unwrap();
    ActorConfig::from_value(actor, record).unwrap().context
}

fn create(store: &MemoryStore, value: Value) -> ObjectId {
    let created = store
        .execute(StoreOp::Create {
            value,
            idempotency_key: None,
        })
        .unwrap();
    ObjectId::from_value(&created["id"]).unwrap()
}

#[test]
fn test_increment_is_one_write() {
    let runtime = runtime_with_schemas(&["INC"]);
    let actor = runtime
        .create_actor(
            ActorSpec::new(
                ["INC"],
                process(json!({"INC": [{"ctx": {"count": "$context.count + 1"}}]})),
            )
            .with_context(json!({"count": 0})),
        )
        .unwrap();
    let context = context_id(&runtime, actor);
    let before = runtime.store().write_count(&context);

    runtime.tell(actor, "INC", json!({})).unwrap();

    assert_eq!(runtime.context(actor).unwrap(), json!({"count": 1}));
    assert_eq!(runtime.store().write_count(&context), before + 1);
}

#[test]
fn test_ctx_patches_in_one_pass_are_batched() {
    let runtime = runtime_with_schemas(&["SET"]);
    let actor = runtime
        .create_actor(
            ActorSpec::new(
                ["SET"],
                process(json!({"SET": [
                    {"ctx": {"a": "$item.value"}},
                    {"ctx": {"b": "$context.a * 2"}},
                    {"ctx": {"c": "$context.b + context.a"}}
                ]})),
            )
            .with_context(json!({})),
        )
        .unwrap();
    let context = context_id(&runtime, actor);
    let before = runtime.store().write_count(&context);

    runtime.tell(actor, "SET", json!({"value": 2})).unwrap();

    assert_eq!(runtime.context(actor).unwrap(), json!({"a": 2, "b": 4, "c": 6}));
    assert_eq!(runtime.store().write_count(&context), before + 1);
}

#[test]
fn test_event_outside_interface_never_reaches_interpreter() {
    let runtime = runtime_with_schemas(&["INC", "DEC"]);
    let actor = runtime
        .create_actor(
            ActorSpec::new(
                ["INC"],
                process(json!({
                    "INC": [{"ctx": {"count": "$context.count + 1"}}],
                    "DEC": [{"ctx": {"count": "$context.count - 1"}}]
                })),
            )
            .with_context(json!({"count": 5})),
        )
        .unwrap();
    let context = context_id(&runtime, actor);
    let before = runtime.store().write_count(&context);

    let message = runtime.tell(actor, "DEC", json!({})).unwrap();

    assert_eq!(runtime.context(actor).unwrap(), json!({"count": 5}));
    assert_eq!(runtime.store().write_count(&context), before);
    let stored = runtime.store().read(&message).unwrap().unwrap();
    assert_eq!(stored["processed"], true);
}

#[test]
fn test_payload_failing_schema_is_rejected() {
    let runtime = Runtime::new(RuntimeConfig::default());
    runtime.register_schema(
        "ADD",
        json!({"type": "object", "required": ["by"], "properties": {"by": {"type": "integer"}}}),
    );
    let actor = runtime
        .create_actor(
            ActorSpec::new(
                ["ADD"],
                process(json!({"ADD": [{"ctx": {"count": "$context.count + item.by"}}]})),
            )
            .with_context(json!({"count": 0})),
        )
        .unwrap();

    runtime.tell(actor, "ADD", json!({"by": "two"})).unwrap();
    runtime.tell(actor, "ADD", json!({})).unwrap();
    assert_eq!(runtime.context(actor).unwrap()["count"], 0);

    runtime.tell(actor, "ADD", json!({"by": 2})).unwrap();
    assert_eq!(runtime.context(actor).unwrap()["count"], 2);
}

#[test]
fn test_unhandled_event_is_silent() {
    let rerenders = Arc::new(Mutex::new(0usize));
    let counter = rerenders.clone();
    let hook: Arc<dyn RerenderHook> = Arc::new(move |_actor: ActorId| *counter.lock() += 1);
    let runtime = Runtime::with_parts(
        RuntimeConfig::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(ToolRegistry::new()),
        hook,
    );
    runtime.register_schema("INC", json!({"type": "object"}));
    runtime.register_schema("NOOP", json!({"type": "object"}));
    let actor = runtime
        .create_actor(
            ActorSpec::new(
                ["INC", "NOOP"],
                process(json!({"INC": [{"ctx": {"count": "$context.count + 1"}}]})),
            )
            .with_context(json!({"count": 0})),
        )
        .unwrap();
    let context = context_id(&runtime, actor);
    let before = runtime.store().write_count(&context);

    runtime.tell(actor, "NOOP", json!({})).unwrap();
    assert_eq!(runtime.store().write_count(&context), before);
    assert_eq!(*rerenders.lock(), 0);

    runtime.tell(actor, "INC", json!({})).unwrap();
    assert_eq!(*rerenders.lock(), 1);
}

#[test]
fn test_false_guard_skips_block_until_next_marker() {
    let runtime = runtime_with_schemas(&["RUN"]);
    let actor = runtime
        .create_actor(
            ActorSpec::new(
                ["RUN"],
                process(json!({"RUN": [
                    {"ctx": {"head": true}},
                    {"guard": "$context.enabled"},
                    {"ctx": {"skipped": true}},
                    {"op": {"create": {"note": "should not exist"}}},
                    {"guard": true},
                    {"ctx": {"tail": true}}
                ]})),
            )
            .with_context(json!({"enabled": false})),
        )
        .unwrap();
    runtime.spawn(actor).unwrap();
    let objects_before = runtime.store().len();

    runtime.tell(actor, "RUN", json!({})).unwrap();

    let context = runtime.context(actor).unwrap();
    assert_eq!(context, json!({"enabled": false, "head": true, "tail": true}));
    // Only the message object itself was added.
    assert_eq!(runtime.store().len(), objects_before + 1);
}

#[test]
fn test_named_actions_expand_inline() {
    let runtime = runtime_with_schemas(&["RESET"]);
    let actor = runtime
        .create_actor(
            ActorSpec::new(
                ["RESET"],
                json!({
                    "kind": "process",
                    "handlers": {"RESET": ["clear", {"ctx": {"resets": "$context.resets + 1"}}]},
                    "actions": {"clear": [{"ctx": {"count": 0}}]}
                }),
            )
            .with_context(json!({"count": 9, "resets": 0})),
        )
        .unwrap();

    runtime.tell(actor, "RESET", json!({})).unwrap();
    assert_eq!(runtime.context(actor).unwrap(), json!({"count": 0, "resets": 1}));
}

#[test]
fn test_null_in_ctx_patch_clears_fields() {
    let runtime = runtime_with_schemas(&["CLEAR"]);
    let actor = runtime
        .create_actor(
            ActorSpec::new(
                ["CLEAR"],
                process(json!({"CLEAR": [
                    {"ctx": {"flag": null, "nested": {"x": null}}},
                    {"ctx": {"had_flag": "$context.flag != null"}}
                ]})),
            )
            .with_context(json!({"flag": true, "nested": {"x": 1, "y": 2}})),
        )
        .unwrap();
    let context = context_id(&runtime, actor);
    let before = runtime.store().write_count(&context);

    runtime.tell(actor, "CLEAR", json!({})).unwrap();

    assert_eq!(
        runtime.context(actor).unwrap(),
        json!({"nested": {"y": 2}, "had_flag": false})
    );
    assert_eq!(runtime.store().write_count(&context), before + 1);
}

#[test]
fn test_create_is_idempotent_on_redelivery() {
    let runtime = runtime_with_schemas(&["ADD"]);
    let actor = runtime
        .create_actor(
            ActorSpec::new(
                ["ADD"],
                process(json!({"ADD": [
                    {"op": {"create": {"title": "$item.title"}}},
                    {"ctx": {"last": "$result.id"}}
                ]})),
            )
            .with_context(json!({})),
        )
        .unwrap();

    let message = runtime.tell(actor, "ADD", json!({"title": "milk"})).unwrap();
    let first = runtime.context(actor).unwrap()["last"].clone();
    let objects = runtime.store().len();

    // Simulate a crash before the entry was marked processed.
    runtime.stop(actor);
    runtime
        .store()
        .execute(StoreOp::Update {
            id: message,
            patch: json!({"processed": false}),
        })
        .unwrap();
    runtime.spawn(actor).unwrap();

    assert_eq!(runtime.store().len(), objects);
    assert_eq!(runtime.context(actor).unwrap()["last"], first);
    let record = ObjectId::from_value(&first).unwrap();
    assert_eq!(
        runtime.store().read(&record).unwrap().unwrap(),
        json!({"title": "milk"})
    );
}

#[test]
fn test_update_and_delete_ops() {
    let runtime = runtime_with_schemas(&["DONE", "DROP"]);
    let item = create(runtime.store(), json!({"title": "milk", "done": false}));
    let actor = runtime
        .create_actor(
            ActorSpec::new(
                ["DONE", "DROP"],
                process(json!({
                    "DONE": [{"op": {"update": {"id": "$item.id", "patch": {"done": true}}}}],
                    "DROP": [{"op": {"delete": {"id": "$item.id"}}}, {"ctx": {"dropped": "$result.deleted"}}]
                })),
            )
            .with_context(json!({})),
        )
        .unwrap();

    runtime.tell(actor, "DONE", json!({"id": item})).unwrap();
    assert_eq!(
        runtime.store().read(&item).unwrap().unwrap(),
        json!({"title": "milk", "done": true})
    );

    runtime.tell(actor, "DROP", json!({"id": item})).unwrap();
    assert!(runtime.store().read(&item).unwrap().is_none());
    assert_eq!(runtime.context(actor).unwrap()["dropped"], true);

    // Replaying the delete is harmless.
    runtime.tell(actor, "DROP", json!({"id": item})).unwrap();
    assert_eq!(runtime.context(actor).unwrap()["dropped"], false);
}

fn register_sum(tools: &ToolRegistry) {
    let definition =
        ToolDefinition::new("sum", "Add numbers", &json!({"values": {"type": "array"}})).unwrap();
    tools.register_fn(definition, |_actor, payload| {
        let values = payload["values"].as_array().cloned().unwrap_or_default();
        if values.iter().any(|value| !value.is_number()) {
            return Err(ToolError::ExecutionFailed {
                tool: "sum".into(),
                reason: "values must be numbers".into(),
            });
        }
        let total: i64 = values.iter().filter_map(Value::as_i64).sum();
        Ok(json!({"structuredContent": {"total": total}, "toolCallId": "call-1", "isError": false}))
    });
}

fn function_actor(runtime: &Runtime) -> ActorId {
    runtime
        .create_actor(
            ActorSpec::new(
                ["RUN", "SUCCESS", "ERROR"],
                process(json!({
                    "RUN": [{"function": {}}, {"ctx": {"unreachable": true}}],
                    "SUCCESS": [{"ctx": {"answer": "$item.result.total"}}],
                    "ERROR": [{"ctx": {"error": "$item.errors[0].kind"}}]
                })),
            )
            .with_context(json!({}))
            .with_function("sum"),
        )
        .unwrap()
}

#[test]
fn test_function_success_replies_to_self() {
    let runtime = runtime_with_schemas(&["RUN"]);
    register_sum(runtime.tools());
    let actor = function_actor(&runtime);

    runtime.tell(actor, "RUN", json!({"values": [1, 2, 3]})).unwrap();

    let context = runtime.context(actor).unwrap();
    assert_eq!(context["answer"], 6);
    assert!(context.get("unreachable").is_none());
}

#[test]
fn test_function_failures_become_structural_errors() {
    let runtime = runtime_with_schemas(&["RUN"]);
    register_sum(runtime.tools());
    let actor = function_actor(&runtime);

    // Schema rejection by the registry.
    runtime.tell(actor, "RUN", json!({"values": "nope"})).unwrap();
    assert_eq!(runtime.context(actor).unwrap()["error"], "structural");

    // Failure raised by the tool itself.
    runtime
        .store()
        .execute(StoreOp::Update {
            id: context_id(&runtime, actor),
            patch: json!({"error": null}),
        })
        .unwrap();
    runtime.tell(actor, "RUN", json!({"values": ["a"]})).unwrap();
    assert_eq!(runtime.context(actor).unwrap()["error"], "structural");
    assert_eq!(runtime.tools().stats().failed_executions, 1);
    assert_eq!(runtime.tools().stats().rejected_executions, 1);
}

#[test]
fn test_permission_error_reaches_source_and_self() {
    let runtime = runtime_with_schemas(&["GO", "UPD"]);
    let locked = create(runtime.store(), json!({"x": 0}));
    runtime.store().protect(locked);

    let worker = runtime
        .create_actor(
            ActorSpec::new(
                ["UPD", "ERROR"],
                process(json!({
                    "UPD": [{"op": {"update": {"id": locked.to_string(), "patch": {"x": 1}}}}],
                    "ERROR": [{"ctx": {"own": "$item.errors[0].kind"}}]
                })),
            )
            .with_context(json!({})),
        )
        .unwrap();
    let caller = runtime
        .create_actor(
            ActorSpec::new(
                ["GO", "ERROR"],
                process(json!({
                    "GO": [{"tell": {"target": worker, "type": "UPD"}}],
                    "ERROR": [{"ctx": {"seen": "$item.errors[0].kind"}}]
                })),
            )
            .with_context(json!({})),
        )
        .unwrap();

    runtime.tell(caller, "GO", json!({})).unwrap();

    assert_eq!(runtime.context(caller).unwrap()["seen"], "permission");
    assert_eq!(runtime.context(worker).unwrap()["own"], "permission");
    assert_eq!(
        runtime.store().read(&locked).unwrap().unwrap(),
        json!({"x": 0})
    );
}

#[test]
fn test_mutation_event_executes_against_store() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let actor = runtime
        .create_actor(ActorSpec::new(
            ["MUTATE"],
            process(json!({})),
        ))
        .unwrap();

    runtime
        .send(
            actor,
            Message::new("MUTATE", json!({"op": "create", "value": {"kind": "note"}})),
        )
        .unwrap();
    runtime
        .tell(actor, "MUTATE", json!({"value": {"kind": "note"}}))
        .unwrap();

    let notes = runtime
        .store()
        .image()
        .objects
        .values()
        .filter(|value| **value == json!({"kind": "note"}))
        .count();
    assert_eq!(notes, 1);
}

#[test]
fn test_pump_recovers_after_a_panicking_pass() {
    let runtime = runtime_with_schemas(&["BOOM", "INC"]);
    let definition = ToolDefinition::new("explode", "Always panics", &json!({})).unwrap();
    runtime
        .tools()
        .register_fn(definition, |_actor, _payload| panic!("tool exploded"));
    let actor = runtime
        .create_actor(
            ActorSpec::new(
                ["BOOM", "INC"],
                process(json!({
                    "BOOM": [{"function": {}}],
                    "INC": [{"ctx": {"count": "$context.count + 1"}}]
                })),
            )
            .with_context(json!({"count": 0}))
            .with_function("explode"),
        )
        .unwrap();

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        runtime.tell(actor, "BOOM", json!({}))
    }));
    assert!(outcome.is_err());

    runtime.tell(actor, "INC", json!({})).unwrap();
    assert_eq!(runtime.context(actor).unwrap()["count"], 1);
}
