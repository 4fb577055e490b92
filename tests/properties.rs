//! Property tests for delivery order, guard blocks and batched writes

use ensemble::runtime::actor::{ActorConfig, ActorSpec};
use ensemble::runtime::message::Message;
use ensemble::runtime::store::Store;
use ensemble::runtime::tools::ToolDefinition;
use ensemble::{Runtime, RuntimeConfig};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Runtime whose `record` tool appends `(who, n)` to a shared log
fn recording_runtime() -> (Runtime, Arc<Mutex<Vec<(String, u64)>>>) {
    let runtime = Runtime::new(RuntimeConfig::default());
    runtime.register_schema("ITEM", json!({"type": "object", "required": ["n"]}));
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let definition = ToolDefinition::new(
        "record",
        "Append to the log",
        &json!({"who": "string", "n": "integer"}),
    )
    .unwrap();
    runtime.tools().register_fn(definition, move |_actor, payload| {
        let who = payload["who"].as_str().unwrap_or_default().to_string();
        let n = payload["n"].as_u64().unwrap_or_default();
        sink.lock().push((who, n));
        Ok(json!({"ok": true}))
    });
    (runtime, log)
}

proptest! {
    #[test]
    fn prop_each_inbox_is_handled_in_delivery_order(
        sends in prop::collection::vec((any::<bool>(), 0u64..1000), 1..40)
    ) {
        let (runtime, log) = recording_runtime();
        let behavior = json!({"kind": "process", "handlers": {"ITEM": [{"function": {}}]}});
        let left = runtime
            .create_actor(ActorSpec::new(["ITEM"], behavior.clone()).with_function("record"))
            .unwrap();
        let right = runtime
            .create_actor(ActorSpec::new(["ITEM"], behavior).with_function("record"))
            .unwrap();

        // Queue everything first so handling interleaves across both inboxes.
        let supervisor = runtime.supervisor();
        for (to_left, n) in &sends {
            let (target, who) = if *to_left { (left, "left") } else { (right, "right") };
            supervisor
                .inbox()
                .deliver(&**supervisor, target, Message::new("ITEM", json!({"who": who, "n": n})))
                .unwrap();
        }
        runtime.pump();

        let log = log.lock();
        prop_assert_eq!(log.len(), sends.len());
        for (who, flag) in [("left", true), ("right", false)] {
            let expected: Vec<u64> = sends
                .iter()
                .filter(|(to_left, _)| *to_left == flag)
                .map(|(_, n)| *n)
                .collect();
            let seen: Vec<u64> = log
                .iter()
                .filter(|(name, _)| name == who)
                .map(|(_, n)| *n)
                .collect();
            prop_assert_eq!(seen, expected);
        }
    }

    #[test]
    fn prop_false_guards_skip_exactly_their_block(flags in prop::collection::vec(any::<bool>(), 0..12)) {
        let runtime = Runtime::new(RuntimeConfig::default());
        runtime.register_schema("RUN", json!({"type": "object"}));

        let mut actions = Vec::new();
        for (index, flag) in flags.iter().enumerate() {
            actions.push(json!({"guard": flag}));
            actions.push(json!({"ctx": {(format!("k{}", index)): index}}));
        }
        let actor = runtime
            .create_actor(ActorSpec::new(
                ["RUN"],
                json!({"kind": "process", "handlers": {"RUN": actions}}),
            ))
            .unwrap();

        runtime.tell(actor, "RUN", json!({})).unwrap();

        let mut expected = Map::new();
        for (index, flag) in flags.iter().enumerate() {
            if *flag {
                expected.insert(format!("k{}", index), json!(index));
            }
        }
        prop_assert_eq!(runtime.context(actor).unwrap(), Value::Object(expected));
    }

    #[test]
    fn prop_one_context_write_per_handled_message(count in 0usize..20) {
        let runtime = Runtime::new(RuntimeConfig::default());
        runtime.register_schema("INC", json!({"type": "object"}));
        let actor = runtime
            .create_actor(
                ActorSpec::new(
                    ["INC"],
                    json!({"kind": "process", "handlers": {"INC": [
                        {"ctx": {"count": "$context.count + 1"}},
                        {"ctx": {"double": "$context.count * 2"}}
                    ]}}),
                )
                .with_context(json!({"count": 0})),
            )
            .unwrap();
        let record = runtime.store().read(&actor).unwrap().unwrap();
        let context = ActorConfig::from_value(actor, record).unwrap().context;
        let before = runtime.store().write_count(&context);

        for _ in 0..count {
            runtime.tell(actor, "INC", json!({})).unwrap();
        }

        let value = runtime.context(actor).unwrap();
        prop_assert_eq!(&value["count"], &json!(count));
        if count > 0 {
            prop_assert_eq!(&value["double"], &json!(count * 2));
        }
        prop_assert_eq!(runtime.store().write_count(&context), before + count as u64);
    }
}
