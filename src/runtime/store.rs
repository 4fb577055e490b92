//! Store contract and the in-process object store
//!
//! The runtime only ever talks to persistence through [`Store`]: `read`,
//! `execute(op)` and `subscribe`. [`MemoryStore`] is the in-process
//! implementation used by embedders and tests; it dedupes `create`
//! operations by idempotency key and counts writes per object.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{StoreError, StoreResult};
use super::ids::ObjectId;

/// A single store mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum StoreOp {
    /// Create a new object
    Create {
        /// Initial object value
        value: Value,
        /// Dedupe key; a repeated key returns the original object id
        #[serde(
            default,
            rename = "idempotencyKey",
            skip_serializing_if = "Option::is_none"
        )]
        idempotency_key: Option<String>,
    },
    /// Merge-patch an existing object
    Update {
        /// Object to patch
        id: ObjectId,
        /// JSON merge patch (null removes a key)
        patch: Value,
    },
    /// Delete an object
    Delete {
        /// Object to delete
        id: ObjectId,
    },
    /// Append to an array field of an existing object
    Push {
        /// Object holding the array
        id: ObjectId,
        /// Field name of the array
        field: String,
        /// Item to append
        item: Value,
    },
}

impl StoreOp {
    /// Short name of the operation, used in logs
    pub fn name(&self) -> &'static str {
        match self {
            StoreOp::Create { .. } => "create",
            StoreOp::Update { .. } => "update",
            StoreOp::Delete { .. } => "delete",
            StoreOp::Push { .. } => "push",
        }
    }
}

/// Callback invoked with the new value of a subscribed object
pub type SubscriberFn = Arc<dyn Fn(&ObjectId, &Value) + Send + Sync>;

/// Handle returned by [`Store::subscribe`]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap an unsubscribe closure
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop receiving callbacks
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Narrow persistence interface consumed by the runtime
pub trait Store: Send + Sync {
    /// Read an object, `None` if it does not exist
    fn read(&self, id: &ObjectId) -> StoreResult<Option<Value>>;

    /// Apply one operation and return its result
    fn execute(&self, op: StoreOp) -> StoreResult<Value>;

    /// Register a callback fired after every write to `id`
    fn subscribe(&self, id: &ObjectId, callback: SubscriberFn) -> Subscription;
}

/// Serializable image of a [`MemoryStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreImage {
    /// All objects
    pub objects: BTreeMap<ObjectId, Value>,
    /// Idempotency key index
    pub idempotency: BTreeMap<String, ObjectId>,
}

#[derive(Default)]
struct StoreState {
    objects: HashMap<ObjectId, Value>,
    idempotency: HashMap<String, ObjectId>,
    writes: HashMap<ObjectId, u64>,
    protected: HashSet<ObjectId>,
}

type SubscriberTable = HashMap<ObjectId, Vec<(u64, SubscriberFn)>>;

/// In-process object store
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    subscribers: Arc<Mutex<SubscriberTable>>,
    next_subscriber: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a saved image
    pub fn from_image(image: StoreImage) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.write();
            state.objects = image.objects.into_iter().collect();
            state.idempotency = image.idempotency.into_iter().collect();
        }
        store
    }

    /// Capture every object and the idempotency index
    pub fn image(&self) -> StoreImage {
        let state = self.state.read();
        StoreImage {
            objects: state.objects.iter().map(|(k, v)| (*k, v.clone())).collect(),
            idempotency: state
                .idempotency
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    /// Number of successful writes applied to `id`
    pub fn write_count(&self, id: &ObjectId) -> u64 {
        self.state.read().writes.get(id).copied().unwrap_or(0)
    }

    /// Number of objects currently stored
    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    /// Whether the store holds no objects
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse all further writes to `id`
    pub fn protect(&self, id: ObjectId) {
        self.state.write().protected.insert(id);
    }

    fn apply(&self, op: StoreOp) -> StoreResult<(Value, Option<(ObjectId, Value)>)> {
        let mut state = self.state.write();
        match op {
            StoreOp::Create {
                value,
                idempotency_key,
            } => {
                if let Some(key) = &idempotency_key {
                    if let Some(existing) = state.idempotency.get(key) {
                        if state.objects.contains_key(existing) {
                            return Ok((json!({ "id": existing, "created": false }), None));
                        }
                    }
                }
                let id = ObjectId::new();
                state.objects.insert(id, value.clone());
                if let Some(key) = idempotency_key {
                    state.idempotency.insert(key, id);
                }
                *state.writes.entry(id).or_insert(0) += 1;
                Ok((json!({ "id": id, "created": true }), Some((id, value))))
            }
            StoreOp::Update { id, patch } => {
                check_writable(&state, &id)?;
                if !patch.is_object() {
                    return Err(StoreError::InvalidOperation(
                        "update patch must be an object".to_string(),
                    ));
                }
                let current = state
                    .objects
                    .get_mut(&id)
                    .ok_or(StoreError::NotFound(id))?;
                merge_patch(current, &patch);
                let updated = current.clone();
                *state.writes.entry(id).or_insert(0) += 1;
                Ok((json!({ "id": id, "updated": true }), Some((id, updated))))
            }
            StoreOp::Delete { id } => {
                check_writable(&state, &id)?;
                let deleted = state.objects.remove(&id).is_some();
                if deleted {
                    *state.writes.entry(id).or_insert(0) += 1;
                }
                let notify = deleted.then(|| (id, Value::Null));
                Ok((json!({ "id": id, "deleted": deleted }), notify))
            }
            StoreOp::Push { id, field, item } => {
                check_writable(&state, &id)?;
                let current = state
                    .objects
                    .get_mut(&id)
                    .ok_or(StoreError::NotFound(id))?;
                let object = current.as_object_mut().ok_or_else(|| {
                    StoreError::InvalidOperation(format!("object {} is not a record", id))
                })?;
                let list = object
                    .entry(field.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                let items = list.as_array_mut().ok_or_else(|| {
                    StoreError::InvalidOperation(format!("field '{}' is not an array", field))
                })?;
                items.push(item);
                let length = items.len();
                let updated = current.clone();
                *state.writes.entry(id).or_insert(0) += 1;
                Ok((json!({ "id": id, "length": length }), Some((id, updated))))
            }
        }
    }

    fn notify(&self, id: &ObjectId, value: &Value) {
        let callbacks: Vec<SubscriberFn> = self
            .subscribers
            .lock()
            .get(id)
            .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(id, value);
        }
    }
}

impl Store for MemoryStore {
    fn read(&self, id: &ObjectId) -> StoreResult<Option<Value>> {
        Ok(self.state.read().objects.get(id).cloned())
    }

    fn execute(&self, op: StoreOp) -> StoreResult<Value> {
        let (result, changed) = self.apply(op)?;
        // Data lock is released here so callbacks may read or write again.
        if let Some((id, value)) = changed {
            self.notify(&id, &value);
        }
        Ok(result)
    }

    fn subscribe(&self, id: &ObjectId, callback: SubscriberFn) -> Subscription {
        let token = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .entry(*id)
            .or_default()
            .push((token, callback));

        let table = Arc::downgrade(&self.subscribers);
        let id = *id;
        Subscription::new(move || {
            if let Some(table) = table.upgrade() {
                let mut table = table.lock();
                if let Some(subs) = table.get_mut(&id) {
                    subs.retain(|(t, _)| *t != token);
                    if subs.is_empty() {
                        table.remove(&id);
                    }
                }
            }
        })
    }
}

fn check_writable(state: &StoreState, id: &ObjectId) -> StoreResult<()> {
    if state.protected.contains(id) {
        return Err(StoreError::PermissionDenied {
            id: *id,
            reason: "object is write-protected".to_string(),
        });
    }
    Ok(())
}

/// Apply an RFC 7396 style merge patch in place
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Merge patch that turns `before` into `after`
///
/// Keys missing from `after` map to null; nested objects are diffed key by key.
pub fn diff_patch(before: &Value, after: &Value) -> Value {
    let (Value::Object(old), Value::Object(new)) = (before, after) else {
        return after.clone();
    };
    let mut patch = Map::new();
    for key in old.keys() {
        if !new.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    for (key, value) in new {
        match old.get(key) {
            Some(previous) if previous == value => {}
            Some(previous @ Value::Object(_)) if value.is_object() => {
                patch.insert(key.clone(), diff_patch(previous, value));
            }
            _ => {
                patch.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn created_id(result: &Value) -> ObjectId {
        ObjectId::from_value(&result["id"]).unwrap()
    }

    #[test]
    fn test_create_and_read() {
        let store = MemoryStore::new();
        let result = store
            .execute(StoreOp::Create {
                value: json!({"a": 1}),
                idempotency_key: None,
            })
            .unwrap();
        let id = created_id(&result);
        assert_eq!(store.read(&id).unwrap(), Some(json!({"a": 1})));
        assert_eq!(store.write_count(&id), 1);
    }

    #[test]
    fn test_create_dedupes_by_idempotency_key() {
        let store = MemoryStore::new();
        let op = StoreOp::Create {
            value: json!({"title": "x"}),
            idempotency_key: Some("idem_1".into()),
        };
        let first = store.execute(op.clone()).unwrap();
        let second = store.execute(op).unwrap();
        assert_eq!(first["id"], second["id"]);
        assert_eq!(second["created"], false);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_merges_and_removes_nulls() {
        let store = MemoryStore::new();
        let id = created_id(
            &store
                .execute(StoreOp::Create {
                    value: json!({"a": 1, "b": {"c": 2, "d": 3}}),
                    idempotency_key: None,
                })
                .unwrap(),
        );
        store
            .execute(StoreOp::Update {
                id,
                patch: json!({"a": null, "b": {"c": 5}}),
            })
            .unwrap();
        assert_eq!(store.read(&id).unwrap(), Some(json!({"b": {"c": 5, "d": 3}})));
    }

    #[test]
    fn test_diff_patch_reproduces_target() {
        let before = json!({"flag": true, "keep": 1, "nested": {"x": 1, "y": 2}, "gone": {"a": 1}});
        let after = json!({"keep": 1, "nested": {"y": 3}, "added": [1]});
        let patch = diff_patch(&before, &after);
        assert_eq!(
            patch,
            json!({"flag": null, "gone": null, "nested": {"x": null, "y": 3}, "added": [1]})
        );

        let mut applied = before.clone();
        merge_patch(&mut applied, &patch);
        assert_eq!(applied, after);
        assert_eq!(diff_patch(&after, &after), json!({}));
    }

    #[test]
    fn test_update_missing_object() {
        let store = MemoryStore::new();
        let id = ObjectId::new();
        let err = store
            .execute(StoreOp::Update {
                id,
                patch: json!({}),
            })
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound(id));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        let id = created_id(
            &store
                .execute(StoreOp::Create {
                    value: json!({}),
                    idempotency_key: None,
                })
                .unwrap(),
        );
        assert_eq!(store.execute(StoreOp::Delete { id }).unwrap()["deleted"], true);
        assert_eq!(store.execute(StoreOp::Delete { id }).unwrap()["deleted"], false);
    }

    #[test]
    fn test_push_appends_in_order() {
        let store = MemoryStore::new();
        let id = created_id(
            &store
                .execute(StoreOp::Create {
                    value: json!({"entries": []}),
                    idempotency_key: None,
                })
                .unwrap(),
        );
        for n in 0..3 {
            store
                .execute(StoreOp::Push {
                    id,
                    field: "entries".into(),
                    item: json!(n),
                })
                .unwrap();
        }
        assert_eq!(store.read(&id).unwrap().unwrap()["entries"], json!([0, 1, 2]));
    }

    #[test]
    fn test_protected_object_rejects_writes() {
        let store = MemoryStore::new();
        let id = created_id(
            &store
                .execute(StoreOp::Create {
                    value: json!({}),
                    idempotency_key: None,
                })
                .unwrap(),
        );
        store.protect(id);
        let err = store
            .execute(StoreOp::Update {
                id,
                patch: json!({"x": 1}),
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied { .. }));
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let store = MemoryStore::new();
        let id = created_id(
            &store
                .execute(StoreOp::Create {
                    value: json!({}),
                    idempotency_key: None,
                })
                .unwrap(),
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let subscription = store.subscribe(
            &id,
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        store
            .execute(StoreOp::Update {
                id,
                patch: json!({"x": 1}),
            })
            .unwrap();
        subscription.unsubscribe();
        store
            .execute(StoreOp::Update {
                id,
                patch: json!({"x": 2}),
            })
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_raw_op_parses_from_json() {
        let op: StoreOp =
            serde_json::from_value(json!({"op": "create", "value": {"k": 1}, "idempotencyKey": "i"}))
                .unwrap();
        assert_eq!(
            op,
            StoreOp::Create {
                value: json!({"k": 1}),
                idempotency_key: Some("i".into()),
            }
        );
    }
}
