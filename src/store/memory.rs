use crate::model::{now_millis, EventFamily};
use crate::store::traits::{DatabaseAdapter, StoreError, StoreEvent, StoreEventKind};
use anyhow::{bail, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Alphabet of the push-key generator, ordered so that generated keys sort
/// lexicographically by creation time (same alphabet real-time databases use
/// for push ids).
const PUSH_CHARS: &[u8; 64] =
    b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// A store operation as observed by the adapter, recorded so tests can assert
/// write ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Write { path: String },
    Remove { path: String },
    MultiPathWrite { paths: Vec<String> },
}

#[derive(Debug)]
struct Subscriber {
    family: EventFamily,
    tx: mpsc::UnboundedSender<StoreEvent>,
}

/// In-memory implementation of the `DatabaseAdapter` contract: a JSON tree
/// addressed by `/`-separated paths with atomic multi-path application and
/// per-path subscriptions.
///
/// Used by the test-suite and by callers operating against a non-networked
/// store. The fault-injection hooks (`fail_writes_under`,
/// `deny_writes_under`, `suppress_initial_events`) exist to exercise the
/// rollback and timeout paths of the orchestrators.
#[derive(Debug)]
pub struct MemoryStore {
    tree: RwLock<Value>,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    /// (last timestamp, sequence within that millisecond) for push keys.
    push_state: Mutex<(i64, u32)>,
    op_log: Mutex<Vec<StoreOp>>,
    fail_prefixes: Mutex<Vec<String>>,
    deny_prefixes: Mutex<Vec<String>>,
    suppress_initial_events: Mutex<bool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(json!({})),
            subscribers: Mutex::new(HashMap::new()),
            push_state: Mutex::new((0, 0)),
            op_log: Mutex::new(Vec::new()),
            fail_prefixes: Mutex::new(Vec::new()),
            deny_prefixes: Mutex::new(Vec::new()),
            suppress_initial_events: Mutex::new(false),
        }
    }

    /// Every write/remove/multi-path-write applied so far, in order.
    pub fn operations(&self) -> Vec<StoreOp> {
        self.op_log.lock().clone()
    }

    pub fn clear_operations(&self) {
        self.op_log.lock().clear();
    }

    /// Make any write touching a path under `prefix` fail with a generic
    /// adapter error.
    pub fn fail_writes_under(&self, prefix: &str) {
        self.fail_prefixes.lock().push(prefix.to_string());
    }

    /// Make any write touching a path under `prefix` fail with
    /// `StoreError::PermissionDenied`.
    pub fn deny_writes_under(&self, prefix: &str) {
        self.deny_prefixes.lock().push(prefix.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_prefixes.lock().clear();
        self.deny_prefixes.lock().clear();
    }

    /// Simulate a slow backend: new subscriptions do not receive their
    /// initial snapshot.
    pub fn suppress_initial_events(&self, suppress: bool) {
        *self.suppress_initial_events.lock() = suppress;
    }

    /// Synchronous read used by assertions in tests.
    pub fn value_at(&self, path: &str) -> Option<Value> {
        get_at(&self.tree.read(), path).cloned()
    }

    fn check_guards(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            if self
                .deny_prefixes
                .lock()
                .iter()
                .any(|p| path.starts_with(p.as_str()))
            {
                return Err(StoreError::PermissionDenied { path: path.clone() }.into());
            }
            if self
                .fail_prefixes
                .lock()
                .iter()
                .any(|p| path.starts_with(p.as_str()))
            {
                bail!("simulated store failure at {}", path);
            }
        }
        Ok(())
    }

    /// Apply a batch of path/value updates atomically and fan change events
    /// out to subscribers.
    fn apply(&self, updates: &[(String, Value)]) -> Result<()> {
        let paths: Vec<String> = updates.iter().map(|(p, _)| p.clone()).collect();
        self.check_guards(&paths)?;

        let sub_paths: Vec<String> = self.subscribers.lock().keys().cloned().collect();

        let mut tree = self.tree.write();
        let before: HashMap<String, Value> = sub_paths
            .iter()
            .map(|p| (p.clone(), get_at(&tree, p).cloned().unwrap_or(Value::Null)))
            .collect();
        for (path, value) in updates {
            set_at(&mut tree, path, value.clone());
        }
        let after: HashMap<String, Value> = sub_paths
            .iter()
            .map(|p| (p.clone(), get_at(&tree, p).cloned().unwrap_or(Value::Null)))
            .collect();
        drop(tree);

        self.notify(&before, &after);
        Ok(())
    }

    fn notify(&self, before: &HashMap<String, Value>, after: &HashMap<String, Value>) {
        let mut subs = self.subscribers.lock();
        for (path, subscribers) in subs.iter_mut() {
            let old = before.get(path).cloned().unwrap_or(Value::Null);
            let new = after.get(path).cloned().unwrap_or(Value::Null);
            if old == new {
                continue;
            }
            subscribers.retain(|sub| {
                let events = events_for(sub.family, path, &old, &new);
                events.into_iter().all(|ev| sub.tx.send(ev).is_ok())
            });
        }
    }
}

/// Translate a before/after pair at a subscribed path into store events for
/// one subscription family.
fn events_for(family: EventFamily, path: &str, old: &Value, new: &Value) -> Vec<StoreEvent> {
    match family {
        EventFamily::Value => vec![StoreEvent {
            kind: StoreEventKind::Value,
            path: path.to_string(),
            key: last_segment(path),
            value: new.clone(),
            prior_child_key: None,
        }],
        EventFamily::Child => {
            let empty = Map::new();
            let old_children = old.as_object().unwrap_or(&empty);
            let new_children = new.as_object().unwrap_or(&empty);
            let mut events = Vec::new();
            for (key, value) in new_children {
                match old_children.get(key) {
                    None => events.push(StoreEvent {
                        kind: StoreEventKind::ChildAdded,
                        path: path.to_string(),
                        key: Some(key.clone()),
                        value: value.clone(),
                        prior_child_key: None,
                    }),
                    Some(prev) if prev != value => events.push(StoreEvent {
                        kind: StoreEventKind::ChildChanged,
                        path: path.to_string(),
                        key: Some(key.clone()),
                        value: value.clone(),
                        prior_child_key: None,
                    }),
                    Some(_) => {}
                }
            }
            for (key, value) in old_children {
                if !new_children.contains_key(key) {
                    events.push(StoreEvent {
                        kind: StoreEventKind::ChildRemoved,
                        path: path.to_string(),
                        key: Some(key.clone()),
                        value: value.clone(),
                        prior_child_key: None,
                    });
                }
            }
            events
        }
    }
}

#[async_trait::async_trait]
impl DatabaseAdapter for MemoryStore {
    async fn read(&self, path: &str) -> Result<Option<Value>> {
        Ok(get_at(&self.tree.read(), path).cloned())
    }

    async fn write(&self, path: &str, value: Value) -> Result<()> {
        self.apply(&[(path.to_string(), value)])?;
        self.op_log.lock().push(StoreOp::Write {
            path: path.to_string(),
        });
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.apply(&[(path.to_string(), Value::Null)])?;
        self.op_log.lock().push(StoreOp::Remove {
            path: path.to_string(),
        });
        Ok(())
    }

    async fn multi_path_write(&self, updates: HashMap<String, Value>, root: &str) -> Result<()> {
        let absolute: Vec<(String, Value)> = updates
            .into_iter()
            .map(|(rel, value)| (join_path(root, &rel), value))
            .collect();
        self.apply(&absolute)?;
        let mut paths: Vec<String> = absolute.into_iter().map(|(p, _)| p).collect();
        paths.sort();
        self.op_log.lock().push(StoreOp::MultiPathWrite { paths });
        Ok(())
    }

    async fn generate_unique_key(&self) -> Result<String> {
        let now = now_millis();
        let seq = {
            let mut state = self.push_state.lock();
            if state.0 == now {
                state.1 += 1;
            } else {
                *state = (now, 0);
            }
            state.1
        };

        let mut key = Vec::with_capacity(20);
        let mut ts = now as u64;
        for _ in 0..8 {
            key.push(PUSH_CHARS[(ts % 64) as usize]);
            ts /= 64;
        }
        key.reverse();
        let mut seq_part = Vec::with_capacity(4);
        let mut s = seq as u64;
        for _ in 0..4 {
            seq_part.push(PUSH_CHARS[(s % 64) as usize]);
            s /= 64;
        }
        seq_part.reverse();
        key.extend(seq_part);
        for byte in &Uuid::new_v4().as_bytes()[..8] {
            key.push(PUSH_CHARS[(*byte % 64) as usize]);
        }
        Ok(String::from_utf8(key).expect("push chars are ascii"))
    }

    async fn subscribe(
        &self,
        path: &str,
        family: EventFamily,
    ) -> Result<mpsc::UnboundedReceiver<StoreEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !*self.suppress_initial_events.lock() {
            let current = get_at(&self.tree.read(), path)
                .cloned()
                .unwrap_or(Value::Null);
            match family {
                // a value subscription always hears the current state, even
                // when nothing is there yet
                EventFamily::Value => {
                    let _ = tx.send(StoreEvent {
                        kind: StoreEventKind::Value,
                        path: path.to_string(),
                        key: last_segment(path),
                        value: current,
                        prior_child_key: None,
                    });
                }
                // a child subscription hears one child_added per existing
                // child
                EventFamily::Child => {
                    for event in events_for(EventFamily::Child, path, &Value::Null, &current) {
                        let _ = tx.send(event);
                    }
                }
            }
        }
        self.subscribers
            .lock()
            .entry(path.to_string())
            .or_default()
            .push(Subscriber { family, tx });
        Ok(rx)
    }

    async fn unsubscribe(&self, path: &str) -> Result<()> {
        self.subscribers.lock().remove(path);
        Ok(())
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn last_segment(path: &str) -> Option<String> {
    segments(path).last().map(|s| s.to_string())
}

fn join_path(root: &str, rel: &str) -> String {
    let mut parts = segments(root);
    parts.extend(segments(rel));
    format!("/{}", parts.join("/"))
}

fn get_at<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for seg in segments(path) {
        current = current.as_object()?.get(seg)?;
    }
    Some(current)
}

/// Write `value` at `path`, creating intermediate objects; `null` removes the
/// path.
fn set_at(root: &mut Value, path: &str, value: Value) {
    let segs = segments(path);
    if segs.is_empty() {
        *root = if value.is_null() { json!({}) } else { value };
        return;
    }
    if value.is_null() {
        remove_at(root, &segs);
        return;
    }
    let mut current = root;
    for seg in &segs[..segs.len() - 1] {
        if !current.is_object() {
            *current = json!({});
        }
        current = current
            .as_object_mut()
            .expect("object ensured above")
            .entry(seg.to_string())
            .or_insert_with(|| json!({}));
    }
    if !current.is_object() {
        *current = json!({});
    }
    current
        .as_object_mut()
        .expect("object ensured above")
        .insert(segs[segs.len() - 1].to_string(), value);
}

fn remove_at(root: &mut Value, segs: &[&str]) {
    let mut current = root;
    for seg in &segs[..segs.len() - 1] {
        match current.as_object_mut().and_then(|m| m.get_mut(*seg)) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(segs[segs.len() - 1]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_remove_round_trip() {
        let store = MemoryStore::new();
        store.write("/people/1", json!({ "name": "Bob" })).await.unwrap();
        assert_eq!(
            store.read("/people/1/name").await.unwrap(),
            Some(json!("Bob"))
        );
        store.remove("/people/1").await.unwrap();
        assert_eq!(store.read("/people/1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn multi_path_write_is_atomic_under_failure() {
        let store = MemoryStore::new();
        store.fail_writes_under("/companies");
        let updates = HashMap::from([
            ("/people/1/employer".to_string(), json!("c1")),
            ("/companies/c1/employees/1".to_string(), json!(true)),
        ]);
        assert!(store.multi_path_write(updates, "/").await.is_err());
        // nothing landed
        assert_eq!(store.read("/people/1").await.unwrap(), None);
        assert_eq!(store.read("/companies/c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn null_values_remove_paths() {
        let store = MemoryStore::new();
        store
            .write("/people/1", json!({ "name": "Bob", "age": 40 }))
            .await
            .unwrap();
        store
            .multi_path_write(
                HashMap::from([("/people/1/age".to_string(), Value::Null)]),
                "/",
            )
            .await
            .unwrap();
        assert_eq!(store.read("/people/1/age").await.unwrap(), None);
        assert_eq!(
            store.read("/people/1/name").await.unwrap(),
            Some(json!("Bob"))
        );
    }

    #[tokio::test]
    async fn push_keys_are_monotonic_and_sortable() {
        let store = MemoryStore::new();
        let mut keys = Vec::new();
        for _ in 0..50 {
            keys.push(store.generate_unique_key().await.unwrap());
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys[0].len(), 20);
    }

    #[tokio::test]
    async fn value_subscription_sees_initial_state_and_changes() {
        let store = MemoryStore::new();
        store.write("/people/1", json!({ "name": "Bob" })).await.unwrap();
        let mut rx = store.subscribe("/people/1", EventFamily::Value).await.unwrap();

        let initial = rx.recv().await.unwrap();
        assert_eq!(initial.kind, StoreEventKind::Value);
        assert_eq!(initial.value, json!({ "name": "Bob" }));

        store.write("/people/1/name", json!("Alice")).await.unwrap();
        let changed = rx.recv().await.unwrap();
        assert_eq!(changed.value["name"], json!("Alice"));
    }

    #[tokio::test]
    async fn child_subscription_reports_adds_changes_and_removals() {
        let store = MemoryStore::new();
        store.write("/people/1", json!({ "name": "Bob" })).await.unwrap();
        let mut rx = store.subscribe("/people", EventFamily::Child).await.unwrap();

        // existing child arrives as child_added
        let initial = rx.recv().await.unwrap();
        assert_eq!(initial.kind, StoreEventKind::ChildAdded);
        assert_eq!(initial.key.as_deref(), Some("1"));

        store.write("/people/2", json!({ "name": "Alice" })).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, StoreEventKind::ChildAdded);

        store.write("/people/2/name", json!("Ann")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, StoreEventKind::ChildChanged);

        store.remove("/people/2").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, StoreEventKind::ChildRemoved);
    }

    #[tokio::test]
    async fn denied_paths_surface_permission_errors() {
        let store = MemoryStore::new();
        store.deny_writes_under("/secure");
        let err = store.write("/secure/x", json!(1)).await.unwrap_err();
        assert!(err.downcast_ref::<StoreError>().is_some());
    }
}
