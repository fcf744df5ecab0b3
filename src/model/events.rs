use crate::model::composite_key::CompositeKey;
use crate::model::common::Id;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// CRUD operations on whole records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrudOp {
    Add,
    Update,
    Remove,
}

/// Operations on relationship fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelnOp {
    Set,
    Add,
    Remove,
    Clear,
}

/// Where in the two-phase commit an event sits.
///
/// `Local` is the optimistic in-memory application, `Confirmed`/`Rollback`
/// are the terminal outcomes of the store write, and `Remote` marks events
/// that originated in the store and arrived through a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPhase {
    Local,
    Confirmed,
    Rollback,
    Remote,
}

/// The two families of store subscriptions: whole-value snapshots versus
/// incremental child events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventFamily {
    Value,
    Child,
}

/// Watcher lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherPhase {
    Starting,
    Started,
    Failed,
    Stopped,
}

/// One `(path, value)` pair of a multi-path store write. A `null` value
/// removes the path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathWrite {
    pub path: String,
    pub value: Value,
}

impl PathWrite {
    pub fn new(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }
}

/// Field-level difference between two states of a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordDelta {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

impl RecordDelta {
    /// Compare a record's current fields against a prior snapshot.
    pub fn between(
        current: &HashMap<String, Value>,
        prior: &HashMap<String, Value>,
    ) -> Self {
        let mut delta = RecordDelta::default();
        for (key, value) in current {
            match prior.get(key) {
                None => delta.added.push(key.clone()),
                Some(prev) if prev != value => delta.changed.push(key.clone()),
                Some(_) => {}
            }
        }
        for key in prior.keys() {
            if !current.contains_key(key) {
                delta.removed.push(key.clone());
            }
        }
        delta.added.sort();
        delta.changed.sort();
        delta.removed.sort();
        delta
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Context merged into every dispatched event: where the event came from and
/// where local state for it lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    /// "record" / "list" when routed through a watcher, "unknown" when the
    /// mutating layer synthesized the event because no watcher covered the
    /// path.
    pub watcher_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watcher_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    pub dynamic_path_properties: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composite_key: Option<CompositeKey>,
}

impl EventContext {
    pub fn unwatched() -> Self {
        Self {
            watcher_source: "unknown".to_string(),
            watcher_id: None,
            local_path: None,
            dynamic_path_properties: Vec::new(),
            composite_key: None,
        }
    }
}

/// The tagged union handed to dispatch sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// Whole-record CRUD, both locally originated (`Local`/`Confirmed`/
    /// `Rollback`) and store originated (`Remote`).
    Record {
        transaction_id: String,
        phase: EventPhase,
        operation: CrudOp,
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<Id>,
        db_path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prior_value: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        delta: Option<RecordDelta>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prior_child_key: Option<String>,
        context: EventContext,
    },

    /// A relationship mutation on the owning record.
    Relationship {
        transaction_id: String,
        phase: EventPhase,
        operation: RelnOp,
        model: String,
        property: String,
        foreign_keys: Vec<String>,
        /// The store writes this operation produced (owning and inverse
        /// side).
        paths: Vec<PathWrite>,
        context: EventContext,
    },

    /// Non-fatal notice that an `add` re-used a foreign key which was already
    /// present; the write itself is idempotent.
    RelationshipDuplicate {
        transaction_id: String,
        model: String,
        property: String,
        foreign_key: String,
        context: EventContext,
    },

    /// Watcher lifecycle.
    Watcher {
        phase: WatcherPhase,
        watcher_id: String,
        model: String,
        event_family: EventFamily,
        watcher_paths: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl DispatchEvent {
    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            DispatchEvent::Record { transaction_id, .. }
            | DispatchEvent::Relationship { transaction_id, .. }
            | DispatchEvent::RelationshipDuplicate { transaction_id, .. } => {
                Some(transaction_id.as_str())
            }
            DispatchEvent::Watcher { .. } => None,
        }
    }

    pub fn phase(&self) -> Option<EventPhase> {
        match self {
            DispatchEvent::Record { phase, .. } | DispatchEvent::Relationship { phase, .. } => {
                Some(*phase)
            }
            _ => None,
        }
    }
}

/// The dispatch sink contract: a single-argument callback invoked with each
/// event. Delivery order is serialized per transaction by construction (the
/// orchestrators emit local before terminal events).
pub type DispatchFn = Arc<dyn Fn(DispatchEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delta_classifies_added_changed_removed() {
        let prior = HashMap::from([
            ("name".to_string(), json!("Bob")),
            ("age".to_string(), json!(40)),
            ("city".to_string(), json!("SF")),
        ]);
        let current = HashMap::from([
            ("name".to_string(), json!("Bob")),
            ("age".to_string(), json!(41)),
            ("title".to_string(), json!("chef")),
        ]);
        let delta = RecordDelta::between(&current, &prior);
        assert_eq!(delta.added, vec!["title"]);
        assert_eq!(delta.changed, vec!["age"]);
        assert_eq!(delta.removed, vec!["city"]);
    }

    #[test]
    fn events_serialize_with_a_kind_tag() {
        let event = DispatchEvent::Watcher {
            phase: WatcherPhase::Started,
            watcher_id: "w-abc".to_string(),
            model: "Person".to_string(),
            event_family: EventFamily::Value,
            watcher_paths: vec!["/people/1".to_string()],
            error: None,
        };
        let raw = serde_json::to_value(&event).unwrap();
        assert_eq!(raw["kind"], "watcher");
        assert_eq!(raw["phase"], "started");
    }
}
