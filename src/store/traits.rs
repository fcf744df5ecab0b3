use crate::model::{EventFamily, RecordDelta};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// A raw change notification from the backing store, before the dispatch
/// mediator enriches it with watcher context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreEventKind {
    /// Whole-value snapshot of the subscribed path.
    Value,
    ChildAdded,
    ChildChanged,
    ChildRemoved,
    ChildMoved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    /// The subscription path this event was observed on.
    pub path: String,
    /// Child key for child events, last path segment for value events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// `null` signals removal.
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_child_key: Option<String>,
}

/// Typed failures adapters can bail with; the core downcasts these out of the
/// `anyhow` chain to map them onto its own taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("permission denied at {path}")]
    PermissionDenied { path: String },
}

/// Contract of the backing hierarchical key-value database.
///
/// All operations are fallible and asynchronous. `multi_path_write` must be
/// atomic across every entry: either all land or none do.
#[async_trait::async_trait]
pub trait DatabaseAdapter: Send + Sync {
    async fn read(&self, path: &str) -> Result<Option<Value>>;
    async fn write(&self, path: &str, value: Value) -> Result<()>;
    async fn remove(&self, path: &str) -> Result<()>;
    /// Atomically apply a set of writes expressed relative to `root`; `null`
    /// values remove their path.
    async fn multi_path_write(&self, updates: HashMap<String, Value>, root: &str) -> Result<()>;
    /// A new unique key: monotonic, collision-resistant and lexicographically
    /// sortable by creation time.
    async fn generate_unique_key(&self) -> Result<String>;
    /// Begin observing a path. `Value` subscriptions receive whole-value
    /// snapshots (including one for the current value); `Child` subscriptions
    /// receive per-child events (including one `child_added` per existing
    /// child).
    async fn subscribe(
        &self,
        path: &str,
        family: EventFamily,
    ) -> Result<mpsc::UnboundedReceiver<StoreEvent>>;
    async fn unsubscribe(&self, path: &str) -> Result<()>;
}

/// One property-level change inside an audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditChange {
    /// "added" | "updated" | "removed"
    pub action: String,
    pub property: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// A confirmed mutation of an audit-enabled model, handed to the sink after
/// the store write succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub model: String,
    pub plural_name: String,
    pub record_id: String,
    /// Past-tense action: "added" | "updated" | "removed".
    pub action: String,
    pub changes: Vec<AuditChange>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Build the property-level change list from a record delta and the two
    /// field snapshots around it.
    pub fn changes_from_delta(
        delta: &RecordDelta,
        current: &HashMap<String, Value>,
        prior: &HashMap<String, Value>,
    ) -> Vec<AuditChange> {
        let mut changes = Vec::new();
        for property in &delta.added {
            changes.push(AuditChange {
                action: "added".to_string(),
                property: property.clone(),
                before: None,
                after: current.get(property).cloned(),
            });
        }
        for property in &delta.changed {
            changes.push(AuditChange {
                action: "updated".to_string(),
                property: property.clone(),
                before: prior.get(property).cloned(),
                after: current.get(property).cloned(),
            });
        }
        for property in &delta.removed {
            changes.push(AuditChange {
                action: "removed".to_string(),
                property: property.clone(),
                before: prior.get(property).cloned(),
                after: None,
            });
        }
        changes
    }
}

/// External collaborator that persists audit entries. Sink failures are
/// logged by the CRUD manager, never propagated to the caller.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn write_audit(&self, entry: AuditEntry) -> Result<()>;
}
