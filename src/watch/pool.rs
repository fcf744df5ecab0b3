use crate::model::{DispatchFn, EventFamily};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// What a watcher was started against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherSource {
    /// A single record path.
    Record,
    /// A collection path (list of records).
    List,
}

impl WatcherSource {
    fn id_prefix(&self) -> &'static str {
        match self {
            WatcherSource::Record => "w",
            WatcherSource::List => "wl",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WatcherSource::Record => "record",
            WatcherSource::List => "list",
        }
    }
}

/// One active observation of a path, as registered in the pool.
///
/// The id is derived deterministically from the watched path, so starting the
/// same watch twice yields the same watcher rather than a second
/// subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watcher {
    pub watcher_id: String,
    pub source: WatcherSource,
    pub model: String,
    pub event_family: EventFamily,
    pub query_path: String,
    pub watcher_paths: Vec<String>,
    /// Destination for this watcher's data in local state.
    pub local_path: String,
    pub dynamic_path_properties: Vec<String>,
    pub created_at: i64,
}

/// Deterministic watcher id: a source-kind prefix plus a hash of the watched
/// path.
pub fn watcher_id(source: WatcherSource, path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    format!("{}-{}", source.id_prefix(), &hex::encode(digest)[..12])
}

/// Whether a watcher has received its first value from the store yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Pending,
    Ready,
    /// The initial-sync wait elapsed; the watcher stays active.
    TimedOut,
}

struct WatcherHandle {
    watcher: Watcher,
    dispatch: DispatchFn,
    init: InitState,
}

/// Registry of active watchers with an explicit lifecycle
/// (`register`/`lookup`/`remove`/`clear`), owned by a `ModelContext` and
/// passed by reference. Registration and removal are simple key
/// insert/delete; the map sits behind a mutex so OS-threaded runtimes stay
/// safe.
#[derive(Default)]
pub struct WatcherPool {
    watchers: Mutex<HashMap<String, WatcherHandle>>,
}

impl WatcherPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, watcher: Watcher, dispatch: DispatchFn) {
        self.watchers.lock().insert(
            watcher.watcher_id.clone(),
            WatcherHandle {
                watcher,
                dispatch,
                init: InitState::Pending,
            },
        );
    }

    pub fn lookup(&self, watcher_id: &str) -> Option<Watcher> {
        self.watchers
            .lock()
            .get(watcher_id)
            .map(|h| h.watcher.clone())
    }

    pub fn dispatch_for(&self, watcher_id: &str) -> Option<DispatchFn> {
        self.watchers
            .lock()
            .get(watcher_id)
            .map(|h| h.dispatch.clone())
    }

    pub fn remove(&self, watcher_id: &str) -> Option<Watcher> {
        self.watchers
            .lock()
            .remove(watcher_id)
            .map(|h| h.watcher)
    }

    pub fn clear(&self) {
        self.watchers.lock().clear();
    }

    pub fn list(&self) -> Vec<Watcher> {
        self.watchers
            .lock()
            .values()
            .map(|h| h.watcher.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.watchers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.lock().is_empty()
    }

    /// Every watcher whose watched paths cover the given record path,
    /// together with its dispatch function.
    pub fn find_watchers(&self, db_path: &str) -> Vec<(Watcher, DispatchFn)> {
        self.watchers
            .lock()
            .values()
            .filter(|h| {
                h.watcher.watcher_paths.iter().any(|wp| {
                    db_path == wp || db_path.starts_with(&format!("{}/", wp))
                })
            })
            .map(|h| (h.watcher.clone(), h.dispatch.clone()))
            .collect()
    }

    pub fn mark_initialized(&self, watcher_id: &str) {
        if let Some(handle) = self.watchers.lock().get_mut(watcher_id) {
            if handle.init == InitState::Pending {
                handle.init = InitState::Ready;
            }
        }
    }

    pub fn mark_timed_out(&self, watcher_id: &str) {
        if let Some(handle) = self.watchers.lock().get_mut(watcher_id) {
            if handle.init == InitState::Pending {
                handle.init = InitState::TimedOut;
            }
        }
    }

    pub fn init_state(&self, watcher_id: &str) -> Option<InitState> {
        self.watchers.lock().get(watcher_id).map(|h| h.init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn watcher(path: &str) -> Watcher {
        Watcher {
            watcher_id: watcher_id(WatcherSource::Record, path),
            source: WatcherSource::Record,
            model: "Person".to_string(),
            event_family: EventFamily::Value,
            query_path: path.to_string(),
            watcher_paths: vec![path.to_string()],
            local_path: "/people".to_string(),
            dynamic_path_properties: Vec::new(),
            created_at: 0,
        }
    }

    fn noop_dispatch() -> DispatchFn {
        Arc::new(|_| {})
    }

    #[test]
    fn ids_are_deterministic_per_source_and_path() {
        let a = watcher_id(WatcherSource::Record, "/people/1");
        let b = watcher_id(WatcherSource::Record, "/people/1");
        let c = watcher_id(WatcherSource::List, "/people/1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("w-"));
        assert!(c.starts_with("wl-"));
    }

    #[test]
    fn registration_lifecycle() {
        let pool = WatcherPool::new();
        let w = watcher("/people/1");
        let id = w.watcher_id.clone();
        pool.register(w, noop_dispatch());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.init_state(&id), Some(InitState::Pending));
        pool.mark_initialized(&id);
        assert_eq!(pool.init_state(&id), Some(InitState::Ready));
        assert!(pool.remove(&id).is_some());
        assert!(pool.is_empty());
    }

    #[test]
    fn timed_out_does_not_downgrade_ready() {
        let pool = WatcherPool::new();
        let w = watcher("/people/1");
        let id = w.watcher_id.clone();
        pool.register(w, noop_dispatch());
        pool.mark_initialized(&id);
        pool.mark_timed_out(&id);
        assert_eq!(pool.init_state(&id), Some(InitState::Ready));
    }

    #[test]
    fn find_watchers_matches_path_prefixes() {
        let pool = WatcherPool::new();
        let mut list = watcher("/people");
        list.source = WatcherSource::List;
        list.watcher_id = watcher_id(WatcherSource::List, "/people");
        pool.register(list, noop_dispatch());

        assert_eq!(pool.find_watchers("/people/1").len(), 1);
        assert_eq!(pool.find_watchers("/people").len(), 1);
        assert!(pool.find_watchers("/peoples/1").is_empty());
        assert!(pool.find_watchers("/companies/1").is_empty());
    }
}
