use crate::config::CoreConfig;
use crate::model::{DispatchFn, ModelRegistry};
use crate::store::{AuditSink, DatabaseAdapter};
use crate::watch::WatcherPool;
use std::sync::Arc;

/// Everything the orchestrators need, carried explicitly instead of through
/// process-wide defaults: the model registry, the store adapter, the watcher
/// pool, the default dispatch sink and configuration.
///
/// Tests instantiate isolated contexts; there is no shared global state to
/// reset between them.
#[derive(Clone)]
pub struct ModelContext {
    pub registry: Arc<ModelRegistry>,
    pub store: Arc<dyn DatabaseAdapter>,
    pub watchers: Arc<WatcherPool>,
    /// Default sink for events on paths no watcher covers.
    pub dispatch: Option<DispatchFn>,
    /// External collaborator persisting audit entries for audit-enabled
    /// models.
    pub audit: Option<Arc<dyn AuditSink>>,
    pub config: CoreConfig,
}

impl ModelContext {
    pub fn new(registry: Arc<ModelRegistry>, store: Arc<dyn DatabaseAdapter>) -> Self {
        Self {
            registry,
            store,
            watchers: Arc::new(WatcherPool::new()),
            dispatch: None,
            audit: None,
            config: CoreConfig::default(),
        }
    }

    pub fn with_dispatch(mut self, dispatch: DispatchFn) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }
}
