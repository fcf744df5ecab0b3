pub mod config;
pub mod context;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;
pub mod watch;

// Export configuration and context types
pub use config::{AuditConfig, CoreConfig, WatcherConfig};
pub use context::ModelContext;

// Export the error taxonomy
pub use error::{ModelError, Result};

// Export orchestration types
pub use logic::{
    build_relationship_paths, BuiltRelationshipPaths, CrudOperator, RelationshipOperator,
    RelnOptions, RelnPathOptions,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{
    AuditChange, AuditEntry, AuditSink, DatabaseAdapter, MemoryStore, StoreError, StoreEvent,
    StoreEventKind, StoreOp,
};

// Export watcher types
pub use watch::{watcher_id, InitState, WatchMediator, Watcher, WatcherPool, WatcherSource};
