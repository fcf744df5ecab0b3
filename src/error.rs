use crate::model::Cardinality;
use thiserror::Error;

/// Errors surfaced by the modeling core.
///
/// Validation errors (`NotReady`, `WrongCardinality`,
/// `RelationshipNotAllowedInUpdate`, ...) are raised before any store write is
/// attempted. Store-level failures are translated into a rollback dispatch
/// event first and then re-raised wrapped with operation context.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A property required to resolve the record's identity or storage path
    /// has not been set yet.
    #[error("{model} is not ready: the \"{property}\" property must be set before asking for {needed_for}")]
    NotReady {
        model: String,
        property: String,
        needed_for: String,
    },

    /// A composite-key string could not be parsed against the model's
    /// dynamic-segment layout.
    #[error("invalid composite key \"{key}\" for model {model}: {reason}")]
    InvalidKey {
        model: String,
        key: String,
        reason: String,
    },

    /// A dynamic path segment resolved to a value which is neither text nor a
    /// number.
    #[error("the \"{property}\" property on {model} is used in the storage path and must be text or a number, not {actual}")]
    InvalidFieldType {
        model: String,
        property: String,
        actual: String,
    },

    /// A single-cardinality operation was used against a many-relationship or
    /// vice versa. Raised before any write is attempted.
    #[error("{operation} can not be used on {model}.{property} because the relationship has {actual:?} cardinality")]
    WrongCardinality {
        model: String,
        property: String,
        operation: String,
        actual: Cardinality,
    },

    /// `update()` payloads may only carry plain properties.
    #[error("update() on {model} may not include relationship properties; offending properties: {properties:?}")]
    RelationshipNotAllowedInUpdate {
        model: String,
        properties: Vec<String>,
    },

    /// Re-adding an existing foreign key when the caller opted into treating
    /// duplicates as errors.
    #[error("the foreign key \"{fk}\" is already present on {model}.{property}")]
    DuplicateRelationship {
        model: String,
        property: String,
        fk: String,
    },

    /// A bi-directional relationship whose target does not declare the
    /// expected inverse property.
    #[error("{model}.{property} is bi-directional but the target model {target} has no \"{inverse}\" relationship")]
    MissingInverse {
        model: String,
        property: String,
        target: String,
        inverse: String,
    },

    /// Propagated from the store.
    #[error("permission denied by the store during {operation} of {model} at {path}")]
    PermissionDenied {
        model: String,
        operation: String,
        path: String,
    },

    /// The store rejected a write after local state had already advanced. A
    /// rollback dispatch event has been emitted; in-memory values are NOT
    /// automatically reverted.
    #[error("store write failed during {operation} of {model} [txn {transaction_id}]: {reason}")]
    StoreWriteFailure {
        model: String,
        operation: String,
        transaction_id: String,
        reason: anyhow::Error,
    },

    /// Catch-all wrapping unexpected failures during relationship
    /// orchestration with enough context to diagnose.
    #[error("unexpected failure while running {operation} on {model}.{property}: {reason}")]
    UnknownRelationshipProblem {
        model: String,
        property: String,
        operation: String,
        reason: anyhow::Error,
    },

    /// A cascading phase (remove's relationship cleanup, add's relationship
    /// backfill) failed part-way. Relationships listed in `completed` were
    /// already written and are not restored.
    #[error("{operation} of {model} failed while handling the \"{failed_property}\" relationship (completed: {completed:?}): {reason}")]
    CascadeFailure {
        model: String,
        operation: String,
        completed: Vec<String>,
        failed_property: String,
        #[source]
        reason: Box<ModelError>,
    },

    /// An operation which is structurally not allowed (re-setting an id,
    /// touching an undeclared property, ...).
    #[error("{0}")]
    NotAllowed(String),

    /// No record exists at the resolved path.
    #[error("no {model} record found at {path}")]
    NotFound { model: String, path: String },
}

pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    /// Short description of a JSON value's type, used in error messages.
    pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
        match value {
            serde_json::Value::Null => "null",
            serde_json::Value::Bool(_) => "a boolean",
            serde_json::Value::Number(_) => "a number",
            serde_json::Value::String(_) => "text",
            serde_json::Value::Array(_) => "an array",
            serde_json::Value::Object(_) => "an object",
        }
    }
}
