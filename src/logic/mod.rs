pub mod crud;
pub mod relationship_paths;
pub mod relationships;

pub use crud::*;
pub use relationship_paths::*;
pub use relationships::*;

use crate::error::ModelError;
use crate::store::StoreError;

/// Translate an adapter failure into the core taxonomy: permission problems
/// keep their identity, everything else becomes a `StoreWriteFailure` carrying
/// the operation context.
pub(crate) fn map_store_error(
    error: anyhow::Error,
    model: &str,
    operation: &str,
    path: &str,
    transaction_id: &str,
) -> ModelError {
    match error.downcast_ref::<StoreError>() {
        Some(StoreError::PermissionDenied { .. }) => ModelError::PermissionDenied {
            model: model.to_string(),
            operation: operation.to_string(),
            path: path.to_string(),
        },
        None => ModelError::StoreWriteFailure {
            model: model.to_string(),
            operation: operation.to_string(),
            transaction_id: transaction_id.to_string(),
            reason: error,
        },
    }
}
