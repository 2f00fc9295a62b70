use eddy_types::{EntityKey, EntityType};

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// An update or delete referenced an entity without a key.
    #[error("{entity_type} entity has no key")]
    MissingKey { entity_type: EntityType },

    /// An insert collided with an existing record.
    #[error("{entity_type} with key {key} already exists")]
    KeyConflict {
        entity_type: EntityType,
        key: EntityKey,
    },

    /// An update or delete referenced a record that does not exist.
    #[error("{entity_type} with key {key} not found")]
    NotFound {
        entity_type: EntityType,
        key: EntityKey,
    },

    /// The backend generated a key but the entity refused to take it.
    #[error("{entity_type} entity rejected generated key {key}")]
    KeyAssignmentRejected {
        entity_type: EntityType,
        key: EntityKey,
    },

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
