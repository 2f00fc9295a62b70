use std::io;

use eddy_storage::StorageError;
use eddy_types::{EntityKey, EntityType};

/// Errors produced by an entity store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The storage collaborator failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// An operation needs a key the entity does not have.
    #[error("{entity_type} entity has no key")]
    MissingKey { entity_type: EntityType },

    /// `replace` was given two entities with different keys.
    #[error("cannot replace {entity_type} {old} with {new}: keys differ")]
    KeyMismatch {
        entity_type: EntityType,
        old: EntityKey,
        new: EntityKey,
    },

    /// The store worker is gone and no longer accepts commands.
    #[error("store mailbox is closed")]
    MailboxClosed,

    /// The worker thread or its runtime could not be started.
    #[error("failed to start store worker: {0}")]
    WorkerSpawn(#[source] io::Error),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An exclusive task returned an error.
    #[error("exclusive task failed: {0}")]
    Task(String),

    /// A command panicked while being applied.
    #[error("command panicked: {0}")]
    Panicked(String),
}

/// Convenience alias used throughout the store crate.
pub type StoreResult<T> = Result<T, StoreError>;
