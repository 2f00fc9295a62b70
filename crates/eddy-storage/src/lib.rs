//! Storage collaborator for Eddy entity stores.
//!
//! An entity store persists through the [`Storage`] trait: `save` applies
//! a batch of [`StorageOperation`]s atomically and `load` returns records of
//! one entity type, optionally filtered. Backends assign keys to keyless
//! entities on insert.
//!
//! # Storage Backends
//!
//! - [`InMemoryStorage`] -- ordered in-memory tables for tests and embedding

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStorage;
pub use traits::{LoadFilter, LoadRequest, OperationKind, Storage, StorageOperation};
