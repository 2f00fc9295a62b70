//! Reactive in-process entity cache.
//!
//! An [`EntityStore`] keeps a canonical snapshot of typed, keyed entities in
//! front of a [`Storage`](eddy_storage::Storage) backend. It tracks the
//! lifecycle status of every entity instance, funnels every mutation
//! through a single ordered mailbox, and keeps [`LiveQuery`] views current
//! by emitting minimal list edits whenever their entity type changes.
//!
//! # Lifecycle
//!
//! ```text
//! Detached --add--> Added --save--> Attached --replace--> Updated --save--> Attached
//! Attached --delete--> Deleted --save--> Detached
//! Added --delete--> Detached          Deleted --replace--> Updated
//! ```
//!
//! # Key Types
//!
//! - [`EntityStore`] -- handle to the store actor
//! - [`LiveQuery`] / [`QueryOptions`] -- self-updating filtered, ordered views
//! - [`LoadOptions`] -- filter, compare, force reload and callback of a load
//! - [`Dispatcher`] -- where callbacks run and errors are reported
//! - [`AsyncSignal`] -- the auto-reset signal behind `flush`
//! - [`StoreConfig`] -- TOML-loadable configuration

mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
mod pending;
pub mod property;
pub mod query;
pub mod signal;
mod state;
pub mod store;
mod worker;

#[cfg(test)]
mod testing;

pub use config::StoreConfig;
pub use dispatcher::{Callback, Dispatcher, InlineDispatcher};
pub use error::{StoreError, StoreResult};
pub use property::{Property, PropertyChange};
pub use query::{LiveQuery, QueryOptions, SubscriptionId};
pub use signal::AsyncSignal;
pub use store::{EntityStore, EntityStoreBuilder, LoadOptions};

pub use eddy_diff::ListChange;
pub use eddy_types::{Entity, EntityKey, EntityRef, EntityStatus, EntityType, KeySlot};
