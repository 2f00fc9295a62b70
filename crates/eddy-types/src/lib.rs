//! Foundation types for Eddy, the reactive in-process entity cache.
//!
//! Every other Eddy crate depends on `eddy-types`. It defines what an entity
//! is, how entities are identified, and the lifecycle statuses a store
//! reports for them.
//!
//! # Key Types
//!
//! - [`Entity`] -- capability required of every domain type (`key()`)
//! - [`EntityKey`] -- identity value of an entity within its type
//! - [`KeySlot`] -- write-once key holder for storage-generated keys
//! - [`EntityRef`] -- type-erased, instance-identified entity handle
//! - [`EntityType`] -- runtime identifier of an entity type
//! - [`Identity`] -- key-or-instance identity used to match list items
//! - [`EntityStatus`] -- lifecycle status (Detached, Attached, Added, ...)

pub mod entity;
pub mod error;
pub mod key;
pub mod status;

pub use entity::{AnyEntity, Entity, EntityRef, EntityType, Identity, InstanceId};
pub use error::TypeError;
pub use key::{EntityKey, KeySlot};
pub use status::EntityStatus;
