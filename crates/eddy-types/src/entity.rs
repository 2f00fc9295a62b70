use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::key::EntityKey;

/// Capability every domain type tracked by the store must provide.
///
/// The key is `None` until it is assigned (by the application or, for
/// storage-generated keys, by the storage backend through
/// [`Entity::assign_key`]). Once assigned it must not change for the lifetime
/// of the instance.
pub trait Entity: Any + Send + Sync + fmt::Debug {
    /// The entity's key, if one has been assigned.
    fn key(&self) -> Option<EntityKey>;

    /// Write back a key generated by the storage backend.
    ///
    /// Returns `false` when the entity does not accept generated keys or
    /// already has one. The default implementation accepts nothing.
    fn assign_key(&self, key: EntityKey) -> bool {
        let _ = key;
        false
    }
}

/// Object-safe view of an [`Entity`], used wherever entities of different
/// types travel together (storage batches, pending queues, notifications).
///
/// Implemented for every `Entity`; there is no reason to implement it by hand.
pub trait AnyEntity: Send + Sync + fmt::Debug {
    fn entity_key(&self) -> Option<EntityKey>;
    fn assign_entity_key(&self, key: EntityKey) -> bool;
    fn entity_type(&self) -> EntityType;
    fn as_any(&self) -> &dyn Any;
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Entity> AnyEntity for T {
    fn entity_key(&self) -> Option<EntityKey> {
        self.key()
    }

    fn assign_entity_key(&self, key: EntityKey) -> bool {
        self.assign_key(key)
    }

    fn entity_type(&self) -> EntityType {
        EntityType::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Runtime identifier of an entity type.
///
/// Equality and hashing use the `TypeId` only; the name is kept for logs and
/// error messages.
#[derive(Clone, Copy)]
pub struct EntityType {
    id: TypeId,
    name: &'static str,
}

impl EntityType {
    /// The entity type of `T`.
    pub fn of<T: Entity>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The fully qualified Rust type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The last path segment of the type name (`Blog` for `app::model::Blog`).
    pub fn short_name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }

    /// Returns `true` if this is the entity type of `T`.
    pub fn is<T: Entity>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EntityType {}

impl Hash for EntityType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityType({})", self.short_name())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Address of a shared entity allocation; the identity of an entity *instance*.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(usize);

impl InstanceId {
    /// Instance identity of the allocation behind `entity`.
    ///
    /// An `Arc<T>` and an [`EntityRef`] built from it yield the same id.
    pub fn of<T: ?Sized>(entity: &Arc<T>) -> Self {
        Self(Arc::as_ptr(entity) as *const () as usize)
    }
}

/// Matching identity used when reconciling ordered views: the key when one
/// is assigned, otherwise the instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Identity {
    Key(EntityKey),
    Instance(InstanceId),
}

impl Identity {
    /// Identity of a typed entity handle.
    pub fn of<T: Entity>(entity: &Arc<T>) -> Self {
        match entity.key() {
            Some(key) => Self::Key(key),
            None => Self::Instance(InstanceId::of(entity)),
        }
    }
}

/// Type-erased, shared handle to an entity instance.
///
/// Two `EntityRef`s are equal only when they point at the same allocation:
/// lifecycle status is tracked per instance, not per key.
#[derive(Clone)]
pub struct EntityRef(Arc<dyn AnyEntity>);

impl EntityRef {
    /// Wrap a typed entity handle.
    pub fn new<T: Entity>(entity: Arc<T>) -> Self {
        Self(entity)
    }

    /// The entity's key, if assigned.
    pub fn key(&self) -> Option<EntityKey> {
        self.0.entity_key()
    }

    /// Write back a storage-generated key. See [`Entity::assign_key`].
    pub fn assign_key(&self, key: EntityKey) -> bool {
        self.0.assign_entity_key(key)
    }

    /// The concrete type of the entity.
    pub fn entity_type(&self) -> EntityType {
        self.0.entity_type()
    }

    /// Instance identity.
    pub fn instance(&self) -> InstanceId {
        InstanceId::of(&self.0)
    }

    /// Diff-matching identity (key, or instance when keyless).
    pub fn identity(&self) -> Identity {
        match self.key() {
            Some(key) => Identity::Key(key),
            None => Identity::Instance(self.instance()),
        }
    }

    /// Returns `true` if the entity is a `T`.
    pub fn is<T: Entity>(&self) -> bool {
        self.0.as_any().is::<T>()
    }

    /// Borrow the entity as a `T`.
    pub fn downcast_ref<T: Entity>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    /// Recover the typed handle, sharing the same allocation.
    pub fn downcast<T: Entity>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).into_any_arc().downcast::<T>().ok()
    }

    /// Returns `true` if both handles point at the same instance.
    pub fn same_instance(&self, other: &EntityRef) -> bool {
        self.instance() == other.instance()
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_instance(other)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instance().hash(state);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl<T: Entity> From<Arc<T>> for EntityRef {
    fn from(entity: Arc<T>) -> Self {
        Self::new(entity)
    }
}

impl<T: Entity> From<&Arc<T>> for EntityRef {
    fn from(entity: &Arc<T>) -> Self {
        Self::new(Arc::clone(entity))
    }
}

impl From<&EntityRef> for EntityRef {
    fn from(entity: &EntityRef) -> Self {
        entity.clone()
    }
}
