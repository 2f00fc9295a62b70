use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use eddy_types::{Entity, EntityRef, EntityType};

use crate::error::StorageResult;

/// Kind of a storage write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Add,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// One write instruction in a save batch.
///
/// A single operation may carry several entities; the store only groups
/// entities of the same type into one operation.
#[derive(Clone, Debug)]
pub enum StorageOperation {
    /// Insert new records. Keyless entities receive generated keys.
    Add(Vec<EntityRef>),
    /// Overwrite existing records by key.
    Update(Vec<EntityRef>),
    /// Remove records by key.
    Delete(Vec<EntityRef>),
}

impl StorageOperation {
    /// Build an operation of the given kind.
    pub fn new(kind: OperationKind, entities: Vec<EntityRef>) -> Self {
        match kind {
            OperationKind::Add => Self::Add(entities),
            OperationKind::Update => Self::Update(entities),
            OperationKind::Delete => Self::Delete(entities),
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Add(_) => OperationKind::Add,
            Self::Update(_) => OperationKind::Update,
            Self::Delete(_) => OperationKind::Delete,
        }
    }

    /// The entities this operation writes.
    pub fn entities(&self) -> &[EntityRef] {
        match self {
            Self::Add(entities) | Self::Update(entities) | Self::Delete(entities) => entities,
        }
    }

    /// Entity type of the first entity, or `None` for an empty operation.
    pub fn entity_type(&self) -> Option<EntityType> {
        self.entities().first().map(EntityRef::entity_type)
    }

    pub fn len(&self) -> usize {
        self.entities().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities().is_empty()
    }
}

/// Predicate applied by the backend when loading.
///
/// Filters are erased so they can cross the storage boundary; build them
/// with [`LoadFilter::new`] from a predicate over the concrete type.
#[derive(Clone)]
pub struct LoadFilter(Arc<dyn Fn(&EntityRef) -> bool + Send + Sync>);

impl LoadFilter {
    /// Filter over entities of type `T`. Entities of any other type pass.
    pub fn new<T: Entity>(predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(move |entity: &EntityRef| {
            entity.downcast_ref::<T>().map_or(true, &predicate)
        }))
    }

    /// Filter over erased entity handles.
    pub fn from_fn(predicate: impl Fn(&EntityRef) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    pub fn matches(&self, entity: &EntityRef) -> bool {
        (self.0)(entity)
    }
}

impl fmt::Debug for LoadFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LoadFilter(..)")
    }
}

/// Request for the records of one entity type.
#[derive(Clone, Debug)]
pub struct LoadRequest {
    pub entity_type: EntityType,
    pub filter: Option<LoadFilter>,
}

impl LoadRequest {
    /// Load every record of `T`.
    pub fn of<T: Entity>() -> Self {
        Self {
            entity_type: EntityType::of::<T>(),
            filter: None,
        }
    }

    /// Restrict the request with a filter.
    pub fn with_filter(mut self, filter: LoadFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Returns `true` if `entity` satisfies the filter (or there is none).
    pub fn matches(&self, entity: &EntityRef) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter.matches(entity))
    }
}

/// The persistence collaborator behind an entity store.
///
/// Implementations must satisfy these invariants:
/// - `save` is all-or-nothing: on `Err` no operation of the batch is visible.
/// - Keyless entities in an `Add` receive a generated key through
///   [`EntityRef::assign_key`] before `save` returns `Ok`.
/// - `load` returns entities of the requested type that satisfy the filter.
///   It may also return entities of related types; the store merges
///   whatever comes back, grouped by each entity's own type.
/// - Errors are propagated, never silently ignored.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Apply a batch of writes atomically.
    async fn save(&self, operations: Vec<StorageOperation>) -> StorageResult<()>;

    /// Fetch records.
    async fn load(&self, request: LoadRequest) -> StorageResult<Vec<EntityRef>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_types::EntityKey;

    #[derive(Debug)]
    struct Item(i64);

    impl Entity for Item {
        fn key(&self) -> Option<EntityKey> {
            Some(EntityKey::Int(self.0))
        }
    }

    #[derive(Debug)]
    struct Other;

    impl Entity for Other {
        fn key(&self) -> Option<EntityKey> {
            None
        }
    }

    #[test]
    fn operation_accessors() {
        let op = StorageOperation::new(
            OperationKind::Update,
            vec![EntityRef::new(Arc::new(Item(1)))],
        );
        assert_eq!(op.kind(), OperationKind::Update);
        assert_eq!(op.len(), 1);
        assert_eq!(op.entity_type(), Some(EntityType::of::<Item>()));
        assert!(StorageOperation::Delete(Vec::new()).entity_type().is_none());
    }

    #[test]
    fn typed_filter_passes_other_types() {
        let filter = LoadFilter::new(|item: &Item| item.0 > 1);
        assert!(!filter.matches(&EntityRef::new(Arc::new(Item(1)))));
        assert!(filter.matches(&EntityRef::new(Arc::new(Item(2)))));
        assert!(filter.matches(&EntityRef::new(Arc::new(Other))));
    }

    #[test]
    fn request_without_filter_matches_everything() {
        let request = LoadRequest::of::<Item>();
        assert_eq!(request.entity_type, EntityType::of::<Item>());
        assert!(request.matches(&EntityRef::new(Arc::new(Item(0)))));
    }
}
