use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use eddy_types::{Entity, EntityKey, EntityRef, EntityType};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::traits::{LoadRequest, OperationKind, Storage, StorageOperation};

type Table = BTreeMap<EntityKey, EntityRef>;

/// In-memory storage backend.
///
/// Intended for tests, demos and embedding. Records live in one ordered map
/// per entity type behind a `RwLock`. Generated keys are `Int` keys drawn
/// from a single monotonic counter shared by all types.
///
/// Save batches are all-or-nothing: the batch is applied to a staged copy of
/// the tables, which replaces the live tables only when every operation
/// succeeded.
pub struct InMemoryStorage {
    tables: RwLock<HashMap<EntityType, Table>>,
    related: RwLock<HashMap<EntityType, Vec<EntityType>>>,
    next_key: AtomicI64,
    failing_saves: AtomicUsize,
    save_calls: AtomicUsize,
    load_calls: AtomicUsize,
}

impl InMemoryStorage {
    /// Create a new empty storage.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            related: RwLock::new(HashMap::new()),
            next_key: AtomicI64::new(1),
            failing_saves: AtomicUsize::new(0),
            save_calls: AtomicUsize::new(0),
            load_calls: AtomicUsize::new(0),
        }
    }

    /// Total number of records across all types.
    pub fn len(&self) -> usize {
        self.tables.read().values().map(BTreeMap::len).sum()
    }

    /// Returns `true` if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records of type `T`.
    pub fn count_of<T: Entity>(&self) -> usize {
        self.tables
            .read()
            .get(&EntityType::of::<T>())
            .map_or(0, BTreeMap::len)
    }

    /// Returns `true` if a `T` with `key` is stored.
    pub fn contains<T: Entity>(&self, key: &EntityKey) -> bool {
        self.tables
            .read()
            .get(&EntityType::of::<T>())
            .is_some_and(|table| table.contains_key(key))
    }

    /// The stored `T` with `key`.
    pub fn get<T: Entity>(&self, key: &EntityKey) -> Option<Arc<T>> {
        self.tables
            .read()
            .get(&EntityType::of::<T>())
            .and_then(|table| table.get(key))
            .and_then(EntityRef::downcast::<T>)
    }

    /// Remove all records.
    pub fn clear(&self) {
        self.tables.write().clear();
    }

    /// Write a record directly, bypassing any store.
    ///
    /// Overwrites an existing record with the same key; a keyless entity
    /// receives a generated key first. Used to simulate changes made by
    /// another writer.
    pub fn seed(&self, entity: impl Into<EntityRef>) -> StorageResult<EntityKey> {
        let entity = entity.into();
        let entity_type = entity.entity_type();
        let mut tables = self.tables.write();
        let table = tables.entry(entity_type).or_default();
        let key = match entity.key() {
            Some(key) => key,
            None => {
                let key = self.generate_key(table);
                if !entity.assign_key(key.clone()) {
                    return Err(StorageError::KeyAssignmentRejected { entity_type, key });
                }
                key
            }
        };
        table.insert(key.clone(), entity);
        Ok(key)
    }

    /// Declare that loading `T` also returns every record of `R`.
    pub fn relate<T: Entity, R: Entity>(&self) {
        self.related
            .write()
            .entry(EntityType::of::<T>())
            .or_default()
            .push(EntityType::of::<R>());
    }

    /// Make the next `count` save calls fail with a backend error.
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Number of `save` calls received, failed ones included.
    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    /// Number of `load` calls received.
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    fn generate_key(&self, table: &Table) -> EntityKey {
        loop {
            let key = EntityKey::Int(self.next_key.fetch_add(1, Ordering::SeqCst));
            if !table.contains_key(&key) {
                return key;
            }
        }
    }

    fn apply(
        &self,
        staged: &mut HashMap<EntityType, Table>,
        kind: OperationKind,
        entity: &EntityRef,
        assignments: &mut Vec<(EntityRef, EntityKey)>,
    ) -> StorageResult<()> {
        let entity_type = entity.entity_type();
        let table = staged.entry(entity_type).or_default();
        match kind {
            OperationKind::Add => {
                let key = match entity.key() {
                    Some(key) => key,
                    None => {
                        let key = self.generate_key(table);
                        assignments.push((entity.clone(), key.clone()));
                        key
                    }
                };
                if table.contains_key(&key) {
                    return Err(StorageError::KeyConflict { entity_type, key });
                }
                table.insert(key, entity.clone());
            }
            OperationKind::Update => {
                let key = entity
                    .key()
                    .ok_or(StorageError::MissingKey { entity_type })?;
                match table.get_mut(&key) {
                    Some(slot) => *slot = entity.clone(),
                    None => return Err(StorageError::NotFound { entity_type, key }),
                }
            }
            OperationKind::Delete => {
                let key = entity
                    .key()
                    .ok_or(StorageError::MissingKey { entity_type })?;
                if table.remove(&key).is_none() {
                    return Err(StorageError::NotFound { entity_type, key });
                }
            }
        }
        Ok(())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn save(&self, operations: Vec<StorageOperation>) -> StorageResult<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            warn!(operations = operations.len(), "injected save failure");
            return Err(StorageError::Backend("injected save failure".into()));
        }

        let mut tables = self.tables.write();
        let mut staged = tables.clone();
        let mut assignments = Vec::new();
        for operation in &operations {
            for entity in operation.entities() {
                self.apply(&mut staged, operation.kind(), entity, &mut assignments)?;
            }
        }

        // Keys are written back only once the whole batch validated. The
        // staged tables already hold the entities under their new keys.
        for (entity, key) in assignments {
            if !entity.assign_key(key.clone()) {
                return Err(StorageError::KeyAssignmentRejected {
                    entity_type: entity.entity_type(),
                    key,
                });
            }
        }
        *tables = staged;

        debug!(operations = operations.len(), "in-memory save applied");
        Ok(())
    }

    async fn load(&self, request: LoadRequest) -> StorageResult<Vec<EntityRef>> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.read();
        let mut loaded: Vec<EntityRef> = tables
            .get(&request.entity_type)
            .map(|table| {
                table
                    .values()
                    .filter(|entity| request.matches(entity))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(related) = self.related.read().get(&request.entity_type) {
            for related_type in related {
                if let Some(table) = tables.get(related_type) {
                    loaded.extend(table.values().cloned());
                }
            }
        }

        debug!(
            entity_type = %request.entity_type,
            count = loaded.len(),
            "in-memory load"
        );
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::LoadFilter;
    use eddy_types::KeySlot;

    #[derive(Debug)]
    struct Post {
        id: KeySlot,
        title: String,
    }

    impl Entity for Post {
        fn key(&self) -> Option<EntityKey> {
            self.id.get()
        }

        fn assign_key(&self, key: EntityKey) -> bool {
            self.id.assign(key)
        }
    }

    #[derive(Debug)]
    struct Author(&'static str);

    impl Entity for Author {
        fn key(&self) -> Option<EntityKey> {
            Some(EntityKey::from(self.0))
        }
    }

    fn post(title: &str) -> Arc<Post> {
        Arc::new(Post {
            id: KeySlot::new(),
            title: title.into(),
        })
    }

    fn keyed_post(id: i64, title: &str) -> Arc<Post> {
        Arc::new(Post {
            id: KeySlot::with(id),
            title: title.into(),
        })
    }

    fn refs(posts: &[&Arc<Post>]) -> Vec<EntityRef> {
        posts.iter().map(|p| EntityRef::from(*p)).collect()
    }

    // ----------------------------------------------------------------
    // Save
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn add_assigns_monotonic_keys() {
        let storage = InMemoryStorage::new();
        let a = post("a");
        let b = post("b");
        storage
            .save(vec![StorageOperation::Add(refs(&[&a, &b]))])
            .await
            .unwrap();

        let ka = a.key().unwrap().as_int().unwrap();
        let kb = b.key().unwrap().as_int().unwrap();
        assert!(ka < kb);
        assert_eq!(storage.count_of::<Post>(), 2);
        assert_eq!(storage.save_calls(), 1);
    }

    #[tokio::test]
    async fn update_and_delete_by_key() {
        let storage = InMemoryStorage::new();
        storage.seed(keyed_post(1, "old")).unwrap();
        storage.seed(keyed_post(2, "gone")).unwrap();

        storage
            .save(vec![
                StorageOperation::Update(refs(&[&keyed_post(1, "new")])),
                StorageOperation::Delete(refs(&[&keyed_post(2, "gone")])),
            ])
            .await
            .unwrap();

        assert_eq!(
            storage.get::<Post>(&EntityKey::Int(1)).unwrap().title,
            "new"
        );
        assert!(!storage.contains::<Post>(&EntityKey::Int(2)));
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_trace() {
        let storage = InMemoryStorage::new();
        storage.seed(keyed_post(1, "kept")).unwrap();
        let fresh = post("fresh");

        let err = storage
            .save(vec![
                StorageOperation::Add(refs(&[&fresh])),
                StorageOperation::Delete(refs(&[&keyed_post(99, "missing")])),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::NotFound { .. }));
        assert!(fresh.key().is_none());
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn add_with_existing_key_conflicts() {
        let storage = InMemoryStorage::new();
        storage.seed(keyed_post(5, "first")).unwrap();
        let err = storage
            .save(vec![StorageOperation::Add(refs(&[&keyed_post(5, "dup")]))])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::KeyConflict { .. }));
    }

    #[tokio::test]
    async fn update_without_key_is_rejected() {
        let storage = InMemoryStorage::new();
        let err = storage
            .save(vec![StorageOperation::Update(refs(&[&post("nokey")]))])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingKey { .. }));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let storage = InMemoryStorage::new();
        storage.fail_next_saves(1);
        let a = post("a");
        assert!(storage
            .save(vec![StorageOperation::Add(refs(&[&a]))])
            .await
            .is_err());
        assert!(storage.is_empty());
        storage
            .save(vec![StorageOperation::Add(refs(&[&a]))])
            .await
            .unwrap();
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.save_calls(), 2);
    }

    // ----------------------------------------------------------------
    // Load
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn load_applies_filter() {
        let storage = InMemoryStorage::new();
        storage.seed(keyed_post(1, "rust")).unwrap();
        storage.seed(keyed_post(2, "go")).unwrap();

        let loaded = storage
            .load(
                LoadRequest::of::<Post>()
                    .with_filter(LoadFilter::new(|p: &Post| p.title == "rust")),
            )
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key(), Some(EntityKey::Int(1)));
        assert_eq!(storage.load_calls(), 1);
    }

    #[tokio::test]
    async fn load_includes_related_types() {
        let storage = InMemoryStorage::new();
        storage.relate::<Post, Author>();
        storage.seed(keyed_post(1, "p")).unwrap();
        storage.seed(Arc::new(Author("ada"))).unwrap();

        let loaded = storage.load(LoadRequest::of::<Post>()).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().any(|e| e.is::<Author>()));

        let authors = storage.load(LoadRequest::of::<Author>()).await.unwrap();
        assert_eq!(authors.len(), 1);
    }

    #[test]
    fn seed_generates_key_for_keyless_entity() {
        let storage = InMemoryStorage::new();
        let p = post("seeded");
        let key = storage.seed(&p).unwrap();
        assert_eq!(p.key(), Some(key));
        storage.clear();
        assert!(storage.is_empty());
    }
}
