//! Fixtures shared by the store and query tests.

use std::sync::Arc;

use async_trait::async_trait;
use eddy_storage::{
    InMemoryStorage, LoadRequest, OperationKind, Storage, StorageOperation, StorageResult,
};
use eddy_types::{Entity, EntityKey, EntityRef, KeySlot};
use parking_lot::Mutex;

use crate::dispatcher::{Callback, Dispatcher};
use crate::error::StoreError;
use crate::query::LiveQuery;
use crate::store::EntityStore;
use crate::ListChange;

#[derive(Debug)]
pub(crate) struct Blog {
    id: KeySlot,
    pub(crate) title: String,
}

impl Blog {
    pub(crate) fn new(title: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: KeySlot::new(),
            title: title.into(),
        })
    }

    pub(crate) fn with_key(key: impl Into<EntityKey>, title: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: KeySlot::with(key),
            title: title.into(),
        })
    }
}

impl Entity for Blog {
    fn key(&self) -> Option<EntityKey> {
        self.id.get()
    }

    fn assign_key(&self, key: EntityKey) -> bool {
        self.id.assign(key)
    }
}

#[derive(Debug)]
pub(crate) struct Author {
    pub(crate) name: &'static str,
}

impl Entity for Author {
    fn key(&self) -> Option<EntityKey> {
        Some(EntityKey::from(self.name))
    }
}

/// Inline dispatcher that records reported errors.
#[derive(Default)]
pub(crate) struct RecordingDispatcher {
    errors: Mutex<Vec<String>>,
}

impl RecordingDispatcher {
    pub(crate) fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn dispatch(&self, callback: Callback) {
        callback();
    }

    fn on_error(&self, error: &StoreError) {
        self.errors.lock().push(error.to_string());
    }
}

/// Inline dispatcher whose error hook panics.
pub(crate) struct PanickingErrorHook;

impl Dispatcher for PanickingErrorHook {
    fn dispatch(&self, callback: Callback) {
        callback();
    }

    fn on_error(&self, error: &StoreError) {
        panic!("error hook failed on: {error}")
    }
}

/// Storage that accepts every save and records the operation kinds.
#[derive(Default)]
pub(crate) struct RecordingStorage {
    saved: Mutex<Vec<(OperationKind, usize)>>,
}

impl RecordingStorage {
    pub(crate) fn saved(&self) -> Vec<(OperationKind, usize)> {
        self.saved.lock().clone()
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn save(&self, operations: Vec<StorageOperation>) -> StorageResult<()> {
        self.saved
            .lock()
            .extend(operations.iter().map(|op| (op.kind(), op.len())));
        Ok(())
    }

    async fn load(&self, _request: LoadRequest) -> StorageResult<Vec<EntityRef>> {
        Ok(Vec::new())
    }
}

/// Storage whose saves panic.
pub(crate) struct PanickingStorage;

#[async_trait]
impl Storage for PanickingStorage {
    async fn save(&self, _operations: Vec<StorageOperation>) -> StorageResult<()> {
        panic!("disk on fire")
    }

    async fn load(&self, _request: LoadRequest) -> StorageResult<Vec<EntityRef>> {
        Ok(Vec::new())
    }
}

/// Storage whose loads return a fixed list.
pub(crate) struct FixedStorage(pub(crate) Vec<EntityRef>);

#[async_trait]
impl Storage for FixedStorage {
    async fn save(&self, _operations: Vec<StorageOperation>) -> StorageResult<()> {
        Ok(())
    }

    async fn load(&self, _request: LoadRequest) -> StorageResult<Vec<EntityRef>> {
        Ok(self.0.clone())
    }
}

pub(crate) struct Harness {
    pub(crate) store: EntityStore,
    pub(crate) storage: Arc<InMemoryStorage>,
    pub(crate) dispatcher: Arc<RecordingDispatcher>,
}

pub(crate) fn harness() -> Harness {
    let storage = Arc::new(InMemoryStorage::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let store = EntityStore::builder()
        .storage(storage.clone())
        .dispatcher(dispatcher.clone())
        .build()
        .unwrap();
    Harness {
        store,
        storage,
        dispatcher,
    }
}

pub(crate) type Events<T> = Arc<Mutex<Vec<ListChange<Arc<T>>>>>;

/// Collect every change a query emits.
pub(crate) fn record<T: Entity>(query: &LiveQuery<T>) -> Events<T> {
    let events: Events<T> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    query.subscribe(move |change| sink.lock().push(change.clone()));
    events
}

pub(crate) fn titles(blogs: &[Arc<Blog>]) -> Vec<&str> {
    blogs.iter().map(|blog| blog.title.as_str()).collect()
}
