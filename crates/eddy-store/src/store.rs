use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use eddy_storage::{LoadFilter, LoadRequest, Storage};
use eddy_types::{Entity, EntityKey, EntityRef, EntityStatus, EntityType};
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::command::{Command, FlushBarrier, LoadCommand};
use crate::config::StoreConfig;
use crate::dispatcher::{Dispatcher, InlineDispatcher};
use crate::error::{StoreError, StoreResult};
use crate::property::PropertyChange;
use crate::query::{LiveQuery, QueryOptions};
use crate::signal::AsyncSignal;
use crate::state::{Comparer, StoreState};
use crate::worker;

/// Handle to a reactive entity store.
///
/// Every mutation is posted to a single worker that applies commands one at
/// a time, in post order; the mutating methods only enqueue and return.
/// [`flush`](Self::flush) waits until everything posted before it has been
/// applied. Reads never go through the mailbox and may be called from any
/// thread.
///
/// Handles are cheap to clone and all clones post to the same worker. The
/// worker stops once the last handle is dropped.
#[derive(Clone)]
pub struct EntityStore {
    state: Arc<StoreState>,
    mailbox: mpsc::UnboundedSender<Command>,
}

impl EntityStore {
    /// Start building a store.
    pub fn builder() -> EntityStoreBuilder {
        EntityStoreBuilder::default()
    }

    /// A store with default configuration backed by `storage`.
    pub fn new(storage: Arc<dyn Storage>) -> StoreResult<Self> {
        Self::builder().storage(storage).build()
    }

    pub(crate) fn from_parts(state: Arc<StoreState>, mailbox: mpsc::UnboundedSender<Command>) -> Self {
        Self { state, mailbox }
    }

    pub(crate) fn post(&self, command: Command) -> StoreResult<()> {
        trace!(command = command.name(), "posting command");
        self.mailbox
            .send(command)
            .map_err(|_| StoreError::MailboxClosed)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Start tracking new entities as pending `Added`.
    ///
    /// Entities that are not `Detached` when the command is applied are
    /// ignored.
    pub fn add<I>(&self, entities: I) -> StoreResult<()>
    where
        I: IntoIterator,
        I::Item: Into<EntityRef>,
    {
        let entities: Vec<EntityRef> = entities.into_iter().map(Into::into).collect();
        if entities.is_empty() {
            return Ok(());
        }
        for entity in &entities {
            self.state.begin_add(entity);
        }
        let result = self.post(Command::Add(entities.clone()));
        if result.is_err() {
            for entity in &entities {
                self.state.end_add(entity);
            }
        }
        result
    }

    /// Replace `old` with `new`, which becomes the tracked instance.
    ///
    /// # Errors
    ///
    /// [`StoreError::KeyMismatch`] if both entities have keys and they
    /// differ. [`StoreError::MissingKey`] if `new` has no key while `old`
    /// is neither pending `Added` nor part of an `add` still in the mailbox.
    pub fn replace(&self, old: impl Into<EntityRef>, new: impl Into<EntityRef>) -> StoreResult<()> {
        let old = old.into();
        let new = new.into();
        let entity_type = new.entity_type();
        match (old.key(), new.key()) {
            (Some(old_key), Some(new_key)) if old_key != new_key => {
                return Err(StoreError::KeyMismatch {
                    entity_type,
                    old: old_key,
                    new: new_key,
                });
            }
            (_, None) if !self.state.covers_add(&old) => {
                return Err(StoreError::MissingKey { entity_type });
            }
            _ => {}
        }
        self.post(Command::Replace { old, new })
    }

    /// Mark entities as updated in place: `replace(e, e)` for each.
    pub fn update<I>(&self, entities: I) -> StoreResult<()>
    where
        I: IntoIterator,
        I::Item: Into<EntityRef>,
    {
        for entity in entities {
            let entity = entity.into();
            self.replace(entity.clone(), entity)?;
        }
        Ok(())
    }

    /// Mark entities for deletion. A pending add is simply dropped.
    ///
    /// # Errors
    ///
    /// [`StoreError::MissingKey`] if an entity has no key and is not
    /// pending `Added` (nor about to be). Nothing is posted in that case.
    pub fn delete<I>(&self, entities: I) -> StoreResult<()>
    where
        I: IntoIterator,
        I::Item: Into<EntityRef>,
    {
        let entities: Vec<EntityRef> = entities.into_iter().map(Into::into).collect();
        if let Some(keyless) = entities
            .iter()
            .find(|entity| entity.key().is_none() && !self.state.covers_add(entity))
        {
            return Err(StoreError::MissingKey {
                entity_type: keyless.entity_type(),
            });
        }
        if entities.is_empty() {
            return Ok(());
        }
        self.post(Command::Delete(entities))
    }

    /// Load entities of `T` from storage and merge them into the canonical
    /// snapshot.
    pub fn load<T: Entity>(&self, options: LoadOptions<T>) -> StoreResult<()> {
        self.post(Command::Load(options.into_command()))
    }

    /// Load every entity of `T`.
    pub fn load_all<T: Entity>(&self) -> StoreResult<()> {
        self.load(LoadOptions::<T>::new())
    }

    /// Write all pending changes to storage in one batch.
    ///
    /// Returns the number of pending changes at the time of the call.
    pub fn save(&self) -> StoreResult<usize> {
        let pending = self.pending_count();
        self.post(Command::Save)?;
        Ok(pending)
    }

    /// Drop every pending change without calling storage.
    ///
    /// Returns the number of pending changes at the time of the call.
    pub fn discard_changes(&self) -> StoreResult<usize> {
        let pending = self.pending_count();
        self.post(Command::DiscardChanges)?;
        Ok(pending)
    }

    /// Wait until every command posted before this call has been applied.
    ///
    /// Returns the number of pending changes at the time of the call.
    pub async fn flush(&self) -> usize {
        let pending = self.pending_count();
        let signal = Arc::new(AsyncSignal::new());
        let barrier = FlushBarrier::new(Arc::clone(&signal));
        if self.post(Command::Flush(barrier)).is_ok() {
            signal.wait().await;
        }
        pending
    }

    /// Blocking variant of [`flush`](Self::flush).
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    /// Calling it on the worker thread (from an inline dispatcher callback)
    /// never returns.
    pub fn flush_blocking(&self) -> usize {
        let pending = self.pending_count();
        let signal = Arc::new(AsyncSignal::new());
        let barrier = FlushBarrier::new(Arc::clone(&signal));
        if self.post(Command::Flush(barrier)).is_ok() {
            signal.wait_blocking();
        }
        pending
    }

    /// Run `task` on the worker, exclusively with respect to every other
    /// command of this store.
    ///
    /// The task receives a store handle and may post further commands. It
    /// must not await [`flush`](Self::flush) on this store: the flush
    /// barrier is queued behind the running task, so it never completes.
    /// Errors returned by the task are reported through
    /// [`Dispatcher::on_error`] as [`StoreError::Task`].
    pub fn run_exclusive<F, Fut, E>(&self, task: F) -> StoreResult<()>
    where
        F: FnOnce(EntityStore) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
    {
        self.post(Command::RunExclusive(Box::new(move |store| {
            async move {
                task(store).await.map_err(|e| {
                    let error: Box<dyn StdError + Send + Sync> = e.into();
                    StoreError::Task(error.to_string())
                })
            }
            .boxed()
        })))
    }

    /// A child store with its own pending changes and live queries.
    ///
    /// The scope shares this store's canonical snapshot. It has no storage
    /// of its own: saving re-issues its pending changes on this store and
    /// saves this store; loading goes through this store as well.
    pub fn create_scope(&self) -> StoreResult<EntityStore> {
        let state = Arc::new(StoreState::new(
            self.state.config.clone(),
            Arc::clone(&self.state.sets),
            Arc::clone(&self.state.dispatcher),
            None,
            Some(self.clone()),
        ));
        let mailbox = worker::spawn(Arc::clone(&state))?;
        debug!("scope created");
        Ok(Self::from_parts(state, mailbox))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Live view of every `T`, in default order.
    pub fn query<T: Entity>(&self) -> LiveQuery<T> {
        self.query_with(QueryOptions::new())
    }

    /// Live view of the `T`s selected by `options`.
    pub fn query_with<T: Entity>(&self, options: QueryOptions<T>) -> LiveQuery<T> {
        LiveQuery::new(Arc::clone(&self.state), options)
    }

    /// Number of live queries of `T` registered with this store.
    pub fn live_query_count<T: Entity>(&self) -> usize {
        self.state.observer_count(EntityType::of::<T>())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Current lifecycle status of an entity instance.
    pub fn entity_status(&self, entity: impl Into<EntityRef>) -> EntityStatus {
        self.state.status_of(&entity.into())
    }

    /// Every `T` the store knows: canonical plus pending adds, minus
    /// pending deletes, in default order.
    pub fn set<T: Entity>(&self) -> Vec<Arc<T>> {
        self.state.view::<T>()
    }

    /// Look up a `T` by key, pending adds and deletes included.
    pub fn find_by_key<T: Entity>(&self, key: &EntityKey) -> Option<Arc<T>> {
        self.state.find_by_key::<T>(key)
    }

    /// Number of pending changes.
    pub fn pending_count(&self) -> usize {
        self.state.pending_count()
    }

    pub fn is_loading(&self) -> bool {
        self.state.is_loading()
    }

    pub fn is_saving(&self) -> bool {
        self.state.is_saving()
    }

    /// Receive `is_loading`/`is_saving` changes.
    pub fn subscribe_properties(&self) -> broadcast::Receiver<PropertyChange> {
        self.state.subscribe_properties()
    }

    /// Returns `true` for a store created by [`create_scope`](Self::create_scope).
    pub fn is_scope(&self) -> bool {
        self.state.parent.is_some()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.state.config
    }
}

impl fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("pending", &self.pending_count())
            .field("scope", &self.is_scope())
            .field("has_storage", &self.state.storage.is_some())
            .finish()
    }
}

/// Builder for [`EntityStore`].
#[derive(Default)]
pub struct EntityStoreBuilder {
    config: StoreConfig,
    storage: Option<Arc<dyn Storage>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    configure: Option<Box<dyn FnOnce(&EntityStore) + Send>>,
}

impl EntityStoreBuilder {
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Defaults to [`InlineDispatcher`].
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Run `configure` once against the new store, before `build` returns.
    pub fn configure(mut self, configure: impl FnOnce(&EntityStore) + Send + 'static) -> Self {
        self.configure = Some(Box::new(configure));
        self
    }

    pub fn build(self) -> StoreResult<EntityStore> {
        self.config.validate()?;
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(InlineDispatcher));
        let state = Arc::new(StoreState::new(
            self.config,
            Arc::new(DashMap::new()),
            dispatcher,
            self.storage,
            None,
        ));
        let mailbox = worker::spawn(Arc::clone(&state))?;
        let store = EntityStore::from_parts(state, mailbox);
        if let Some(configure) = self.configure {
            configure(&store);
        }
        Ok(store)
    }
}

type TypedFilter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type TypedCompare<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;
type TypedOnLoad<T> = Box<dyn FnOnce(Vec<Arc<T>>) + Send>;

/// Options for [`EntityStore::load`].
pub struct LoadOptions<T: Entity> {
    filter: Option<TypedFilter<T>>,
    compare: Option<TypedCompare<T>>,
    force_reload: bool,
    on_load: Option<TypedOnLoad<T>>,
}

impl<T: Entity> LoadOptions<T> {
    pub fn new() -> Self {
        Self {
            filter: None,
            compare: None,
            force_reload: false,
            on_load: None,
        }
    }

    /// Only load entities matching `filter`. Applied by the storage backend.
    pub fn filter(mut self, filter: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Equivalence check between the entity already held and the loaded
    /// one. When it returns `false`, live queries report the loaded entity
    /// as replaced.
    pub fn compare(mut self, compare: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        self.compare = Some(Arc::new(compare));
        self
    }

    /// Clear the held entities of `T` first and reset live queries of `T`.
    pub fn force_reload(mut self, force_reload: bool) -> Self {
        self.force_reload = force_reload;
        self
    }

    /// Receive the loaded entities of `T`, through the dispatcher.
    pub fn on_load(mut self, on_load: impl FnOnce(Vec<Arc<T>>) + Send + 'static) -> Self {
        self.on_load = Some(Box::new(on_load));
        self
    }

    fn into_command(self) -> LoadCommand {
        let mut request = LoadRequest::of::<T>();
        if let Some(filter) = self.filter {
            request = request.with_filter(LoadFilter::new(move |entity: &T| filter(entity)));
        }
        let compare = self.compare.map(|compare| -> Comparer {
            Arc::new(move |held: &EntityRef, loaded: &EntityRef| {
                match (held.downcast_ref::<T>(), loaded.downcast_ref::<T>()) {
                    (Some(held), Some(loaded)) => compare(held, loaded),
                    _ => true,
                }
            })
        });
        let on_load = self.on_load.map(|on_load| -> crate::command::LoadCallback {
            Box::new(move |entities: Vec<EntityRef>| {
                on_load(entities.iter().filter_map(EntityRef::downcast::<T>).collect())
            })
        });
        LoadCommand {
            request,
            compare,
            force_reload: self.force_reload,
            on_load,
            report: None,
        }
    }
}

impl<T: Entity> Default for LoadOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}
