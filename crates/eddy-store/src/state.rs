//! State shared between store handles, the worker and live queries.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use eddy_storage::Storage;
use eddy_types::{Entity, EntityKey, EntityRef, EntityStatus, EntityType, InstanceId};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::config::StoreConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{StoreError, StoreResult};
use crate::pending::{PendingEntry, PendingQueue};
use crate::property::{Property, PropertyChange};
use crate::query::QueryObserver;
use crate::store::EntityStore;

/// Committed-or-loaded entities of one type, by key.
pub(crate) type EntitySet = DashMap<EntityKey, EntityRef>;

/// Canonical snapshot of every type. Shared by a store and its scopes.
pub(crate) type CanonicalSets = DashMap<EntityType, Arc<EntitySet>>;

/// Compares a stored entity with a freshly loaded one; `true` means
/// equivalent.
pub(crate) type Comparer = Arc<dyn Fn(&EntityRef, &EntityRef) -> bool + Send + Sync>;

/// Per type touched by a load, the entities the compare function reported
/// as changed.
pub(crate) type LoadReport = Vec<(EntityType, Vec<EntityRef>)>;

pub(crate) struct StoreState {
    pub(crate) config: StoreConfig,
    pub(crate) sets: Arc<CanonicalSets>,
    pub(crate) pending: Mutex<PendingQueue>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) storage: Option<Arc<dyn Storage>>,
    /// The store this one is a scope of.
    pub(crate) parent: Option<EntityStore>,
    /// Canonical slots a scope has repointed but not saved. Shadows `sets`
    /// for this store only; `None` outside scopes.
    overlay: Option<CanonicalSets>,
    in_flight_adds: DashMap<InstanceId, usize>,
    observers: Mutex<HashMap<EntityType, Vec<Weak<dyn QueryObserver>>>>,
    is_loading: AtomicBool,
    is_saving: AtomicBool,
    properties: broadcast::Sender<PropertyChange>,
}

impl StoreState {
    pub(crate) fn new(
        config: StoreConfig,
        sets: Arc<CanonicalSets>,
        dispatcher: Arc<dyn Dispatcher>,
        storage: Option<Arc<dyn Storage>>,
        parent: Option<EntityStore>,
    ) -> Self {
        let (properties, _) = broadcast::channel(config.property_channel_capacity);
        let overlay = parent.is_some().then(DashMap::new);
        Self {
            config,
            sets,
            pending: Mutex::new(PendingQueue::default()),
            dispatcher,
            storage,
            parent,
            overlay,
            in_flight_adds: DashMap::new(),
            observers: Mutex::new(HashMap::new()),
            is_loading: AtomicBool::new(false),
            is_saving: AtomicBool::new(false),
            properties,
        }
    }

    // ------------------------------------------------------------------
    // Canonical sets
    // ------------------------------------------------------------------

    pub(crate) fn set_for(&self, entity_type: EntityType) -> Arc<EntitySet> {
        Arc::clone(self.sets.entry(entity_type).or_default().value())
    }

    pub(crate) fn existing_set(&self, entity_type: EntityType) -> Option<Arc<EntitySet>> {
        self.sets
            .get(&entity_type)
            .map(|set| Arc::clone(set.value()))
    }

    fn overlay_set(&self, entity_type: EntityType) -> Option<Arc<EntitySet>> {
        self.overlay
            .as_ref()?
            .get(&entity_type)
            .map(|set| Arc::clone(set.value()))
    }

    /// The instance holding `key` as seen by this store: the scope overlay
    /// first, then the shared sets.
    fn canonical_get(&self, entity_type: EntityType, key: &EntityKey) -> Option<EntityRef> {
        let lookup = |set: Arc<EntitySet>| set.get(key).map(|entity| entity.value().clone());
        self.overlay_set(entity_type)
            .and_then(lookup)
            .or_else(|| self.existing_set(entity_type).and_then(lookup))
    }

    /// Returns `true` if the canonical slot of `entity`'s key holds this
    /// very instance.
    fn canonical_holds(&self, entity: &EntityRef) -> bool {
        let Some(key) = entity.key() else {
            return false;
        };
        self.canonical_get(entity.entity_type(), &key)
            .is_some_and(|current| current.same_instance(entity))
    }

    /// Point the canonical slot holding `old` at `new`. Returns the
    /// displaced instance when the slot changed hands.
    ///
    /// A scope records the change in its overlay; the shared sets only
    /// change when the parent commits.
    fn repoint(&self, old: &EntityRef, new: &EntityRef) -> Option<EntityRef> {
        if old.same_instance(new) || !self.canonical_holds(old) {
            return None;
        }
        let key = old.key()?;
        let entity_type = old.entity_type();
        let set = match &self.overlay {
            Some(overlay) => Arc::clone(overlay.entry(entity_type).or_default().value()),
            None => self.set_for(entity_type),
        };
        set.insert(key, new.clone());
        Some(old.clone())
    }

    /// Undo a `repoint` whose pending change is being dropped.
    fn restore(&self, displaced: &EntityRef) {
        let Some(key) = displaced.key() else {
            return;
        };
        let entity_type = displaced.entity_type();
        match &self.overlay {
            Some(_) => {
                if let Some(set) = self.overlay_set(entity_type) {
                    set.remove(&key);
                }
            }
            None => {
                self.set_for(entity_type).insert(key, displaced.clone());
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub(crate) fn status_of(&self, entity: &EntityRef) -> EntityStatus {
        if let Some(status) = self.pending.lock().status(entity.instance()) {
            return status;
        }
        if self.canonical_holds(entity) {
            EntityStatus::Attached
        } else {
            EntityStatus::Detached
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Canonical ∪ pending added − pending deleted, keyed entities by key
    /// and then keyless pending adds in insertion order.
    pub(crate) fn view<T: Entity>(&self) -> Vec<Arc<T>> {
        let entity_type = EntityType::of::<T>();
        let mut keyed: BTreeMap<EntityKey, EntityRef> = BTreeMap::new();
        let sets = [self.existing_set(entity_type), self.overlay_set(entity_type)];
        for set in sets.into_iter().flatten() {
            for item in set.iter() {
                keyed.insert(item.key().clone(), item.value().clone());
            }
        }

        let mut keyless = Vec::new();
        let mut deleted = HashSet::new();
        for entry in self.pending.lock().iter() {
            if entry.entity.entity_type() != entity_type {
                continue;
            }
            match (entry.status, entry.entity.key()) {
                (EntityStatus::Added, Some(key)) => {
                    keyed.insert(key, entry.entity.clone());
                }
                (EntityStatus::Added, None) => keyless.push(entry.entity.clone()),
                (EntityStatus::Deleted, Some(key)) => {
                    deleted.insert(key);
                }
                _ => {}
            }
        }
        keyed.retain(|key, _| !deleted.contains(key));

        keyed
            .into_values()
            .chain(keyless)
            .filter_map(|entity| entity.downcast::<T>())
            .collect()
    }

    pub(crate) fn find_by_key<T: Entity>(&self, key: &EntityKey) -> Option<Arc<T>> {
        let entity_type = EntityType::of::<T>();
        {
            let pending = self.pending.lock();
            for entry in pending.iter() {
                if entry.entity.entity_type() != entity_type || entry.entity.key().as_ref() != Some(key) {
                    continue;
                }
                match entry.status {
                    EntityStatus::Added => return entry.entity.downcast::<T>(),
                    EntityStatus::Deleted => return None,
                    _ => {}
                }
            }
        }
        self.canonical_get(entity_type, key)
            .and_then(|entity| entity.downcast::<T>())
    }

    // ------------------------------------------------------------------
    // Adds posted but not applied yet
    // ------------------------------------------------------------------

    pub(crate) fn begin_add(&self, entity: &EntityRef) {
        *self.in_flight_adds.entry(entity.instance()).or_insert(0) += 1;
    }

    pub(crate) fn end_add(&self, entity: &EntityRef) {
        let instance = entity.instance();
        let done = match self.in_flight_adds.get_mut(&instance) {
            Some(mut count) => {
                *count -= 1;
                *count == 0
            }
            None => false,
        };
        if done {
            self.in_flight_adds.remove_if(&instance, |_, count| *count == 0);
        }
    }

    /// Returns `true` if `entity` is pending `Added` or will be once an
    /// already posted `add` is applied.
    pub(crate) fn covers_add(&self, entity: &EntityRef) -> bool {
        self.in_flight_adds.contains_key(&entity.instance())
            || self.pending.lock().status(entity.instance()) == Some(EntityStatus::Added)
    }

    // ------------------------------------------------------------------
    // Transitions, applied on the worker
    // ------------------------------------------------------------------

    pub(crate) fn apply_add(&self, entities: Vec<EntityRef>) {
        let mut touched: HashMap<EntityType, Vec<EntityRef>> = HashMap::new();
        for entity in entities {
            self.end_add(&entity);
            let status = self.status_of(&entity);
            if status != EntityStatus::Detached {
                trace!(entity = ?entity, %status, "add ignored");
                continue;
            }
            self.pending
                .lock()
                .push(entity.clone(), EntityStatus::Added, None);
            touched.entry(entity.entity_type()).or_default().push(entity);
        }
        self.notify_touched(touched);
    }

    pub(crate) fn apply_replace(&self, old: EntityRef, new: EntityRef) -> StoreResult<()> {
        let entity_type = new.entity_type();
        let status = self.status_of(&old);
        if status != EntityStatus::Added {
            match (old.key(), new.key()) {
                (_, None) => return Err(StoreError::MissingKey { entity_type }),
                (Some(old_key), Some(new_key)) if old_key != new_key => {
                    return Err(StoreError::KeyMismatch {
                        entity_type,
                        old: old_key,
                        new: new_key,
                    })
                }
                _ => {}
            }
        }

        match status {
            EntityStatus::Detached => {
                self.pending
                    .lock()
                    .push(new.clone(), EntityStatus::Updated, None);
            }
            EntityStatus::Attached => {
                let displaced = self.repoint(&old, &new);
                self.pending
                    .lock()
                    .push(new.clone(), EntityStatus::Updated, displaced);
            }
            EntityStatus::Added => {
                self.pending
                    .lock()
                    .supersede(old.instance(), new.clone(), EntityStatus::Added, None);
            }
            EntityStatus::Deleted | EntityStatus::Updated => {
                let earlier = self
                    .pending
                    .lock()
                    .get(old.instance())
                    .and_then(|entry| entry.displaced.clone());
                let repointed = self.repoint(&old, &new);
                self.pending.lock().supersede(
                    old.instance(),
                    new.clone(),
                    EntityStatus::Updated,
                    earlier.or(repointed),
                );
            }
        }

        trace!(entity = ?new, from = %status, "replaced");
        self.notify(entity_type, vec![new], false);
        Ok(())
    }

    pub(crate) fn apply_delete(&self, entities: Vec<EntityRef>) -> StoreResult<()> {
        let mut touched: HashMap<EntityType, Vec<EntityRef>> = HashMap::new();
        let mut failure = None;
        for entity in entities {
            let entity_type = entity.entity_type();
            match self.status_of(&entity) {
                EntityStatus::Deleted => continue,
                EntityStatus::Added => {
                    self.pending.lock().remove(entity.instance());
                }
                EntityStatus::Updated => {
                    self.pending
                        .lock()
                        .set_status(entity.instance(), EntityStatus::Deleted);
                }
                EntityStatus::Attached | EntityStatus::Detached => {
                    if entity.key().is_none() {
                        failure = Some(StoreError::MissingKey { entity_type });
                        continue;
                    }
                    self.pending
                        .lock()
                        .push(entity.clone(), EntityStatus::Deleted, None);
                }
            }
            touched.entry(entity_type).or_default().push(entity);
        }
        self.notify_touched(touched);
        failure.map_or(Ok(()), Err)
    }

    /// Write saved entries into the canonical sets and clear the queue.
    /// Only entries that take over a slot held by another instance are
    /// reported as changed.
    ///
    /// Entries that still have no key after a successful save cannot be
    /// tracked; they are dropped and reported.
    pub(crate) fn commit_saved(&self, entries: Vec<PendingEntry>) -> StoreResult<()> {
        let mut touched: HashMap<EntityType, Vec<EntityRef>> = HashMap::new();
        let mut failure = None;
        for entry in entries {
            let entity_type = entry.entity.entity_type();
            let changed = touched.entry(entity_type).or_default();
            match (entry.status, entry.entity.key()) {
                (_, None) => failure = Some(StoreError::MissingKey { entity_type }),
                (EntityStatus::Added | EntityStatus::Updated, Some(key)) => {
                    let previous = self.set_for(entity_type).insert(key, entry.entity.clone());
                    if previous.is_some_and(|previous| !previous.same_instance(&entry.entity)) {
                        changed.push(entry.entity);
                    }
                }
                (EntityStatus::Deleted, Some(key)) => {
                    if let Some(set) = self.existing_set(entity_type) {
                        set.remove(&key);
                    }
                }
                _ => {}
            }
        }
        self.pending.lock().drain();
        self.notify_touched(touched);
        failure.map_or(Ok(()), Err)
    }

    /// Forget saved entries without touching the canonical sets. Used by
    /// scopes, whose changes are committed by the parent; the overlay slots
    /// of those entries are dropped so the parent's state shows through.
    pub(crate) fn forget_saved(&self, entries: Vec<PendingEntry>) {
        let mut touched = HashSet::new();
        let mut pending = self.pending.lock();
        for entry in &entries {
            pending.remove(entry.entity.instance());
            touched.insert(entry.entity.entity_type());
        }
        drop(pending);
        for entry in &entries {
            if let (Some(key), Some(set)) = (
                entry.entity.key(),
                self.overlay_set(entry.entity.entity_type()),
            ) {
                set.remove(&key);
            }
        }
        self.refresh_types(touched);
    }

    /// Drop every pending change, restoring canonical slots that pending
    /// updates overwrote. Returns the number of dropped entries.
    pub(crate) fn discard(&self) -> usize {
        let entries = self.pending.lock().drain();
        let count = entries.len();
        let mut touched: HashMap<EntityType, Vec<EntityRef>> = HashMap::new();
        for entry in entries {
            let entity_type = entry.entity.entity_type();
            if let Some(displaced) = entry.displaced {
                if self.canonical_holds(&entry.entity) {
                    self.restore(&displaced);
                }
                touched.entry(entity_type).or_default().push(displaced);
            }
            touched.entry(entity_type).or_default().push(entry.entity);
        }
        self.notify_touched(touched);
        count
    }

    /// Merge loaded entities into the canonical sets.
    ///
    /// Every entity must carry a key; this is checked before anything is
    /// written. With `force_reload` the target type's set is cleared first.
    pub(crate) fn merge_loaded(
        &self,
        target: EntityType,
        loaded: &[EntityRef],
        compare: Option<&Comparer>,
        force_reload: bool,
    ) -> StoreResult<LoadReport> {
        if let Some(keyless) = loaded.iter().find(|entity| entity.key().is_none()) {
            return Err(StoreError::MissingKey {
                entity_type: keyless.entity_type(),
            });
        }
        if force_reload {
            if let Some(set) = self.existing_set(target) {
                set.clear();
            }
        }

        let mut report: LoadReport = vec![(target, Vec::new())];
        for entity in loaded {
            let Some(key) = entity.key() else {
                continue;
            };
            let entity_type = entity.entity_type();
            let previous = self.set_for(entity_type).insert(key, entity.clone());
            let slot = match report.iter().position(|(t, _)| *t == entity_type) {
                Some(slot) => slot,
                None => {
                    report.push((entity_type, Vec::new()));
                    report.len() - 1
                }
            };
            if let (Some(previous), Some(compare)) = (previous, compare) {
                if !compare(&previous, entity) {
                    report[slot].1.push(entity.clone());
                }
            }
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Live query registry
    // ------------------------------------------------------------------

    pub(crate) fn register(&self, entity_type: EntityType, observer: Weak<dyn QueryObserver>) {
        self.observers
            .lock()
            .entry(entity_type)
            .or_default()
            .push(observer);
    }

    /// Upgrade the observers of a type, pruning dead registrations.
    fn live_observers(&self, entity_type: EntityType) -> Vec<Arc<dyn QueryObserver>> {
        let mut registry = self.observers.lock();
        let Some(list) = registry.get_mut(&entity_type) else {
            return Vec::new();
        };
        let mut live = Vec::with_capacity(list.len());
        list.retain(|weak| match weak.upgrade() {
            Some(observer) => {
                live.push(observer);
                true
            }
            None => false,
        });
        if list.is_empty() {
            registry.remove(&entity_type);
        }
        live
    }

    pub(crate) fn observer_count(&self, entity_type: EntityType) -> usize {
        self.live_observers(entity_type).len()
    }

    /// Ask every live query of `entity_type` to refresh.
    pub(crate) fn notify(&self, entity_type: EntityType, changed: Vec<EntityRef>, force_reload: bool) {
        let observers = self.live_observers(entity_type);
        if observers.is_empty() {
            return;
        }
        debug!(
            %entity_type,
            observers = observers.len(),
            changed = changed.len(),
            force_reload,
            "notifying live queries"
        );
        let changed: Arc<[EntityRef]> = changed.into();
        for observer in observers {
            let changed = Arc::clone(&changed);
            self.dispatcher
                .dispatch(Box::new(move || observer.refresh(&changed, force_reload)));
        }
    }

    fn notify_touched(&self, touched: HashMap<EntityType, Vec<EntityRef>>) {
        for (entity_type, changed) in touched {
            self.notify(entity_type, changed, false);
        }
    }

    /// Refresh queries of each type without reporting any item as changed.
    fn refresh_types(&self, types: HashSet<EntityType>) {
        for entity_type in types {
            self.notify(entity_type, Vec::new(), false);
        }
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    pub(crate) fn is_loading(&self) -> bool {
        self.is_loading.load(Ordering::SeqCst)
    }

    pub(crate) fn is_saving(&self) -> bool {
        self.is_saving.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe_properties(&self) -> broadcast::Receiver<PropertyChange> {
        self.properties.subscribe()
    }

    /// Raise `property` until the returned guard is dropped.
    pub(crate) fn raise(&self, property: Property) -> PropertyGuard<'_> {
        self.set_property(property, true);
        PropertyGuard {
            state: self,
            property,
        }
    }

    fn set_property(&self, property: Property, value: bool) {
        let flag = match property {
            Property::IsLoading => &self.is_loading,
            Property::IsSaving => &self.is_saving,
        };
        if flag.swap(value, Ordering::SeqCst) == value {
            return;
        }
        let sender = self.properties.clone();
        self.dispatcher.dispatch(Box::new(move || {
            // No receivers is fine.
            let _ = sender.send(PropertyChange { property, value });
        }));
    }
}

/// Lowers a raised property when dropped, panics included.
pub(crate) struct PropertyGuard<'a> {
    state: &'a StoreState,
    property: Property,
}

impl Drop for PropertyGuard<'_> {
    fn drop(&mut self) {
        self.state.set_property(self.property, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::InlineDispatcher;

    fn state() -> StoreState {
        StoreState::new(
            StoreConfig::default(),
            Arc::new(DashMap::new()),
            Arc::new(InlineDispatcher),
            None,
            None,
        )
    }

    // ----------------------------------------------------------------
    // Properties
    // ----------------------------------------------------------------

    #[test]
    fn property_changes_are_sent_only_when_the_value_flips() {
        let state = state();
        let mut changes = state.subscribe_properties();

        state.set_property(Property::IsLoading, false);
        state.set_property(Property::IsLoading, true);
        state.set_property(Property::IsLoading, true);
        {
            let _saving = state.raise(Property::IsSaving);
            assert!(state.is_saving());
        }
        assert!(!state.is_saving());
        state.set_property(Property::IsLoading, false);

        let mut seen = Vec::new();
        while let Ok(change) = changes.try_recv() {
            seen.push((change.property, change.value));
        }
        assert_eq!(
            seen,
            [
                (Property::IsLoading, true),
                (Property::IsSaving, true),
                (Property::IsSaving, false),
                (Property::IsLoading, false),
            ]
        );
    }
}
