use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use eddy_diff::{reconcile, ListChange};
use eddy_types::{Entity, EntityRef, EntityType, Identity};
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::state::StoreState;

/// Receiver of store notifications for one entity type.
pub(crate) trait QueryObserver: Send + Sync {
    /// Recompute the view. `changed` lists entities known to have new
    /// content; `force_reload` asks for a full reset.
    fn refresh(&self, changed: &[EntityRef], force_reload: bool);
}

type Filter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type Order<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;
type Subscriber<T> = Arc<dyn Fn(&ListChange<Arc<T>>) + Send + Sync>;

/// Selection and ordering of a [`LiveQuery`].
pub struct QueryOptions<T: Entity> {
    filter: Option<Filter<T>>,
    order: Option<Order<T>>,
}

impl<T: Entity> QueryOptions<T> {
    pub fn new() -> Self {
        Self {
            filter: None,
            order: None,
        }
    }

    /// Keep only entities matching `filter`.
    pub fn filter(mut self, filter: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Sort with `order` instead of the default key order. The sort is
    /// stable over the default order.
    pub fn order_by(mut self, order: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        self.order = Some(Arc::new(order));
        self
    }

    /// Sort by a derived key.
    pub fn sort_by_key<K: Ord + 'static>(self, key: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        self.order_by(move |a, b| key(a).cmp(&key(b)))
    }
}

impl<T: Entity> Default for QueryOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            order: self.order.clone(),
        }
    }
}

/// Handle returned by [`LiveQuery::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// An ordered view of one entity type that keeps itself current.
///
/// The view mirrors the store's set of `T` (canonical entities plus pending
/// adds, minus pending deletes) after filtering and ordering. On every
/// change to `T` it is reconciled against a fresh computation, and
/// subscribers receive the minimal [`ListChange`]s that turn the old list
/// into the new one. Refreshes run through the store's dispatcher.
///
/// The store only holds the query weakly: once every clone of the handle is
/// dropped the query stops refreshing and its registration is pruned.
pub struct LiveQuery<T: Entity> {
    inner: Arc<QueryInner<T>>,
}

struct QueryInner<T: Entity> {
    state: Arc<StoreState>,
    filter: Option<Filter<T>>,
    order: Option<Order<T>>,
    items: RwLock<Vec<Arc<T>>>,
    /// Serializes refreshes so events leave in the order they were computed.
    refresh: Mutex<()>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber<T>)>>,
    next_subscription: AtomicU64,
}

impl<T: Entity> LiveQuery<T> {
    pub(crate) fn new(state: Arc<StoreState>, options: QueryOptions<T>) -> Self {
        let inner = Arc::new(QueryInner {
            state,
            filter: options.filter,
            order: options.order,
            items: RwLock::new(Vec::new()),
            refresh: Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        });
        {
            let _refresh = inner.refresh.lock();
            let observer: Arc<dyn QueryObserver> = inner.clone();
            inner
                .state
                .register(EntityType::of::<T>(), Arc::downgrade(&observer));
            *inner.items.write() = inner.compute();
        }
        Self { inner }
    }

    /// Snapshot of the current items.
    pub fn items(&self) -> Vec<Arc<T>> {
        self.inner.items.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Arc<T>> {
        self.inner.items.read().get(index).cloned()
    }

    /// Call `subscriber` with every change from now on.
    ///
    /// With the inline dispatcher the callback runs on the store worker;
    /// it must not block on the store.
    pub fn subscribe(
        &self,
        subscriber: impl Fn(&ListChange<Arc<T>>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(
            self.inner
                .next_subscription
                .fetch_add(1, AtomicOrdering::Relaxed),
        );
        self.inner
            .subscribers
            .lock()
            .push((id, Arc::new(subscriber)));
        id
    }

    /// Stop calling a subscriber. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }
}

impl<T: Entity> Clone for LiveQuery<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity> fmt::Debug for LiveQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery")
            .field("entity_type", &EntityType::of::<T>())
            .field("len", &self.len())
            .field("filtered", &self.inner.filter.is_some())
            .field("ordered", &self.inner.order.is_some())
            .finish()
    }
}

impl<T: Entity> QueryInner<T> {
    fn compute(&self) -> Vec<Arc<T>> {
        let mut items = self.state.view::<T>();
        if let Some(filter) = &self.filter {
            items.retain(|item| filter(item));
        }
        if let Some(order) = &self.order {
            items.sort_by(|a, b| order(a, b));
        }
        items
    }

    fn emit(&self, changes: &[ListChange<Arc<T>>]) {
        let subscribers: Vec<Subscriber<T>> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, subscriber)| Arc::clone(subscriber))
            .collect();
        for change in changes {
            for subscriber in &subscribers {
                subscriber(change);
            }
        }
    }
}

impl<T: Entity> QueryObserver for QueryInner<T> {
    fn refresh(&self, changed: &[EntityRef], force_reload: bool) {
        let _refresh = self.refresh.lock();
        let fresh = self.compute();
        let changes = {
            let mut items = self.items.write();
            if force_reload {
                *items = fresh.clone();
                vec![ListChange::Reset { items: fresh }]
            } else {
                let changed: HashSet<Identity> = changed
                    .iter()
                    .filter(|entity| entity.is::<T>())
                    .map(EntityRef::identity)
                    .collect();
                reconcile(&mut *items, &fresh, Identity::of::<T>, |id: &Identity| {
                    changed.contains(id)
                })
                .changes
            }
        };
        if changes.is_empty() {
            return;
        }
        trace!(
            entity_type = %EntityType::of::<T>(),
            changes = changes.len(),
            "live query changed"
        );
        self.emit(&changes);
    }
}
