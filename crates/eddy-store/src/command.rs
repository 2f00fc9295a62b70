//! Commands posted to a store worker and how each one is applied.

use std::sync::Arc;

use eddy_storage::{LoadRequest, OperationKind, StorageOperation};
use eddy_types::{EntityRef, EntityStatus, EntityType};
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::pending::PendingEntry;
use crate::property::Property;
use crate::signal::AsyncSignal;
use crate::state::{Comparer, LoadReport, StoreState};
use crate::store::EntityStore;
use crate::worker::Worker;

pub(crate) type ExclusiveTask =
    Box<dyn FnOnce(EntityStore) -> BoxFuture<'static, StoreResult<()>> + Send>;

pub(crate) type LoadCallback = Box<dyn FnOnce(Vec<EntityRef>) + Send>;

pub(crate) struct LoadCommand {
    pub(crate) request: LoadRequest,
    pub(crate) compare: Option<Comparer>,
    pub(crate) force_reload: bool,
    pub(crate) on_load: Option<LoadCallback>,
    /// Receives what changed once the load is merged. Set by scopes
    /// forwarding a load to their parent.
    pub(crate) report: Option<oneshot::Sender<LoadReport>>,
}

/// Releases a `flush` waiter once applied or dropped, so a barrier lost
/// with the mailbox never leaves its caller hanging.
pub(crate) struct FlushBarrier(Arc<AsyncSignal>);

impl FlushBarrier {
    pub(crate) fn new(signal: Arc<AsyncSignal>) -> Self {
        Self(signal)
    }
}

impl Drop for FlushBarrier {
    fn drop(&mut self) {
        self.0.set();
    }
}

pub(crate) enum Command {
    Add(Vec<EntityRef>),
    Replace { old: EntityRef, new: EntityRef },
    Delete(Vec<EntityRef>),
    Load(LoadCommand),
    Save,
    DiscardChanges,
    Flush(FlushBarrier),
    RunExclusive(ExclusiveTask),
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Replace { .. } => "replace",
            Self::Delete(_) => "delete",
            Self::Load(_) => "load",
            Self::Save => "save",
            Self::DiscardChanges => "discard_changes",
            Self::Flush(_) => "flush",
            Self::RunExclusive(_) => "run_exclusive",
        }
    }

    pub(crate) async fn apply(self, worker: &Worker) -> StoreResult<()> {
        let state = &worker.state;
        match self {
            Self::Add(entities) => {
                state.apply_add(entities);
                Ok(())
            }
            Self::Replace { old, new } => state.apply_replace(old, new),
            Self::Delete(entities) => state.apply_delete(entities),
            Self::Load(load) => load_entities(state, load).await,
            Self::Save => save_pending(state).await,
            Self::DiscardChanges => {
                let discarded = state.discard();
                debug!(discarded, "pending changes discarded");
                Ok(())
            }
            Self::Flush(barrier) => {
                drop(barrier);
                Ok(())
            }
            Self::RunExclusive(task) => match worker.handle() {
                Some(store) => task(store).await,
                None => {
                    debug!("store dropped before exclusive task ran");
                    Ok(())
                }
            },
        }
    }
}

// ----------------------------------------------------------------------
// Save
// ----------------------------------------------------------------------

async fn save_pending(state: &StoreState) -> StoreResult<()> {
    let entries = state.pending.lock().snapshot();
    if entries.is_empty() {
        debug!("nothing to save");
        return Ok(());
    }
    if let Some(parent) = &state.parent {
        return save_through_parent(state, parent, entries).await;
    }
    let Some(storage) = &state.storage else {
        warn!(
            pending = entries.len(),
            "save requested but no storage is configured"
        );
        return Ok(());
    };

    let operations = group_operations(&entries, state.config.group_storage_operations);
    debug!(
        operations = operations.len(),
        entities = entries.len(),
        "saving pending changes"
    );
    {
        let _saving = state.raise(Property::IsSaving);
        storage.save(operations).await?;
    }
    state.commit_saved(entries)
}

/// Re-issue a scope's pending changes on its parent, then save the parent.
async fn save_through_parent(
    state: &StoreState,
    parent: &EntityStore,
    entries: Vec<PendingEntry>,
) -> StoreResult<()> {
    for entry in &entries {
        match entry.status {
            EntityStatus::Added => parent.add([&entry.entity])?,
            EntityStatus::Updated => parent.update([&entry.entity])?,
            EntityStatus::Deleted => parent.delete([&entry.entity])?,
            EntityStatus::Attached | EntityStatus::Detached => {}
        }
    }
    parent.save()?;
    parent.flush().await;
    debug!(entities = entries.len(), "scope changes committed through parent");
    state.forget_saved(entries);
    Ok(())
}

/// Turn queue entries into storage operations, in queue order.
pub(crate) fn group_operations(entries: &[PendingEntry], group: bool) -> Vec<StorageOperation> {
    let mut operations = Vec::new();
    let mut current: Option<(OperationKind, EntityType, Vec<EntityRef>)> = None;
    for entry in entries {
        let kind = match entry.status {
            EntityStatus::Added => OperationKind::Add,
            EntityStatus::Updated => OperationKind::Update,
            EntityStatus::Deleted => OperationKind::Delete,
            EntityStatus::Attached | EntityStatus::Detached => continue,
        };
        let entity_type = entry.entity.entity_type();
        let extends = group
            && matches!(&current, Some((k, t, _)) if *k == kind && *t == entity_type);
        if extends {
            if let Some((_, _, batch)) = current.as_mut() {
                batch.push(entry.entity.clone());
            }
        } else if let Some((k, _, batch)) =
            current.replace((kind, entity_type, vec![entry.entity.clone()]))
        {
            operations.push(StorageOperation::new(k, batch));
        }
    }
    if let Some((kind, _, batch)) = current {
        operations.push(StorageOperation::new(kind, batch));
    }
    operations
}

// ----------------------------------------------------------------------
// Load
// ----------------------------------------------------------------------

async fn load_entities(state: &StoreState, load: LoadCommand) -> StoreResult<()> {
    if let Some(parent) = &state.parent {
        return load_through_parent(state, parent, load).await;
    }
    let LoadCommand {
        request,
        compare,
        force_reload,
        on_load,
        report,
    } = load;
    let target = request.entity_type;
    let Some(storage) = &state.storage else {
        warn!(entity_type = %target, "load requested but no storage is configured");
        return Ok(());
    };

    let loaded = {
        let _loading = state.raise(Property::IsLoading);
        storage.load(request).await?
    };
    debug!(entity_type = %target, count = loaded.len(), force_reload, "loaded entities");

    let changes = state.merge_loaded(target, &loaded, compare.as_ref(), force_reload)?;
    for (entity_type, changed) in &changes {
        state.notify(*entity_type, changed.clone(), force_reload && *entity_type == target);
    }

    if let Some(on_load) = on_load {
        let of_target: Vec<EntityRef> = loaded
            .into_iter()
            .filter(|entity| entity.entity_type() == target)
            .collect();
        state.dispatcher.dispatch(Box::new(move || on_load(of_target)));
    }
    if let Some(report) = report {
        let _ = report.send(changes);
    }
    Ok(())
}

/// Let the parent load, then refresh this scope's own queries.
async fn load_through_parent(
    state: &StoreState,
    parent: &EntityStore,
    mut load: LoadCommand,
) -> StoreResult<()> {
    let target = load.request.entity_type;
    let force_reload = load.force_reload;
    let (sender, receiver) = oneshot::channel();
    load.report = Some(sender);
    parent.post(Command::Load(load))?;

    match receiver.await {
        Ok(changes) => {
            for (entity_type, changed) in changes {
                state.notify(entity_type, changed, force_reload && entity_type == target);
            }
        }
        // The parent reports its own failure.
        Err(_) => debug!(entity_type = %target, "parent load produced nothing"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_types::{Entity, EntityKey};

    #[derive(Debug)]
    struct A(i64);

    impl Entity for A {
        fn key(&self) -> Option<EntityKey> {
            Some(EntityKey::Int(self.0))
        }
    }

    #[derive(Debug)]
    struct B(i64);

    impl Entity for B {
        fn key(&self) -> Option<EntityKey> {
            Some(EntityKey::Int(self.0))
        }
    }

    fn entry(entity: EntityRef, status: EntityStatus) -> PendingEntry {
        PendingEntry {
            entity,
            status,
            displaced: None,
        }
    }

    fn entries() -> Vec<PendingEntry> {
        vec![
            entry(EntityRef::new(Arc::new(A(1))), EntityStatus::Added),
            entry(EntityRef::new(Arc::new(A(2))), EntityStatus::Added),
            entry(EntityRef::new(Arc::new(B(1))), EntityStatus::Added),
            entry(EntityRef::new(Arc::new(A(3))), EntityStatus::Deleted),
            entry(EntityRef::new(Arc::new(A(4))), EntityStatus::Deleted),
        ]
    }

    #[test]
    fn consecutive_same_kind_and_type_are_grouped() {
        let operations = group_operations(&entries(), true);
        let shape: Vec<(OperationKind, usize)> =
            operations.iter().map(|op| (op.kind(), op.len())).collect();
        assert_eq!(
            shape,
            [
                (OperationKind::Add, 2),
                (OperationKind::Add, 1),
                (OperationKind::Delete, 2),
            ]
        );
        assert_eq!(operations[1].entity_type(), Some(EntityType::of::<B>()));
    }

    #[test]
    fn grouping_can_be_disabled() {
        let operations = group_operations(&entries(), false);
        assert_eq!(operations.len(), 5);
        assert!(operations.iter().all(|op| op.len() == 1));
    }

    #[test]
    fn command_names() {
        assert_eq!(Command::Save.name(), "save");
        assert_eq!(Command::Add(Vec::new()).name(), "add");
        let barrier = FlushBarrier::new(Arc::new(AsyncSignal::new()));
        assert_eq!(Command::Flush(barrier).name(), "flush");
    }

    #[tokio::test]
    async fn dropped_flush_releases_its_waiter() {
        let signal = Arc::new(AsyncSignal::new());
        let command = Command::Flush(FlushBarrier::new(Arc::clone(&signal)));
        drop(command);
        assert!(signal.is_set());
        signal.wait().await;
    }
}
