use std::collections::{BTreeMap, HashMap};

use eddy_types::{EntityRef, EntityStatus, InstanceId};

/// A queued change that has not reached storage yet.
#[derive(Clone, Debug)]
pub(crate) struct PendingEntry {
    pub(crate) entity: EntityRef,
    pub(crate) status: EntityStatus,
    /// Canonical instance this entry overwrote, restored on discard.
    pub(crate) displaced: Option<EntityRef>,
}

/// FIFO of pending changes with an index by instance.
///
/// At most one entry exists per instance. Entries are ordered by an
/// insertion sequence; superseding an entry keeps its sequence, so the
/// change keeps its place in the queue.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    entries: BTreeMap<u64, PendingEntry>,
    index: HashMap<InstanceId, u64>,
    next_seq: u64,
}

impl PendingQueue {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn get(&self, instance: InstanceId) -> Option<&PendingEntry> {
        self.index
            .get(&instance)
            .and_then(|seq| self.entries.get(seq))
    }

    pub(crate) fn status(&self, instance: InstanceId) -> Option<EntityStatus> {
        self.get(instance).map(|entry| entry.status)
    }

    /// Append an entry, dropping any earlier entry for the same instance.
    pub(crate) fn push(
        &mut self,
        entity: EntityRef,
        status: EntityStatus,
        displaced: Option<EntityRef>,
    ) {
        self.remove(entity.instance());
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(entity.instance(), seq);
        self.entries.insert(
            seq,
            PendingEntry {
                entity,
                status,
                displaced,
            },
        );
    }

    /// Rewrite the entry for `old` in place. Falls back to
    /// [`push`](Self::push) when `old` has no entry.
    pub(crate) fn supersede(
        &mut self,
        old: InstanceId,
        entity: EntityRef,
        status: EntityStatus,
        displaced: Option<EntityRef>,
    ) {
        let Some(seq) = self.index.remove(&old) else {
            self.push(entity, status, displaced);
            return;
        };
        if entity.instance() != old {
            self.remove(entity.instance());
        }
        self.index.insert(entity.instance(), seq);
        self.entries.insert(
            seq,
            PendingEntry {
                entity,
                status,
                displaced,
            },
        );
    }

    /// Change the status of an existing entry without moving it.
    pub(crate) fn set_status(&mut self, instance: InstanceId, status: EntityStatus) -> bool {
        match self.index.get(&instance).and_then(|seq| self.entries.get_mut(seq)) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&mut self, instance: InstanceId) -> Option<PendingEntry> {
        let seq = self.index.remove(&instance)?;
        self.entries.remove(&seq)
    }

    /// Entries in queue order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.values()
    }

    /// Copy of the entries in queue order.
    pub(crate) fn snapshot(&self) -> Vec<PendingEntry> {
        self.entries.values().cloned().collect()
    }

    /// Remove and return every entry in queue order.
    pub(crate) fn drain(&mut self) -> Vec<PendingEntry> {
        self.index.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_types::{Entity, EntityKey};
    use std::sync::Arc;

    #[derive(Debug)]
    struct Row(i64);

    impl Entity for Row {
        fn key(&self) -> Option<EntityKey> {
            Some(EntityKey::Int(self.0))
        }
    }

    fn row(id: i64) -> EntityRef {
        EntityRef::new(Arc::new(Row(id)))
    }

    fn keys(queue: &PendingQueue) -> Vec<Option<EntityKey>> {
        queue.iter().map(|e| e.entity.key()).collect()
    }

    #[test]
    fn push_replaces_entry_for_same_instance() {
        let mut queue = PendingQueue::default();
        let a = row(1);
        queue.push(a.clone(), EntityStatus::Added, None);
        queue.push(row(2), EntityStatus::Added, None);
        queue.push(a.clone(), EntityStatus::Deleted, None);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.status(a.instance()), Some(EntityStatus::Deleted));
        assert_eq!(keys(&queue), [Some(EntityKey::Int(2)), Some(EntityKey::Int(1))]);
    }

    #[test]
    fn supersede_keeps_queue_position() {
        let mut queue = PendingQueue::default();
        let old = row(1);
        queue.push(old.clone(), EntityStatus::Added, None);
        queue.push(row(2), EntityStatus::Added, None);

        let new = row(10);
        queue.supersede(old.instance(), new.clone(), EntityStatus::Added, None);

        assert!(queue.status(old.instance()).is_none());
        assert_eq!(queue.status(new.instance()), Some(EntityStatus::Added));
        assert_eq!(keys(&queue), [Some(EntityKey::Int(10)), Some(EntityKey::Int(2))]);
    }

    #[test]
    fn set_status_and_drain() {
        let mut queue = PendingQueue::default();
        let a = row(1);
        queue.push(a.clone(), EntityStatus::Updated, None);
        assert!(queue.set_status(a.instance(), EntityStatus::Deleted));
        assert!(!queue.set_status(row(9).instance(), EntityStatus::Deleted));

        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].status, EntityStatus::Deleted);
        assert!(queue.is_empty());
        assert!(queue.get(a.instance()).is_none());
    }
}
