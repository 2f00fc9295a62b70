//! Single forward-pass reconciliation of an ordered list.

use std::collections::HashMap;
use std::hash::Hash;

use crate::change::{ListChange, ListDiff};

/// Reconcile `existing` with `new` in place and return the edits applied.
///
/// Items are matched by `identity`; identities are expected to be unique
/// within each list. A matched item is replaced (and a `Replace` emitted)
/// only when `is_changed` reports its identity as changed; otherwise the
/// existing item is kept as is.
///
/// The pass walks both lists once:
///
/// - matching heads advance together;
/// - an existing head that does not occur later in `new` is removed;
/// - a new head that does not occur in the rest of `existing` is buffered
///   and inserted, as one `Add`, right before the next match or removal;
/// - when both heads occur later on the other side the existing head is
///   removed and re-inserted once `new` reaches it.
///
/// Whatever is left over at the end is removed or appended. Consecutive
/// removals at one index are merged into a single `Remove`.
///
/// After the call `existing` matches `new` item for item by identity, and
/// replaying the returned edits onto a copy of the original list yields the
/// same result.
pub fn reconcile<T, I, F, C>(existing: &mut Vec<T>, new: &[T], identity: F, is_changed: C) -> ListDiff<T>
where
    T: Clone,
    I: Hash + Eq,
    F: Fn(&T) -> I,
    C: Fn(&I) -> bool,
{
    let positions: HashMap<I, usize> = new
        .iter()
        .enumerate()
        .map(|(index, item)| (identity(item), index))
        .collect();
    let mut remaining: HashMap<I, usize> = HashMap::with_capacity(existing.len());
    for item in existing.iter() {
        *remaining.entry(identity(item)).or_default() += 1;
    }

    let mut editor = Editor {
        list: existing,
        changes: Vec::new(),
        buffered: Vec::new(),
    };
    let mut i = 0;
    let mut j = 0;

    while i < editor.list.len() && j < new.len() {
        let current = identity(&editor.list[i]);
        let incoming = identity(&new[j]);

        if current == incoming {
            editor.flush(&mut i);
            if is_changed(&incoming) {
                let old = std::mem::replace(&mut editor.list[i], new[j].clone());
                editor.changes.push(ListChange::Replace {
                    index: i,
                    old,
                    new: new[j].clone(),
                });
            }
            release(&mut remaining, &current);
            i += 1;
            j += 1;
            continue;
        }

        let recurs_in_new = positions.get(&current).is_some_and(|&at| at > j);
        if !recurs_in_new {
            editor.flush(&mut i);
            editor.remove(i);
            release(&mut remaining, &current);
        } else if remaining.get(&incoming).copied().unwrap_or(0) == 0 {
            editor.buffered.push(new[j].clone());
            j += 1;
        } else {
            // Moved: drop it here, it comes back as an insert further on.
            editor.flush(&mut i);
            editor.remove(i);
            release(&mut remaining, &current);
        }
    }

    while i < editor.list.len() {
        editor.remove(i);
    }
    editor.buffered.extend(new[j..].iter().cloned());
    editor.flush(&mut i);

    ListDiff {
        changes: editor.changes,
    }
}

fn release<I: Hash + Eq>(remaining: &mut HashMap<I, usize>, id: &I) {
    if let Some(count) = remaining.get_mut(id) {
        *count = count.saturating_sub(1);
    }
}

struct Editor<'a, T> {
    list: &'a mut Vec<T>,
    changes: Vec<ListChange<T>>,
    buffered: Vec<T>,
}

impl<T: Clone> Editor<'_, T> {
    /// Insert buffered items at `index` and move `index` past them.
    fn flush(&mut self, index: &mut usize) {
        if self.buffered.is_empty() {
            return;
        }
        let items = std::mem::take(&mut self.buffered);
        let at = *index;
        self.list.splice(at..at, items.iter().cloned());
        *index += items.len();
        self.changes.push(ListChange::Add { index: at, items });
    }

    fn remove(&mut self, index: usize) {
        let item = self.list.remove(index);
        if let Some(ListChange::Remove { index: at, items }) = self.changes.last_mut() {
            if *at == index {
                items.push(item);
                return;
            }
        }
        self.changes.push(ListChange::Remove {
            index,
            items: vec![item],
        });
    }
}
