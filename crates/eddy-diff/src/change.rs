/// A single edit to an ordered list.
///
/// Indices refer to the list as it stands after every earlier edit of the
/// same [`ListDiff`] has been applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListChange<T> {
    /// `items` were inserted starting at `index`.
    Add { index: usize, items: Vec<T> },
    /// `items` were removed starting at `index`.
    Remove { index: usize, items: Vec<T> },
    /// The item at `index` was replaced.
    Replace { index: usize, old: T, new: T },
    /// The whole list was replaced by `items`.
    Reset { items: Vec<T> },
}

impl<T: Clone> ListChange<T> {
    /// Replay this edit onto `target`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range for `target`, i.e. if `target` does
    /// not mirror the list the edit was produced for.
    pub fn apply(&self, target: &mut Vec<T>) {
        match self {
            Self::Add { index, items } => {
                target.splice(*index..*index, items.iter().cloned());
            }
            Self::Remove { index, items } => {
                target.drain(*index..*index + items.len());
            }
            Self::Replace { index, new, .. } => {
                target[*index] = new.clone();
            }
            Self::Reset { items } => {
                *target = items.clone();
            }
        }
    }
}

impl<T> ListChange<T> {
    /// Number of items this edit inserts, removes or replaces.
    pub fn item_count(&self) -> usize {
        match self {
            Self::Add { items, .. } | Self::Remove { items, .. } | Self::Reset { items } => {
                items.len()
            }
            Self::Replace { .. } => 1,
        }
    }
}

/// The ordered edits produced by one reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListDiff<T> {
    pub changes: Vec<ListChange<T>>,
}

impl<T> ListDiff<T> {
    /// Create an empty diff.
    pub fn new() -> Self {
        Self {
            changes: Vec::new(),
        }
    }

    /// Returns `true` if there are no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of edits.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Number of inserted items across all `Add` edits.
    pub fn additions(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, ListChange::Add { .. }))
            .map(ListChange::item_count)
            .sum()
    }

    /// Number of removed items across all `Remove` edits.
    pub fn removals(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, ListChange::Remove { .. }))
            .map(ListChange::item_count)
            .sum()
    }

    /// Number of `Replace` edits.
    pub fn replacements(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, ListChange::Replace { .. }))
            .count()
    }

    /// Replay every edit onto `target`, in order.
    pub fn apply(&self, target: &mut Vec<T>)
    where
        T: Clone,
    {
        for change in &self.changes {
            change.apply(target);
        }
    }
}

impl<T> Default for ListDiff<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IntoIterator for ListDiff<T> {
    type Item = ListChange<T>;
    type IntoIter = std::vec::IntoIter<ListChange<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_each_kind() {
        let mut list = vec!['a', 'b', 'c'];
        ListChange::Add {
            index: 1,
            items: vec!['x', 'y'],
        }
        .apply(&mut list);
        assert_eq!(list, ['a', 'x', 'y', 'b', 'c']);

        ListChange::Remove {
            index: 3,
            items: vec!['b', 'c'],
        }
        .apply(&mut list);
        assert_eq!(list, ['a', 'x', 'y']);

        ListChange::Replace {
            index: 0,
            old: 'a',
            new: 'z',
        }
        .apply(&mut list);
        assert_eq!(list, ['z', 'x', 'y']);

        ListChange::Reset { items: vec!['q'] }.apply(&mut list);
        assert_eq!(list, ['q']);
    }

    #[test]
    fn counts() {
        let diff = ListDiff {
            changes: vec![
                ListChange::Add {
                    index: 0,
                    items: vec![1, 2],
                },
                ListChange::Remove {
                    index: 2,
                    items: vec![3],
                },
                ListChange::Replace {
                    index: 0,
                    old: 1,
                    new: 1,
                },
            ],
        };
        assert_eq!(diff.len(), 3);
        assert_eq!(diff.additions(), 2);
        assert_eq!(diff.removals(), 1);
        assert_eq!(diff.replacements(), 1);
        assert!(ListDiff::<u8>::default().is_empty());
    }
}
