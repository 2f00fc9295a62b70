//! Entity lifecycle status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of an entity instance as seen by a store.
///
/// ```text
/// Detached --add--> Added --save--> Attached --replace--> Updated --save--> Attached
/// Attached --delete--> Deleted --save--> Detached
/// Added --delete--> Detached          Deleted --replace--> Updated
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityStatus {
    /// Not known to the store.
    Detached,
    /// Present in the canonical snapshot, no pending change.
    Attached,
    /// Pending insert.
    Added,
    /// Pending update.
    Updated,
    /// Pending delete.
    Deleted,
}

impl EntityStatus {
    /// Returns `true` for the statuses that represent a pending operation.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Added | Self::Updated | Self::Deleted)
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Detached => "detached",
            Self::Attached => "attached",
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_statuses() {
        assert!(EntityStatus::Added.is_pending());
        assert!(EntityStatus::Updated.is_pending());
        assert!(EntityStatus::Deleted.is_pending());
        assert!(!EntityStatus::Attached.is_pending());
        assert!(!EntityStatus::Detached.is_pending());
    }

    #[test]
    fn serde_uses_variant_names() {
        let json = serde_json::to_string(&EntityStatus::Updated).unwrap();
        assert_eq!(json, "\"Updated\"");
        assert_eq!(EntityStatus::Deleted.to_string(), "deleted");
    }
}
