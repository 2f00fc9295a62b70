use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TypeError;

/// Identity value of an entity within its type.
///
/// Keys are totally ordered: all `Int` keys sort before all `Uuid` keys,
/// which sort before all `Text` keys. Within a variant the natural order of
/// the payload applies. Live queries use this order when no explicit
/// ordering is supplied.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKey {
    /// Integer key, typically generated by the storage backend.
    Int(i64),
    /// UUID key, typically generated by the application.
    Uuid(Uuid),
    /// Free-form textual key.
    Text(String),
}

impl EntityKey {
    /// Generate a fresh time-ordered UUID key.
    pub fn new_uuid() -> Self {
        Self::Uuid(Uuid::now_v7())
    }

    /// The integer payload, if this is an `Int` key.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// The UUID payload, if this is a `Uuid` key.
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(value) => Some(*value),
            _ => None,
        }
    }

    /// The text payload, if this is a `Text` key.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey({self})")
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "int:{value}"),
            Self::Uuid(value) => write!(f, "uuid:{value}"),
            Self::Text(value) => write!(f, "text:{value}"),
        }
    }
}

impl FromStr for EntityKey {
    type Err = TypeError;

    /// Parse the textual form produced by `Display` (`int:42`,
    /// `uuid:<hyphenated>`, `text:<anything>`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, payload) = s
            .split_once(':')
            .ok_or_else(|| TypeError::InvalidKey(s.to_string()))?;
        match kind {
            "int" => payload
                .parse::<i64>()
                .map(Self::Int)
                .map_err(|e| TypeError::InvalidKey(format!("{s}: {e}"))),
            "uuid" => Uuid::parse_str(payload)
                .map(Self::Uuid)
                .map_err(|e| TypeError::InvalidKey(format!("{s}: {e}"))),
            "text" => Ok(Self::Text(payload.to_string())),
            _ => Err(TypeError::InvalidKey(s.to_string())),
        }
    }
}

impl From<i64> for EntityKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Uuid> for EntityKey {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<String> for EntityKey {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for EntityKey {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Write-once holder for a key that may be assigned after construction.
///
/// Entities whose key is generated by the storage backend keep it in a
/// `KeySlot`: the slot starts empty and is filled exactly once, after which
/// the key is immutable for the lifetime of the instance.
#[derive(Default)]
pub struct KeySlot(OnceLock<EntityKey>);

impl KeySlot {
    /// An empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// A slot that already holds `key`.
    pub fn with(key: impl Into<EntityKey>) -> Self {
        let slot = Self::new();
        let _ = slot.0.set(key.into());
        slot
    }

    /// The current key, if assigned.
    pub fn get(&self) -> Option<EntityKey> {
        self.0.get().cloned()
    }

    /// Assign the key. Returns `false` if the slot was already filled.
    pub fn assign(&self, key: EntityKey) -> bool {
        self.0.set(key).is_ok()
    }

    /// Returns `true` once a key has been assigned.
    pub fn is_assigned(&self) -> bool {
        self.0.get().is_some()
    }
}

impl Clone for KeySlot {
    fn clone(&self) -> Self {
        match self.0.get() {
            Some(key) => Self::with(key.clone()),
            None => Self::new(),
        }
    }
}

impl fmt::Debug for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.get() {
            Some(key) => write!(f, "KeySlot({key})"),
            None => write!(f, "KeySlot(<unassigned>)"),
        }
    }
}

impl From<Option<EntityKey>> for KeySlot {
    fn from(key: Option<EntityKey>) -> Self {
        match key {
            Some(key) => Self::with(key),
            None => Self::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_agree() {
        let keys = [
            EntityKey::Int(-7),
            EntityKey::new_uuid(),
            EntityKey::Text("a:b".into()),
        ];
        for key in keys {
            let parsed: EntityKey = key.to_string().parse().unwrap();
            assert_eq!(parsed, key);
        }
    }

    #[test]
    fn parse_rejects_unknown_kind() {
        let err = "blob:00".parse::<EntityKey>().unwrap_err();
        assert!(matches!(err, TypeError::InvalidKey(_)));
        assert!("no-separator".parse::<EntityKey>().is_err());
        assert!("int:abc".parse::<EntityKey>().is_err());
    }

    #[test]
    fn variants_order_before_payload() {
        let int = EntityKey::Int(i64::MAX);
        let uuid = EntityKey::Uuid(Uuid::nil());
        let text = EntityKey::Text(String::new());
        assert!(int < uuid);
        assert!(uuid < text);
        assert!(EntityKey::Int(1) < EntityKey::Int(2));
    }

    #[test]
    fn accessors() {
        assert_eq!(EntityKey::from(5i64).as_int(), Some(5));
        assert_eq!(EntityKey::from("x").as_text(), Some("x"));
        assert!(EntityKey::from(5i64).as_uuid().is_none());
    }

    #[test]
    fn slot_assigns_once() {
        let slot = KeySlot::new();
        assert!(!slot.is_assigned());
        assert!(slot.assign(EntityKey::Int(1)));
        assert!(!slot.assign(EntityKey::Int(2)));
        assert_eq!(slot.get(), Some(EntityKey::Int(1)));
    }

    #[test]
    fn cloned_slot_is_independent() {
        let empty = KeySlot::new();
        let copy = empty.clone();
        assert!(copy.assign(EntityKey::Int(9)));
        assert!(!empty.is_assigned());

        let filled = KeySlot::with(3i64);
        assert_eq!(filled.clone().get(), Some(EntityKey::Int(3)));
    }
}
