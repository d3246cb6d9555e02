use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mutable fields of an entity, keyed by field name.
pub type Fields = serde_json::Map<String, Value>;

/// Namespace an entity lives in ("companies", "factories", ...).
///
/// The game's well-known namespaces are tagged variants with a static lookup
/// table ([`EntityKind::KNOWN`]); anything else the server sends is carried
/// verbatim in [`EntityKind::Other`]. On the wire a kind is always its plain
/// string name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityKind {
    Companies,
    Bases,
    Factories,
    Cities,
    Worlds,
    Other(String),
}

/// Static description of a well-known entity kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KindInfo {
    /// Wire name of the namespace.
    pub name: &'static str,
    /// Human readable singular label.
    pub label: &'static str,
}

impl EntityKind {
    /// Lookup table for the well-known kinds, in declaration order.
    pub const KNOWN: [(EntityKind, KindInfo); 5] = [
        (EntityKind::Companies, KindInfo { name: "companies", label: "Company" }),
        (EntityKind::Bases, KindInfo { name: "bases", label: "Base" }),
        (EntityKind::Factories, KindInfo { name: "factories", label: "Factory" }),
        (EntityKind::Cities, KindInfo { name: "cities", label: "City" }),
        (EntityKind::Worlds, KindInfo { name: "worlds", label: "World" }),
    ];

    /// Static info for a well-known kind, `None` for [`EntityKind::Other`].
    pub fn info(&self) -> Option<KindInfo> {
        Self::KNOWN
            .iter()
            .find(|(kind, _)| kind == self)
            .map(|(_, info)| *info)
    }

    /// The wire name of this kind.
    pub fn as_str(&self) -> &str {
        match self {
            EntityKind::Other(name) => name,
            known => known.info().map(|info| info.name).unwrap_or_default(),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EntityKind::Other(_))
    }
}

impl From<&str> for EntityKind {
    fn from(name: &str) -> Self {
        Self::KNOWN
            .iter()
            .find(|(_, info)| info.name == name)
            .map(|(kind, _)| kind.clone())
            .unwrap_or_else(|| EntityKind::Other(name.to_string()))
    }
}

impl From<String> for EntityKind {
    fn from(name: String) -> Self {
        match EntityKind::from(name.as_str()) {
            EntityKind::Other(_) => EntityKind::Other(name),
            known => known,
        }
    }
}

impl From<EntityKind> for String {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier of an entity within its [`EntityKind`].
///
/// Servers use both numeric and string ids, so both are accepted; a numeric
/// string such as `"42"` found in a map key is normalized to `Int(42)` by
/// [`EntityId::from_key`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Text(String),
}

impl EntityId {
    /// Parse an id that arrived as an object key.
    pub fn from_key(key: &str) -> Self {
        key.parse::<i64>()
            .map(EntityId::Int)
            .unwrap_or_else(|_| EntityId::Text(key.to_string()))
    }

    /// Read an id out of a JSON value; only integers and strings qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(EntityId::Int),
            Value::String(text) => Some(EntityId::Text(text.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            EntityId::Int(id) => Value::from(*id),
            EntityId::Text(id) => Value::from(id.as_str()),
        }
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        EntityId::Int(id)
    }
}

impl From<i32> for EntityId {
    fn from(id: i32) -> Self {
        EntityId::Int(i64::from(id))
    }
}

impl From<u32> for EntityId {
    fn from(id: u32) -> Self {
        EntityId::Int(i64::from(id))
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        EntityId::Text(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        EntityId::Text(id)
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(id) => write!(f, "{}", id),
            EntityId::Text(id) => f.write_str(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_kinds_round_trip_through_their_wire_name() {
        for (kind, info) in EntityKind::KNOWN {
            assert_eq!(EntityKind::from(info.name), kind);
            assert_eq!(kind.as_str(), info.name);
        }
        assert_eq!(EntityKind::Factories.info().map(|i| i.label), Some("Factory"));
    }

    #[test]
    fn unknown_kind_is_carried_verbatim() {
        let kind: EntityKind = serde_json::from_value(json!("spaceports")).unwrap();
        assert_eq!(kind, EntityKind::Other("spaceports".to_string()));
        assert!(!kind.is_known());
        assert_eq!(serde_json::to_value(&kind).unwrap(), json!("spaceports"));
    }

    #[test]
    fn ids_accept_numbers_and_strings() {
        let int: EntityId = serde_json::from_value(json!(42)).unwrap();
        let text: EntityId = serde_json::from_value(json!("hq-1")).unwrap();
        assert_eq!(int, EntityId::Int(42));
        assert_eq!(text, EntityId::from("hq-1"));
        assert_eq!(EntityId::from_key("42"), EntityId::Int(42));
        assert_eq!(EntityId::from_value(&json!(true)), None);
    }
}
