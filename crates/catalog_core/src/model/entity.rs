//! Structural entity projection used by staging, merging and auditing.
//!
//! # Responsibility
//! - Represent any catalog entity as `(entity_name, id, fields)`.
//! - Produce snapshots for `Edit::original` / `Edit::changes`.
//! - Bridge typed catalog structs through `CatalogEntity`.
//!
//! # Invariants
//! - `fields` never contains `id`; identity lives in `EntityRecord::id`.
//! - Snapshots drop every key listed in `SNAPSHOT_EXCLUDED_FIELDS`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Stable identifier of a catalog entity.
pub type EntityId = Uuid;

/// Stable identifier of an acting user.
pub type UserId = Uuid;

/// Plain key/value projection of an entity's fields.
pub type Snapshot = Map<String, Value>;

/// Keys never captured in snapshots: identity and embedded audit data.
pub const SNAPSHOT_EXCLUDED_FIELDS: &[&str] = &["id", "history"];

/// Suffix appended to an entity name to address its history store.
pub const HISTORY_STORE_SUFFIX: &str = "History";

/// Returns the history store name for one entity type.
pub fn history_store_name(entity_name: &str) -> String {
    format!("{entity_name}{HISTORY_STORE_SUFFIX}")
}

/// Unmanaged in-memory entity instance.
///
/// Instances are either loaded from the entity store or reconstructed from a
/// staged edit; neither kind is tracked by the store after it is returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_name: String,
    pub id: Option<EntityId>,
    pub fields: Snapshot,
}

impl EntityRecord {
    pub fn new(entity_name: impl Into<String>, id: Option<EntityId>, fields: Snapshot) -> Self {
        let mut record = Self {
            entity_name: entity_name.into(),
            id,
            fields,
        };
        record.fields.remove("id");
        record
    }

    /// Creates a record with a freshly generated id.
    pub fn with_new_id(entity_name: impl Into<String>, fields: Snapshot) -> Self {
        Self::new(entity_name, Some(Uuid::new_v4()), fields)
    }

    /// Full structural snapshot, excluding identity and audit fields.
    pub fn snapshot(&self) -> Snapshot {
        self.fields
            .iter()
            .filter(|(key, _)| !SNAPSHOT_EXCLUDED_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        let field = field.into();
        if field != "id" {
            self.fields.insert(field, value.into());
        }
    }

    /// Projects a typed catalog entity into a record.
    pub fn from_entity<T: CatalogEntity>(entity: &T) -> Result<Self, serde_json::Error> {
        let fields = match serde_json::to_value(entity)? {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Ok(Self::new(T::ENTITY_NAME, entity.entity_id(), fields))
    }

    /// Rebuilds a typed catalog entity from this record.
    pub fn to_entity<T: CatalogEntity>(&self) -> Result<T, serde_json::Error> {
        let mut fields = self.fields.clone();
        if let Some(id) = self.id {
            fields.insert("id".to_string(), Value::String(id.to_string()));
        }
        serde_json::from_value(Value::Object(fields))
    }
}

/// Typed catalog entity that can flow through the change engine.
pub trait CatalogEntity: Serialize + DeserializeOwned {
    /// Registry key and history store prefix, e.g. `Product`.
    const ENTITY_NAME: &'static str;

    fn entity_id(&self) -> Option<EntityId>;

    /// Type-specific validation run by the registry edit-view hooks.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Append-only audit row written once per merged edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub entity_id: EntityId,
    /// Unix epoch milliseconds; unique per entity.
    pub timestamp: i64,
    pub user_id: UserId,
    pub original: Option<Snapshot>,
    pub changes: Option<Snapshot>,
}

/// Recursively merges `changes` onto `target`.
///
/// Nested objects merge key by key; every other value, `null` and arrays
/// included, replaces the target value.
pub fn deep_merge(target: &mut Snapshot, changes: &Snapshot) {
    for (key, incoming) in changes {
        match (target.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                deep_merge(existing, nested);
            }
            _ => {
                target.insert(key.clone(), incoming.clone());
            }
        }
    }
}
