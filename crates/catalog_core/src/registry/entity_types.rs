//! In-process registry of editable entity types.

use crate::model::catalog::{Component, Process, Product};
use crate::model::change::Edit;
use crate::model::entity::{deep_merge, CatalogEntity, EntityId, EntityRecord};
use crate::repo::change_repo::RepoResult;
use crate::repo::entity_store::EntityStore;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

static ENTITY_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][A-Za-z0-9]{0,63}$").expect("valid entity name regex"));

/// Loads one live entity of a registered type.
pub type LookupFn =
    Arc<dyn Fn(&dyn EntityStore, EntityId) -> RepoResult<Option<EntityRecord>> + Send + Sync>;

/// Materializes an edit into a validated display payload.
pub type EditHookFn = Arc<dyn Fn(&Edit) -> Result<Value, String> + Send + Sync>;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRegistryError {
    InvalidTypeName(String),
    DuplicateTypeName(String),
    UnknownType(String),
    /// A registered hook refused the edit.
    HookRejected { type_name: String, message: String },
}

impl Display for EntityRegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTypeName(name) => write!(f, "entity type name is invalid: {name}"),
            Self::DuplicateTypeName(name) => {
                write!(f, "entity type already registered: {name}")
            }
            Self::UnknownType(name) => write!(f, "entity type not registered: {name}"),
            Self::HookRejected { type_name, message } => {
                write!(f, "{type_name} edit rejected: {message}")
            }
        }
    }
}

impl Error for EntityRegistryError {}

/// One registered entity type.
#[derive(Clone)]
pub struct EntityTypeEntry {
    type_name: String,
    lookup: LookupFn,
    create_hook: EditHookFn,
    update_hook: EditHookFn,
}

impl EntityTypeEntry {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Runs the registered lookup against `store`.
    pub fn find_by_id(
        &self,
        store: &dyn EntityStore,
        entity_id: EntityId,
    ) -> RepoResult<Option<EntityRecord>> {
        (self.lookup)(store, entity_id)
    }
}

impl Debug for EntityTypeEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityTypeEntry")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Registry keyed by entity type name.
///
/// Built once at startup; new editable types are added by registering
/// entries, never by changing the merge engine.
#[derive(Debug, Default, Clone)]
pub struct EntityTypeRegistry {
    entries: BTreeMap<String, EntityTypeEntry>,
}

impl EntityTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in catalog types.
    pub fn with_catalog_types() -> Result<Self, EntityRegistryError> {
        let mut registry = Self::new();
        registry.register_entity::<Product>()?;
        registry.register_entity::<Component>()?;
        registry.register_entity::<Process>()?;
        Ok(registry)
    }

    /// Registers one entity type with explicit lookup and hooks.
    pub fn register(
        &mut self,
        type_name: &str,
        lookup: impl Fn(&dyn EntityStore, EntityId) -> RepoResult<Option<EntityRecord>>
            + Send
            + Sync
            + 'static,
        create_hook: impl Fn(&Edit) -> Result<Value, String> + Send + Sync + 'static,
        update_hook: impl Fn(&Edit) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Result<(), EntityRegistryError> {
        let type_name = type_name.trim();
        if !is_valid_entity_name(type_name) {
            return Err(EntityRegistryError::InvalidTypeName(type_name.to_string()));
        }
        if self.entries.contains_key(type_name) {
            return Err(EntityRegistryError::DuplicateTypeName(
                type_name.to_string(),
            ));
        }

        self.entries.insert(
            type_name.to_string(),
            EntityTypeEntry {
                type_name: type_name.to_string(),
                lookup: Arc::new(lookup),
                create_hook: Arc::new(create_hook),
                update_hook: Arc::new(update_hook),
            },
        );
        Ok(())
    }

    /// Registers a typed entity with store lookup and serde-validated hooks.
    pub fn register_entity<T: CatalogEntity + 'static>(
        &mut self,
    ) -> Result<(), EntityRegistryError> {
        self.register(
            T::ENTITY_NAME,
            |store, entity_id| store.find_entity(T::ENTITY_NAME, entity_id),
            typed_create_view::<T>,
            typed_update_view::<T>,
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns sorted registered type names.
    pub fn type_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Resolves one entry by name, or every entry when `type_name` is `None`.
    pub fn resolve(
        &self,
        type_name: Option<&str>,
    ) -> Result<Vec<&EntityTypeEntry>, EntityRegistryError> {
        match type_name {
            Some(name) => self.entry(name).map(|entry| vec![entry]),
            None => Ok(self.entries.values().collect()),
        }
    }

    pub fn entry(&self, type_name: &str) -> Result<&EntityTypeEntry, EntityRegistryError> {
        let name = type_name.trim();
        self.entries
            .get(name)
            .ok_or_else(|| EntityRegistryError::UnknownType(name.to_string()))
    }

    pub fn invoke_create_hook(
        &self,
        type_name: &str,
        edit: &Edit,
    ) -> Result<Value, EntityRegistryError> {
        let entry = self.entry(type_name)?;
        (entry.create_hook)(edit).map_err(|message| EntityRegistryError::HookRejected {
            type_name: entry.type_name.clone(),
            message,
        })
    }

    pub fn invoke_update_hook(
        &self,
        type_name: &str,
        edit: &Edit,
    ) -> Result<Value, EntityRegistryError> {
        let entry = self.entry(type_name)?;
        (entry.update_hook)(edit).map_err(|message| EntityRegistryError::HookRejected {
            type_name: entry.type_name.clone(),
            message,
        })
    }
}

/// Whether `value` can name an entity type and its history table.
pub fn is_valid_entity_name(value: &str) -> bool {
    ENTITY_NAME_RE.is_match(value)
}

fn typed_create_view<T: CatalogEntity>(edit: &Edit) -> Result<Value, String> {
    let changes = edit
        .changes
        .clone()
        .ok_or_else(|| "create edit carries no changes".to_string())?;
    render_typed::<T>(edit, changes)
}

fn typed_update_view<T: CatalogEntity>(edit: &Edit) -> Result<Value, String> {
    let mut merged = edit
        .original
        .clone()
        .ok_or_else(|| "update edit carries no original".to_string())?;
    if let Some(changes) = &edit.changes {
        deep_merge(&mut merged, changes);
    }
    render_typed::<T>(edit, merged)
}

fn render_typed<T: CatalogEntity>(
    edit: &Edit,
    fields: serde_json::Map<String, Value>,
) -> Result<Value, String> {
    let record = EntityRecord::new(T::ENTITY_NAME, edit.entity_id, fields);
    let entity: T = record.to_entity().map_err(|err| err.to_string())?;
    entity.validate()?;
    serde_json::to_value(&entity).map_err(|err| err.to_string())
}
