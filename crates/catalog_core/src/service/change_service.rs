//! Change staging service (edit resolution layer).
//!
//! # Responsibility
//! - Open or continue changes on behalf of an explicit acting user.
//! - Resolve entity references with staged edits shadowing persisted rows.
//! - Record before/after snapshots into the change's edit list.
//!
//! # Invariants
//! - Within one change a staged edit always shadows the persisted entity.
//! - `original` is captured on first touch and never overwritten.
//! - Anonymous staging is rejected here, not upstream.
//! - Nothing in this service writes catalog entities; only merges do.

use crate::model::change::{
    Change, ChangeId, ChangeSeed, ChangeStatus, Edit, EditKind, InvalidEditShape, StagedEditInput,
};
use crate::model::entity::{EntityId, EntityRecord, HistoryRecord, UserId};
use crate::registry::{EntityRegistryError, EntityTypeRegistry};
use crate::repo::change_repo::{ChangeListQuery, ChangeRepository, RepoError};
use crate::repo::entity_store::EntityStore;
use log::{debug, info};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub type ChangeResult<T> = Result<T, ChangeError>;

/// Coarse error class surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeErrorKind {
    NotFound,
    BadRequest,
    Internal,
}

/// Errors from staging and merge operations.
#[derive(Debug)]
pub enum ChangeError {
    ChangeNotFound(ChangeId),
    EditNotFound {
        entity_name: String,
        entity_id: Option<EntityId>,
    },
    EntityNotFound {
        entity_name: String,
        entity_id: EntityId,
    },
    HistoryStoreNotFound(String),
    /// Malformed staging input.
    BadRequest(String),
    InvalidEdit(InvalidEditShape),
    /// Edit or entity does not name its target id.
    MissingEntityId { entity_name: String },
    NotApproved {
        change_id: ChangeId,
        status: ChangeStatus,
    },
    EntityAlreadyExists {
        entity_name: String,
        entity_id: EntityId,
    },
    InvalidStatusTransition {
        from: ChangeStatus,
        to: ChangeStatus,
    },
    /// Edits were staged into a change that is merging or finished.
    ChangeClosed {
        change_id: ChangeId,
        status: ChangeStatus,
    },
    Registry(EntityRegistryError),
    Repo(RepoError),
}

impl ChangeError {
    pub fn kind(&self) -> ChangeErrorKind {
        match self {
            Self::ChangeNotFound(_)
            | Self::EditNotFound { .. }
            | Self::EntityNotFound { .. }
            | Self::HistoryStoreNotFound(_) => ChangeErrorKind::NotFound,
            Self::BadRequest(_)
            | Self::InvalidEdit(_)
            | Self::MissingEntityId { .. }
            | Self::NotApproved { .. }
            | Self::EntityAlreadyExists { .. }
            | Self::InvalidStatusTransition { .. }
            | Self::ChangeClosed { .. }
            | Self::Registry(_) => ChangeErrorKind::BadRequest,
            Self::Repo(_) => ChangeErrorKind::Internal,
        }
    }

    /// Short stable code used in log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChangeNotFound(_) => "change_not_found",
            Self::EditNotFound { .. } => "edit_not_found",
            Self::EntityNotFound { .. } => "entity_not_found",
            Self::HistoryStoreNotFound(_) => "history_store_not_found",
            Self::BadRequest(_) => "bad_request",
            Self::InvalidEdit(_) => "invalid_edit",
            Self::MissingEntityId { .. } => "missing_entity_id",
            Self::NotApproved { .. } => "not_approved",
            Self::EntityAlreadyExists { .. } => "entity_already_exists",
            Self::InvalidStatusTransition { .. } => "invalid_status_transition",
            Self::ChangeClosed { .. } => "change_closed",
            Self::Registry(_) => "registry",
            Self::Repo(_) => "repo",
        }
    }
}

impl Display for ChangeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChangeNotFound(id) => write!(f, "change not found: {id}"),
            Self::EditNotFound {
                entity_name,
                entity_id: Some(id),
            } => write!(f, "no staged edit for {entity_name} {id}"),
            Self::EditNotFound {
                entity_name,
                entity_id: None,
            } => write!(f, "no staged edit for {entity_name}"),
            Self::EntityNotFound {
                entity_name,
                entity_id,
            } => write!(f, "{entity_name} not found: {entity_id}"),
            Self::HistoryStoreNotFound(store) => write!(f, "history store not found: {store}"),
            Self::BadRequest(message) => write!(f, "bad request: {message}"),
            Self::InvalidEdit(shape) => write!(f, "{shape}"),
            Self::MissingEntityId { entity_name } => {
                write!(f, "{entity_name} edit has no entity id")
            }
            Self::NotApproved { change_id, status } => {
                write!(f, "change {change_id} is {status}, expected approved")
            }
            Self::EntityAlreadyExists {
                entity_name,
                entity_id,
            } => write!(f, "{entity_name} already exists: {entity_id}"),
            Self::InvalidStatusTransition { from, to } => {
                write!(f, "change status cannot move from {from} to {to}")
            }
            Self::ChangeClosed { change_id, status } => {
                write!(f, "change {change_id} is {status} and takes no more edits")
            }
            Self::Registry(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ChangeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidEdit(err) => Some(err),
            Self::Registry(err) => Some(err),
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for ChangeError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::ChangeNotFound(id) => Self::ChangeNotFound(id),
            RepoError::EntityNotFound {
                entity_name,
                entity_id,
            } => Self::EntityNotFound {
                entity_name,
                entity_id,
            },
            RepoError::EntityAlreadyExists {
                entity_name,
                entity_id,
            } => Self::EntityAlreadyExists {
                entity_name,
                entity_id,
            },
            RepoError::HistoryStoreNotFound(store) => Self::HistoryStoreNotFound(store),
            RepoError::InvalidEntityName(name) => {
                Self::BadRequest(format!("invalid entity name `{name}`"))
            }
            other => Self::Repo(other),
        }
    }
}

impl From<EntityRegistryError> for ChangeError {
    fn from(value: EntityRegistryError) -> Self {
        Self::Registry(value)
    }
}

impl From<rusqlite::Error> for ChangeError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(value.into())
    }
}

/// Display projection of one staged edit produced by registry hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct EditView {
    pub entity_name: String,
    pub entity_id: Option<EntityId>,
    pub kind: EditKind,
    /// Validated payload; the original snapshot for deletes.
    pub payload: Value,
}

/// Use-case service for opening changes and staging edits.
pub struct ChangeService<C: ChangeRepository, S: EntityStore> {
    changes: C,
    store: S,
    registry: Arc<EntityTypeRegistry>,
}

impl<C: ChangeRepository, S: EntityStore> ChangeService<C, S> {
    pub fn new(changes: C, store: S, registry: Arc<EntityTypeRegistry>) -> Self {
        Self {
            changes,
            store,
            registry,
        }
    }

    pub fn registry(&self) -> &EntityTypeRegistry {
        &self.registry
    }

    /// Creates and persists a new change owned by `user_id`.
    pub fn create_change(&self, seed: ChangeSeed, user_id: Option<UserId>) -> ChangeResult<Change> {
        let change = seed_change(seed, user_id)?;
        self.changes.create_change(&change)?;
        info!(
            "event=change_create module=change status=ok change_id={} change_status={}",
            change.id(),
            change.status
        );
        Ok(change)
    }

    /// Returns the caller's open change by id, or a new one built from `seed`.
    ///
    /// Exactly one of `change_id` / `seed` must be provided. A seeded change
    /// stays in memory until the first `save_change`, so a staging call that
    /// fails validation leaves nothing behind.
    pub fn resolve_or_create_change(
        &self,
        change_id: Option<ChangeId>,
        seed: Option<ChangeSeed>,
        user_id: Option<UserId>,
    ) -> ChangeResult<Change> {
        match (change_id, seed) {
            (Some(_), Some(_)) => Err(ChangeError::BadRequest(
                "provide either a change id or a new change, not both".to_string(),
            )),
            (None, None) => Err(ChangeError::BadRequest(
                "a change id or a new change is required".to_string(),
            )),
            (Some(id), None) => {
                let change = self.get_change(id, require_user(user_id)?)?;
                ensure_open(&change)?;
                Ok(change)
            }
            (None, Some(seed)) => seed_change(seed, user_id),
        }
    }

    /// Interprets the staged-edit envelope.
    ///
    /// Returns `None` when no staging was requested; otherwise the resolved
    /// change with source additions/removals applied (not yet saved).
    pub fn open_staging(
        &self,
        input: &StagedEditInput,
        user_id: Option<UserId>,
    ) -> ChangeResult<Option<Change>> {
        if !input.requests_staging() {
            if !input.add_sources.is_empty() || !input.remove_sources.is_empty() {
                return Err(ChangeError::BadRequest(
                    "sources can only be changed on a change".to_string(),
                ));
            }
            return Ok(None);
        }

        let mut change =
            self.resolve_or_create_change(input.change_id, input.change.clone(), user_id)?;
        change.add_sources(input.add_sources.iter().copied());
        change.remove_sources(input.remove_sources.iter());
        Ok(Some(change))
    }

    /// Loads a change owned by `user_id`; other owners read as missing.
    pub fn get_change(&self, change_id: ChangeId, user_id: UserId) -> ChangeResult<Change> {
        self.changes
            .get_change_for_user(change_id, user_id)?
            .ok_or(ChangeError::ChangeNotFound(change_id))
    }

    pub fn list_changes(&self, query: &ChangeListQuery) -> ChangeResult<Vec<Change>> {
        Ok(self.changes.list_changes(query)?)
    }

    /// Persists the change, staged edits included; inserts it on first save.
    ///
    /// `merging`, `merged` and merge-time rejection are written only by the
    /// merge engine, so a persisted change that is merging or finished can no
    /// longer be saved here.
    pub fn save_change(&self, change: &mut Change) -> ChangeResult<()> {
        match self.changes.get_change(change.id())? {
            Some(persisted) => {
                let from = persisted.status;
                let to = change.status;
                if from.is_terminal()
                    || from == ChangeStatus::Merging
                    || (to != from && !to.is_caller_settable())
                {
                    return Err(ChangeError::InvalidStatusTransition { from, to });
                }
                change.touch();
                self.changes.save_change(change)?;
            }
            None => {
                ensure_initial_status(change.status)?;
                change.touch();
                self.changes.create_change(change)?;
                info!(
                    "event=change_create module=change status=ok change_id={} change_status={}",
                    change.id(),
                    change.status
                );
            }
        }
        debug!(
            "event=change_save module=change status=ok change_id={} edits={}",
            change.id(),
            change.edits().len()
        );
        Ok(())
    }

    /// Caller-driven status update.
    ///
    /// Merging states are owned by the merge engine and terminal states are
    /// final.
    pub fn update_status(
        &self,
        change_id: ChangeId,
        user_id: UserId,
        status: ChangeStatus,
    ) -> ChangeResult<Change> {
        let mut change = self.get_change(change_id, user_id)?;
        let from = change.status;
        if from.is_terminal() || from == ChangeStatus::Merging || !status.is_caller_settable() {
            return Err(ChangeError::InvalidStatusTransition { from, to: status });
        }

        change.status = status;
        self.save_change(&mut change)?;
        info!(
            "event=change_status module=change status=ok change_id={} from={} to={}",
            change_id, from, status
        );
        Ok(change)
    }

    /// Resolves an entity as seen from inside `change`.
    ///
    /// A staged edit wins over the store and yields an unmanaged record built
    /// from `changes` (or `original` for staged deletes).
    pub fn resolve_entity_reference(
        &self,
        change: &Change,
        entity_name: &str,
        entity_id: EntityId,
    ) -> ChangeResult<EntityRecord> {
        if let Some(record) = staged_record(change, entity_name, entity_id) {
            return Ok(record);
        }

        let entry = self.registry.entry(entity_name)?;
        entry
            .find_by_id(&self.store, entity_id)?
            .ok_or_else(|| ChangeError::EntityNotFound {
                entity_name: entity_name.to_string(),
                entity_id,
            })
    }

    /// Resolves an id against every registered type, staged edits first.
    pub fn resolve_any_entity_reference(
        &self,
        change: &Change,
        entity_id: EntityId,
    ) -> ChangeResult<EntityRecord> {
        let entries = self.registry.resolve(None)?;
        for entry in &entries {
            if let Some(record) = staged_record(change, entry.type_name(), entity_id) {
                return Ok(record);
            }
        }
        for entry in &entries {
            if let Some(record) = entry.find_by_id(&self.store, entity_id)? {
                return Ok(record);
            }
        }
        Err(ChangeError::EntityNotFound {
            entity_name: "entity".to_string(),
            entity_id,
        })
    }

    /// Resolves the entity a caller is about to edit and hands the change
    /// back for `begin_edit` / `record_edit`.
    ///
    /// Store reads always hit the database; the same row may carry different
    /// staged states in different changes.
    pub fn resolve_entity_for_edit(
        &self,
        change: Change,
        entity_name: &str,
        entity_id: EntityId,
    ) -> ChangeResult<(Change, EntityRecord)> {
        let record = self.resolve_entity_reference(&change, entity_name, entity_id)?;
        Ok((change, record))
    }

    /// Captures `original` for the entity on first touch. Idempotent.
    pub fn begin_edit(&self, change: &mut Change, entity: &EntityRecord) -> ChangeResult<()> {
        ensure_open(change)?;
        let entity_id = require_entity_id(entity)?;
        if change.edit(&entity.entity_name, entity_id).is_some() {
            return Ok(());
        }

        change.upsert_edit(Edit {
            entity_name: entity.entity_name.clone(),
            entity_id: Some(entity_id),
            original: Some(entity.snapshot()),
            changes: None,
        });
        debug!(
            "event=edit_begin module=change status=ok change_id={} entity={} entity_id={}",
            change.id(),
            entity.entity_name,
            entity_id
        );
        Ok(())
    }

    /// Overwrites `changes` of the entity's existing edit.
    pub fn record_edit(&self, change: &mut Change, entity: &EntityRecord) -> ChangeResult<()> {
        ensure_open(change)?;
        let entity_id = require_entity_id(entity)?;
        let change_id = change.id();
        let edit = change
            .edit_mut(&entity.entity_name, entity_id)
            .ok_or_else(|| ChangeError::EditNotFound {
                entity_name: entity.entity_name.clone(),
                entity_id: Some(entity_id),
            })?;
        edit.changes = Some(entity.snapshot());
        debug!(
            "event=edit_record module=change status=ok change_id={} entity={} entity_id={}",
            change_id, entity.entity_name, entity_id
        );
        Ok(())
    }

    /// Stages a create for an entity with no persisted state.
    pub fn record_create(&self, change: &mut Change, entity: &EntityRecord) -> ChangeResult<()> {
        ensure_open(change)?;
        if entity.entity_name.trim().is_empty() {
            return Err(ChangeError::BadRequest(
                "entity type name is required to stage a create".to_string(),
            ));
        }

        change.upsert_edit(Edit::create(
            entity.entity_name.clone(),
            entity.id,
            entity.snapshot(),
        ));
        debug!(
            "event=edit_create module=change status=ok change_id={} entity={}",
            change.id(),
            entity.entity_name
        );
        Ok(())
    }

    /// Stages a delete; a staged create of the same entity is discarded
    /// instead.
    pub fn record_delete(&self, change: &mut Change, entity: &EntityRecord) -> ChangeResult<()> {
        ensure_open(change)?;
        let entity_id = require_entity_id(entity)?;
        let staged_create = change
            .edit(&entity.entity_name, entity_id)
            .is_some_and(|edit| edit.original.is_none());
        if staged_create {
            change.discard_edit(entity_id);
            return Ok(());
        }

        self.begin_edit(change, entity)?;
        if let Some(edit) = change.edit_mut(&entity.entity_name, entity_id) {
            edit.changes = None;
        }
        Ok(())
    }

    /// Drops every staged edit for `entity_id`.
    pub fn discard_edit(&self, change: &mut Change, entity_id: EntityId) -> ChangeResult<Vec<Edit>> {
        ensure_open(change)?;
        let removed = change.discard_edit(entity_id);
        if removed.is_empty() {
            return Err(ChangeError::EditNotFound {
                entity_name: "entity".to_string(),
                entity_id: Some(entity_id),
            });
        }
        Ok(removed)
    }

    /// Renders every edit through the registry hooks for display.
    pub fn preview_change(&self, change: &Change) -> ChangeResult<Vec<EditView>> {
        change
            .edits()
            .iter()
            .map(|edit| -> ChangeResult<EditView> {
                let kind = edit.kind().map_err(ChangeError::InvalidEdit)?;
                let payload = match kind {
                    EditKind::Create => self.registry.invoke_create_hook(&edit.entity_name, edit)?,
                    EditKind::Update => self.registry.invoke_update_hook(&edit.entity_name, edit)?,
                    EditKind::Delete => {
                        Value::Object(edit.original.clone().unwrap_or_default())
                    }
                };
                Ok(EditView {
                    entity_name: edit.entity_name.clone(),
                    entity_id: edit.entity_id,
                    kind,
                    payload,
                })
            })
            .collect()
    }

    /// Audit trail of one entity, oldest first.
    pub fn entity_history(
        &self,
        entity_name: &str,
        entity_id: EntityId,
    ) -> ChangeResult<Vec<HistoryRecord>> {
        Ok(self.store.list_history(entity_name, entity_id)?)
    }
}

fn staged_record(change: &Change, entity_name: &str, entity_id: EntityId) -> Option<EntityRecord> {
    let edit = change.edit(entity_name, entity_id)?;
    let fields = edit.changes.as_ref().or(edit.original.as_ref())?.clone();
    Some(EntityRecord::new(entity_name, Some(entity_id), fields))
}

fn require_user(user_id: Option<UserId>) -> ChangeResult<UserId> {
    user_id.ok_or_else(|| ChangeError::BadRequest("an acting user is required".to_string()))
}

fn require_entity_id(entity: &EntityRecord) -> ChangeResult<EntityId> {
    entity.id.ok_or_else(|| ChangeError::MissingEntityId {
        entity_name: entity.entity_name.clone(),
    })
}

fn seed_change(seed: ChangeSeed, user_id: Option<UserId>) -> ChangeResult<Change> {
    let user_id = require_user(user_id)?;
    if let Some(status) = seed.status {
        ensure_initial_status(status)?;
    }
    Ok(Change::from_seed(user_id, seed))
}

fn ensure_initial_status(status: ChangeStatus) -> ChangeResult<()> {
    match status {
        ChangeStatus::Draft | ChangeStatus::Proposed | ChangeStatus::Approved => Ok(()),
        other => Err(ChangeError::BadRequest(format!(
            "a new change cannot start as {other}"
        ))),
    }
}

/// Edits may only land in changes that have not started merging.
fn ensure_open(change: &Change) -> ChangeResult<()> {
    if change.status.is_terminal() || change.status == ChangeStatus::Merging {
        return Err(ChangeError::ChangeClosed {
            change_id: change.id(),
            status: change.status,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ChangeError, ChangeErrorKind};
    use crate::model::change::ChangeStatus;
    use crate::repo::change_repo::RepoError;
    use uuid::Uuid;

    #[test]
    fn repo_errors_map_to_semantic_variants() {
        let id = Uuid::new_v4();
        assert!(matches!(
            ChangeError::from(RepoError::ChangeNotFound(id)),
            ChangeError::ChangeNotFound(found) if found == id
        ));
        assert!(matches!(
            ChangeError::from(RepoError::HistoryStoreNotFound("WidgetHistory".to_string())),
            ChangeError::HistoryStoreNotFound(_)
        ));
        assert_eq!(
            ChangeError::from(RepoError::InvalidEntityName("bad name".to_string())).kind(),
            ChangeErrorKind::BadRequest
        );
        assert_eq!(
            ChangeError::from(RepoError::InvalidData("broken".to_string())).kind(),
            ChangeErrorKind::Internal
        );
    }

    #[test]
    fn errors_carry_stable_codes_and_readable_messages() {
        let err = ChangeError::NotApproved {
            change_id: Uuid::nil(),
            status: ChangeStatus::Draft,
        };
        assert_eq!(err.code(), "not_approved");
        assert!(err.to_string().contains("draft"));
        assert_eq!(
            ChangeError::BadRequest("x".to_string()).kind(),
            ChangeErrorKind::BadRequest
        );

        let closed = ChangeError::ChangeClosed {
            change_id: Uuid::nil(),
            status: ChangeStatus::Merged,
        };
        assert_eq!(closed.code(), "change_closed");
        assert_eq!(closed.kind(), ChangeErrorKind::BadRequest);
        assert!(closed.to_string().contains("merged"));
    }
}
