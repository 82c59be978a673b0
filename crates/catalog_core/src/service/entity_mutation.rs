//! Per-entity create/update/delete flow with optional change staging.
//!
//! # Responsibility
//! - Write straight to the entity store when no change is requested.
//! - Otherwise stage the mutation into a change, save it, and merge it when
//!   the caller asked to apply an approved change.
//!
//! # Invariants
//! - Registry hooks validate every payload before it is stored or staged.
//! - Staged mutations never touch entity rows unless a merge runs.
//! - A staged delete is final within its change; later updates are refused.

use crate::model::change::{Change, Edit, EditKind, StagedEditInput};
use crate::model::entity::{deep_merge, EntityId, EntityRecord, Snapshot, UserId};
use crate::registry::EntityTypeRegistry;
use crate::repo::change_repo::SqliteChangeRepository;
use crate::repo::entity_store::{EntityStore, SqliteEntityStore};
use crate::service::change_service::{ChangeError, ChangeResult, ChangeService};
use crate::service::merge_engine::MergeEngine;
use log::info;
use rusqlite::Connection;
use std::sync::Arc;

/// Result of one mutation call.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    /// Live entity after a direct write or merge; the staged view otherwise.
    /// `None` after a delete.
    pub entity: Option<EntityRecord>,
    /// Change the mutation was staged into, when staging was requested.
    pub change: Option<Change>,
    pub merged: bool,
}

/// Entry point for entity mutations that may go through a change.
pub struct EntityMutationService<'conn> {
    conn: &'conn Connection,
    registry: Arc<EntityTypeRegistry>,
}

impl<'conn> EntityMutationService<'conn> {
    pub fn try_new(conn: &'conn Connection, registry: Arc<EntityTypeRegistry>) -> ChangeResult<Self> {
        MergeEngine::try_new(conn)?;
        Ok(Self { conn, registry })
    }

    pub fn create_entity(
        &self,
        entity_name: &str,
        fields: Snapshot,
        input: &StagedEditInput,
        user_id: Option<UserId>,
    ) -> ChangeResult<MutationOutcome> {
        let record = EntityRecord::with_new_id(entity_name, fields);
        let service = self.change_service();

        let Some(mut change) = service.open_staging(input, user_id)? else {
            let preview = Edit::create(entity_name, record.id, record.snapshot());
            self.registry.invoke_create_hook(entity_name, &preview)?;
            self.store().insert_entity(&record)?;
            info!(
                "event=entity_create module=mutation status=ok entity={} staged=false",
                entity_name
            );
            return Ok(MutationOutcome {
                entity: Some(record),
                change: None,
                merged: false,
            });
        };

        service.record_create(&mut change, &record)?;
        let entity_id = require_id(&record)?;
        self.validate_staged(&change, entity_name, entity_id)?;
        self.finish_staged(&service, change, input.apply, entity_name, entity_id, Some(record))
    }

    /// Deep-merges `changes` onto the entity.
    pub fn update_entity(
        &self,
        entity_name: &str,
        entity_id: EntityId,
        changes: Snapshot,
        input: &StagedEditInput,
        user_id: Option<UserId>,
    ) -> ChangeResult<MutationOutcome> {
        let service = self.change_service();

        let Some(change) = service.open_staging(input, user_id)? else {
            let live = self.find_live(entity_name, entity_id)?;
            let original = live.snapshot();
            let mut fields = original.clone();
            deep_merge(&mut fields, &changes);
            let preview = Edit {
                entity_name: entity_name.to_string(),
                entity_id: Some(entity_id),
                original: Some(original),
                changes: Some(fields.clone()),
            };
            self.registry.invoke_update_hook(entity_name, &preview)?;

            let updated = EntityRecord::new(entity_name, Some(entity_id), fields);
            self.store().update_entity(&updated)?;
            info!(
                "event=entity_update module=mutation status=ok entity={} entity_id={} staged=false",
                entity_name, entity_id
            );
            return Ok(MutationOutcome {
                entity: Some(updated),
                change: None,
                merged: false,
            });
        };

        let (mut change, mut record) =
            service.resolve_entity_for_edit(change, entity_name, entity_id)?;
        let staged = change.edit(entity_name, entity_id);
        if staged.is_some_and(|edit| matches!(edit.kind(), Ok(EditKind::Delete))) {
            return Err(ChangeError::BadRequest(format!(
                "{entity_name} {entity_id} is staged for deletion in change {}",
                change.id()
            )));
        }
        let staged_create = staged.is_some_and(|edit| edit.original.is_none());

        if staged_create {
            deep_merge(&mut record.fields, &changes);
            service.record_create(&mut change, &record)?;
        } else {
            service.begin_edit(&mut change, &record)?;
            deep_merge(&mut record.fields, &changes);
            service.record_edit(&mut change, &record)?;
        }
        self.validate_staged(&change, entity_name, entity_id)?;
        self.finish_staged(&service, change, input.apply, entity_name, entity_id, Some(record))
    }

    pub fn delete_entity(
        &self,
        entity_name: &str,
        entity_id: EntityId,
        input: &StagedEditInput,
        user_id: Option<UserId>,
    ) -> ChangeResult<MutationOutcome> {
        let service = self.change_service();

        let Some(change) = service.open_staging(input, user_id)? else {
            self.find_live(entity_name, entity_id)?;
            self.store().delete_entity(entity_name, entity_id)?;
            info!(
                "event=entity_delete module=mutation status=ok entity={} entity_id={} staged=false",
                entity_name, entity_id
            );
            return Ok(MutationOutcome {
                entity: None,
                change: None,
                merged: false,
            });
        };

        let (mut change, record) = service.resolve_entity_for_edit(change, entity_name, entity_id)?;
        service.record_delete(&mut change, &record)?;
        self.finish_staged(&service, change, input.apply, entity_name, entity_id, None)
    }

    fn finish_staged(
        &self,
        service: &ChangeService<SqliteChangeRepository<'conn>, SqliteEntityStore<'conn>>,
        mut change: Change,
        apply: bool,
        entity_name: &str,
        entity_id: EntityId,
        staged: Option<EntityRecord>,
    ) -> ChangeResult<MutationOutcome> {
        service.save_change(&mut change)?;
        let merged = MergeEngine::new(self.conn).check_auto_merge(&mut change, apply)?;
        let entity = if merged {
            self.store().find_entity(entity_name, entity_id)?
        } else {
            staged
        };

        info!(
            "event=entity_stage module=mutation status=ok entity={} entity_id={} change_id={} merged={}",
            entity_name,
            entity_id,
            change.id(),
            merged
        );
        Ok(MutationOutcome {
            entity,
            change: Some(change),
            merged,
        })
    }

    fn validate_staged(
        &self,
        change: &Change,
        entity_name: &str,
        entity_id: EntityId,
    ) -> ChangeResult<()> {
        let edit = change
            .edit(entity_name, entity_id)
            .ok_or_else(|| ChangeError::EditNotFound {
                entity_name: entity_name.to_string(),
                entity_id: Some(entity_id),
            })?;
        if edit.original.is_none() {
            self.registry.invoke_create_hook(entity_name, edit)?;
        } else {
            self.registry.invoke_update_hook(entity_name, edit)?;
        }
        Ok(())
    }

    fn find_live(&self, entity_name: &str, entity_id: EntityId) -> ChangeResult<EntityRecord> {
        self.registry
            .entry(entity_name)?
            .find_by_id(&self.store(), entity_id)?
            .ok_or_else(|| ChangeError::EntityNotFound {
                entity_name: entity_name.to_string(),
                entity_id,
            })
    }

    fn change_service(&self) -> ChangeService<SqliteChangeRepository<'conn>, SqliteEntityStore<'conn>> {
        ChangeService::new(
            SqliteChangeRepository::new(self.conn),
            SqliteEntityStore::new(self.conn),
            Arc::clone(&self.registry),
        )
    }

    fn store(&self) -> SqliteEntityStore<'conn> {
        SqliteEntityStore::new(self.conn)
    }
}

fn require_id(record: &EntityRecord) -> ChangeResult<EntityId> {
    record.id.ok_or_else(|| ChangeError::MissingEntityId {
        entity_name: record.entity_name.clone(),
    })
}
