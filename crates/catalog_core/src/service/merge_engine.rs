//! Merge engine for approved changes.
//!
//! # Responsibility
//! - Apply every staged edit of an approved change inside one transaction.
//! - Append exactly one history row per applied edit.
//! - Finalize the change as `merged`, or `rejected` on the first failure.
//!
//! # Invariants
//! - A merge is all-or-nothing: any failed edit rolls back every entity write.
//! - The rejection write happens after rollback, on the bare connection.
//! - Only one merge can hold a change; the `approved -> merging` claim is the
//!   gate.

use crate::model::change::{Change, ChangeId, ChangeStatus, Edit, EditKind};
use crate::model::entity::{deep_merge, history_store_name, EntityRecord, HistoryRecord};
use crate::model::now_epoch_ms;
use crate::repo::change_repo::{ChangeRepository, SqliteChangeRepository};
use crate::repo::entity_store::{EntityStore, SqliteEntityStore};
use crate::service::change_service::{ChangeError, ChangeResult};
use log::{debug, error, info, warn};
use rusqlite::{Connection, Transaction, TransactionBehavior};

/// Applies approved changes to the entity store.
pub struct MergeEngine<'conn> {
    conn: &'conn Connection,
}

impl<'conn> MergeEngine<'conn> {
    /// Constructs an engine after checking change and entity tables.
    pub fn try_new(conn: &'conn Connection) -> ChangeResult<Self> {
        SqliteChangeRepository::try_new(conn)?;
        SqliteEntityStore::try_new(conn)?;
        Ok(Self { conn })
    }

    pub(crate) fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Loads a persisted change and merges it.
    pub fn merge_by_id(&self, change_id: ChangeId) -> ChangeResult<Change> {
        let mut change = SqliteChangeRepository::new(self.conn)
            .get_change(change_id)?
            .ok_or(ChangeError::ChangeNotFound(change_id))?;
        self.merge(&mut change)?;
        Ok(change)
    }

    /// Merges `change` as one unit.
    ///
    /// On failure the change is left `rejected` both in memory and in the
    /// store, and the first edit error is returned.
    pub fn merge(&self, change: &mut Change) -> ChangeResult<()> {
        if change.status != ChangeStatus::Approved {
            return Err(ChangeError::NotApproved {
                change_id: change.id(),
                status: change.status,
            });
        }

        info!(
            "event=change_merge module=merge status=start change_id={} edits={}",
            change.id(),
            change.edits().len()
        );

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        if !SqliteChangeRepository::new(&tx).claim_for_merge(change.id())? {
            tx.rollback()?;
            return Err(self.claim_failure(change.id()));
        }
        change.status = ChangeStatus::Merging;

        let applied = apply_edits(&tx, change).and_then(|applied| {
            change.status = ChangeStatus::Merged;
            change.touch();
            SqliteChangeRepository::new(&tx).save_change(change)?;
            Ok(applied)
        });

        match applied {
            Ok(applied) => match tx.commit() {
                Ok(()) => {
                    info!(
                        "event=change_merge module=merge status=ok change_id={} applied={}",
                        change.id(),
                        applied
                    );
                    Ok(())
                }
                Err(err) => {
                    let err = ChangeError::from(err);
                    self.reject(change, &err);
                    Err(err)
                }
            },
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    error!(
                        "event=change_merge module=merge status=error change_id={} stage=rollback error={}",
                        change.id(),
                        rollback_err
                    );
                }
                self.reject(change, &err);
                Err(err)
            }
        }
    }

    /// Merges right away when the caller asked for it and the change is
    /// approved. Returns whether a merge ran.
    pub fn check_auto_merge(&self, change: &mut Change, apply: bool) -> ChangeResult<bool> {
        if !apply || change.status != ChangeStatus::Approved {
            return Ok(false);
        }
        self.merge(change)?;
        Ok(true)
    }

    fn claim_failure(&self, change_id: ChangeId) -> ChangeError {
        match SqliteChangeRepository::new(self.conn).get_change(change_id) {
            Ok(Some(persisted)) => {
                warn!(
                    "event=change_merge module=merge status=error change_id={} error_code=claim_failed persisted_status={}",
                    change_id, persisted.status
                );
                ChangeError::NotApproved {
                    change_id,
                    status: persisted.status,
                }
            }
            Ok(None) => ChangeError::ChangeNotFound(change_id),
            Err(err) => err.into(),
        }
    }

    fn reject(&self, change: &mut Change, cause: &ChangeError) {
        change.status = ChangeStatus::Rejected;
        change.touch();
        warn!(
            "event=change_merge module=merge status=error change_id={} error_code={}",
            change.id(),
            cause.code()
        );
        if let Err(err) = SqliteChangeRepository::new(self.conn).save_change(change) {
            error!(
                "event=change_reject module=merge status=error change_id={} error={}",
                change.id(),
                err
            );
        }
    }
}

fn apply_edits(conn: &Connection, change: &Change) -> ChangeResult<usize> {
    let store = SqliteEntityStore::new(conn);
    for edit in change.edits() {
        apply_edit(&store, change, edit)?;
    }
    Ok(change.edits().len())
}

fn apply_edit(store: &impl EntityStore, change: &Change, edit: &Edit) -> ChangeResult<()> {
    let entity_id = edit.entity_id.ok_or_else(|| ChangeError::MissingEntityId {
        entity_name: edit.entity_name.clone(),
    })?;
    let live = store.find_entity(&edit.entity_name, entity_id)?;
    let kind = edit.kind().map_err(ChangeError::InvalidEdit)?;
    let not_found = || ChangeError::EntityNotFound {
        entity_name: edit.entity_name.clone(),
        entity_id,
    };

    match kind {
        EditKind::Create => {
            if live.is_some() {
                return Err(ChangeError::EntityAlreadyExists {
                    entity_name: edit.entity_name.clone(),
                    entity_id,
                });
            }
            store.insert_entity(&EntityRecord::new(
                edit.entity_name.as_str(),
                Some(entity_id),
                edit.changes.clone().unwrap_or_default(),
            ))?;
        }
        EditKind::Update => {
            let mut fields = live.ok_or_else(not_found)?.snapshot();
            if edit.original.as_ref() != Some(&fields) {
                warn!(
                    "event=edit_apply module=merge status=diverged change_id={} entity={} entity_id={}",
                    change.id(),
                    edit.entity_name,
                    entity_id
                );
            }
            if let Some(changes) = &edit.changes {
                deep_merge(&mut fields, changes);
            }
            store.update_entity(&EntityRecord::new(
                edit.entity_name.as_str(),
                Some(entity_id),
                fields,
            ))?;
        }
        EditKind::Delete => {
            if live.is_none() {
                return Err(not_found());
            }
            store.delete_entity(&edit.entity_name, entity_id)?;
        }
    }

    let stored = store.append_history(
        &history_store_name(&edit.entity_name),
        &HistoryRecord {
            entity_id,
            timestamp: now_epoch_ms(),
            user_id: change.user_id(),
            original: edit.original.clone(),
            changes: edit.changes.clone(),
        },
    )?;
    debug!(
        "event=edit_apply module=merge status=ok change_id={} entity={} entity_id={} kind={:?} timestamp={}",
        change.id(),
        edit.entity_name,
        entity_id,
        kind,
        stored.timestamp
    );
    Ok(())
}
