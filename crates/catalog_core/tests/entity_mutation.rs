use catalog_core::db::open_db_in_memory;
use catalog_core::{
    ChangeError, ChangeErrorKind, ChangeListQuery, ChangeRepository, ChangeSeed, ChangeStatus, EditKind,
    EntityMutationService, EntityRegistryError, EntityStore, EntityTypeRegistry, MergeEngine,
    Snapshot, SqliteChangeRepository, SqliteEntityStore, StagedEditInput,
};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

fn fields(value: Value) -> Snapshot {
    value.as_object().cloned().unwrap()
}

fn mutations(conn: &Connection) -> EntityMutationService<'_> {
    let registry = EntityTypeRegistry::with_catalog_types().unwrap();
    EntityMutationService::try_new(conn, Arc::new(registry)).unwrap()
}

fn store(conn: &Connection) -> SqliteEntityStore<'_> {
    SqliteEntityStore::try_new(conn).unwrap()
}

fn new_change(status: Option<ChangeStatus>, apply: bool) -> StagedEditInput {
    StagedEditInput {
        change: Some(ChangeSeed {
            status,
            ..ChangeSeed::default()
        }),
        apply,
        ..StagedEditInput::default()
    }
}

fn existing_change(change_id: Uuid) -> StagedEditInput {
    StagedEditInput {
        change_id: Some(change_id),
        ..StagedEditInput::default()
    }
}

#[test]
fn direct_mutations_write_without_history() {
    let conn = open_db_in_memory().unwrap();
    let mutations = mutations(&conn);
    let direct = StagedEditInput::default();

    let created = mutations
        .create_entity("Process", fields(json!({ "name": "Milling" })), &direct, None)
        .unwrap();
    assert!(created.change.is_none());
    let id = created.entity.unwrap().id.unwrap();

    let updated = mutations
        .update_entity(
            "Process",
            id,
            fields(json!({ "description": "CNC" })),
            &direct,
            None,
        )
        .unwrap();
    let updated = updated.entity.unwrap();
    assert_eq!(updated.get_str("name"), Some("Milling"));
    assert_eq!(updated.get_str("description"), Some("CNC"));

    let live = store(&conn).find_entity("Process", id).unwrap().unwrap();
    assert_eq!(live.get_str("description"), Some("CNC"));

    mutations.delete_entity("Process", id, &direct, None).unwrap();
    assert!(store(&conn).find_entity("Process", id).unwrap().is_none());
    assert!(store(&conn).list_history("Process", id).unwrap().is_empty());

    let err = mutations
        .delete_entity("Process", id, &direct, None)
        .unwrap_err();
    assert_eq!(err.kind(), ChangeErrorKind::NotFound);
}

#[test]
fn approved_staged_create_with_apply_merges_immediately() {
    let conn = open_db_in_memory().unwrap();
    let mutations = mutations(&conn);
    let user = Uuid::new_v4();

    let outcome = mutations
        .create_entity(
            "Process",
            fields(json!({ "name": "Welding" })),
            &new_change(Some(ChangeStatus::Approved), true),
            Some(user),
        )
        .unwrap();

    assert!(outcome.merged);
    let change = outcome.change.unwrap();
    assert_eq!(change.status, ChangeStatus::Merged);
    let entity = outcome.entity.unwrap();
    let id = entity.id.unwrap();
    assert_eq!(entity.get_str("name"), Some("Welding"));

    let history = store(&conn).list_history("Process", id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].user_id, user);
}

#[test]
fn staged_update_leaves_store_untouched_until_merge() {
    let conn = open_db_in_memory().unwrap();
    let mutations = mutations(&conn);
    let user = Uuid::new_v4();

    let created = mutations
        .create_entity(
            "Component",
            fields(json!({ "name": "Seat" })),
            &StagedEditInput::default(),
            None,
        )
        .unwrap();
    let id = created.entity.unwrap().id.unwrap();

    let staged = mutations
        .update_entity(
            "Component",
            id,
            fields(json!({ "name": "Padded seat" })),
            &new_change(None, true),
            Some(user),
        )
        .unwrap();
    assert!(!staged.merged);
    assert_eq!(
        staged.entity.unwrap().get_str("name"),
        Some("Padded seat")
    );
    let change = staged.change.unwrap();
    assert_eq!(change.status, ChangeStatus::Draft);
    assert_eq!(change.edit("Component", id).unwrap().kind().unwrap(), EditKind::Update);

    let live = store(&conn).find_entity("Component", id).unwrap().unwrap();
    assert_eq!(live.get_str("name"), Some("Seat"));

    let mut persisted = SqliteChangeRepository::try_new(&conn)
        .unwrap()
        .get_change(change.id())
        .unwrap()
        .unwrap();
    assert_eq!(persisted.edits(), change.edits());

    persisted.status = ChangeStatus::Approved;
    SqliteChangeRepository::try_new(&conn)
        .unwrap()
        .save_change(&persisted)
        .unwrap();
    MergeEngine::try_new(&conn)
        .unwrap()
        .merge_by_id(change.id())
        .unwrap();

    let live = store(&conn).find_entity("Component", id).unwrap().unwrap();
    assert_eq!(live.get_str("name"), Some("Padded seat"));
}

#[test]
fn updating_a_staged_create_keeps_a_single_create_edit() {
    let conn = open_db_in_memory().unwrap();
    let mutations = mutations(&conn);
    let user = Uuid::new_v4();

    let created = mutations
        .create_entity(
            "Product",
            fields(json!({ "name": "Chair" })),
            &new_change(None, false),
            Some(user),
        )
        .unwrap();
    let change_id = created.change.unwrap().id();
    let id = created.entity.unwrap().id.unwrap();

    let updated = mutations
        .update_entity(
            "Product",
            id,
            fields(json!({ "description": "Oak" })),
            &existing_change(change_id),
            Some(user),
        )
        .unwrap();

    let change = updated.change.unwrap();
    assert_eq!(change.edits().len(), 1);
    let edit = change.edit("Product", id).unwrap();
    assert_eq!(edit.kind().unwrap(), EditKind::Create);
    assert_eq!(
        edit.changes,
        Some(fields(json!({ "name": "Chair", "description": "Oak" })))
    );
    assert!(store(&conn).find_entity("Product", id).unwrap().is_none());

    let deleted = mutations
        .delete_entity("Product", id, &existing_change(change_id), Some(user))
        .unwrap();
    assert!(deleted.change.unwrap().edits().is_empty());
    assert!(deleted.entity.is_none());
}

#[test]
fn staging_rejects_anonymous_users_and_invalid_payloads() {
    let conn = open_db_in_memory().unwrap();
    let mutations = mutations(&conn);

    let err = mutations
        .create_entity(
            "Process",
            fields(json!({ "name": "Milling" })),
            &new_change(None, false),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, ChangeError::BadRequest(_)));

    let err = mutations
        .create_entity(
            "Process",
            fields(json!({ "name": "  " })),
            &StagedEditInput::default(),
            None,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ChangeError::Registry(EntityRegistryError::HookRejected { .. })
    ));

    let err = mutations
        .create_entity(
            "Gadget",
            fields(json!({ "name": "G" })),
            &StagedEditInput::default(),
            None,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ChangeError::Registry(EntityRegistryError::UnknownType(_))
    ));
    assert_eq!(err.kind(), ChangeErrorKind::BadRequest);
}

#[test]
fn merged_change_takes_no_further_staged_edits() {
    let conn = open_db_in_memory().unwrap();
    let mutations = mutations(&conn);
    let user = Uuid::new_v4();

    let merged = mutations
        .create_entity(
            "Process",
            fields(json!({ "name": "Anodizing" })),
            &new_change(Some(ChangeStatus::Approved), true),
            Some(user),
        )
        .unwrap();
    let change_id = merged.change.unwrap().id();

    let err = mutations
        .create_entity(
            "Process",
            fields(json!({ "name": "Plating" })),
            &existing_change(change_id),
            Some(user),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ChangeError::ChangeClosed {
            status: ChangeStatus::Merged,
            ..
        }
    ));
    assert_eq!(err.kind(), ChangeErrorKind::BadRequest);

    let persisted = SqliteChangeRepository::try_new(&conn)
        .unwrap()
        .get_change(change_id)
        .unwrap()
        .unwrap();
    assert_eq!(persisted.status, ChangeStatus::Merged);
    assert_eq!(persisted.edits().len(), 1);
}

#[test]
fn rejected_staged_payload_leaves_no_change_behind() {
    let conn = open_db_in_memory().unwrap();
    let mutations = mutations(&conn);
    let user = Uuid::new_v4();

    let err = mutations
        .create_entity(
            "Process",
            fields(json!({ "name": "  " })),
            &new_change(None, false),
            Some(user),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ChangeError::Registry(EntityRegistryError::HookRejected { .. })
    ));

    let changes = SqliteChangeRepository::try_new(&conn)
        .unwrap()
        .list_changes(&ChangeListQuery {
            user_id: Some(user),
            ..ChangeListQuery::default()
        })
        .unwrap();
    assert!(changes.is_empty());
}

#[test]
fn update_after_staged_delete_is_refused() {
    let conn = open_db_in_memory().unwrap();
    let mutations = mutations(&conn);
    let user = Uuid::new_v4();

    let created = mutations
        .create_entity(
            "Component",
            fields(json!({ "name": "Hinge" })),
            &StagedEditInput::default(),
            None,
        )
        .unwrap();
    let id = created.entity.unwrap().id.unwrap();

    let deleted = mutations
        .delete_entity("Component", id, &new_change(None, false), Some(user))
        .unwrap();
    let change_id = deleted.change.unwrap().id();

    let err = mutations
        .update_entity(
            "Component",
            id,
            fields(json!({ "name": "Brass hinge" })),
            &existing_change(change_id),
            Some(user),
        )
        .unwrap_err();
    assert!(matches!(err, ChangeError::BadRequest(_)));

    let persisted = SqliteChangeRepository::try_new(&conn)
        .unwrap()
        .get_change(change_id)
        .unwrap()
        .unwrap();
    let edit = persisted.edit("Component", id).unwrap();
    assert_eq!(edit.kind().unwrap(), EditKind::Delete);
    assert_eq!(edit.original, Some(fields(json!({ "name": "Hinge" }))));
}
