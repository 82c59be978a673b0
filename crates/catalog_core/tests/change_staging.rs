use catalog_core::db::open_db_in_memory;
use catalog_core::{
    Change, ChangeError, ChangeErrorKind, ChangeListQuery, ChangeSeed, ChangeService,
    ChangeStatus, EditKind, EntityRecord, EntityStore, EntityTypeRegistry, Snapshot,
    SqliteChangeRepository, SqliteEntityStore, StagedEditInput,
};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

type Service<'conn> = ChangeService<SqliteChangeRepository<'conn>, SqliteEntityStore<'conn>>;

fn fields(value: Value) -> Snapshot {
    value.as_object().cloned().unwrap()
}

fn registry() -> Arc<EntityTypeRegistry> {
    let mut registry = EntityTypeRegistry::with_catalog_types().unwrap();
    registry
        .register(
            "Widget",
            |store, id| store.find_entity("Widget", id),
            |edit| Ok(Value::Object(edit.changes.clone().unwrap_or_default())),
            |edit| Ok(Value::Object(edit.changes.clone().unwrap_or_default())),
        )
        .unwrap();
    Arc::new(registry)
}

fn service(conn: &Connection) -> Service<'_> {
    ChangeService::new(
        SqliteChangeRepository::try_new(conn).unwrap(),
        SqliteEntityStore::try_new(conn).unwrap(),
        registry(),
    )
}

fn insert_widget(conn: &Connection, name: &str) -> EntityRecord {
    let record = EntityRecord::with_new_id("Widget", fields(json!({ "name": name })));
    SqliteEntityStore::try_new(conn)
        .unwrap()
        .insert_entity(&record)
        .unwrap();
    record
}

fn draft(service: &Service<'_>, user: Uuid) -> Change {
    service.create_change(ChangeSeed::default(), Some(user)).unwrap()
}

#[test]
fn staged_edit_shadows_persisted_entity_only_inside_its_change() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let user = Uuid::new_v4();
    let widget = insert_widget(&conn, "A");
    let id = widget.id.unwrap();

    let mut change = draft(&service, user);
    let other = draft(&service, user);

    let (returned, mut record) = service.resolve_entity_for_edit(change, "Widget", id).unwrap();
    change = returned;
    assert_eq!(record.get_str("name"), Some("A"));

    service.begin_edit(&mut change, &record).unwrap();
    record.set("name", "B");
    service.record_edit(&mut change, &record).unwrap();

    let staged = service.resolve_entity_reference(&change, "Widget", id).unwrap();
    assert_eq!(staged.get_str("name"), Some("B"));

    let elsewhere = service.resolve_entity_reference(&other, "Widget", id).unwrap();
    assert_eq!(elsewhere.get_str("name"), Some("A"));

    let live = SqliteEntityStore::try_new(&conn)
        .unwrap()
        .find_entity("Widget", id)
        .unwrap()
        .unwrap();
    assert_eq!(live.get_str("name"), Some("A"));
}

#[test]
fn begin_edit_is_idempotent_and_keeps_first_original() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let mut change = draft(&service, Uuid::new_v4());
    let mut record = insert_widget(&conn, "A");

    service.begin_edit(&mut change, &record).unwrap();
    record.set("name", "changed before second begin");
    service.begin_edit(&mut change, &record).unwrap();

    assert_eq!(change.edits().len(), 1);
    let edit = &change.edits()[0];
    assert_eq!(edit.original, Some(fields(json!({ "name": "A" }))));
    assert_eq!(edit.changes, None);
}

#[test]
fn two_touches_collapse_into_one_edit() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let mut change = draft(&service, Uuid::new_v4());
    let widget = insert_widget(&conn, "A");
    let id = widget.id.unwrap();

    for name in ["B", "C"] {
        let (returned, mut record) =
            service.resolve_entity_for_edit(change, "Widget", id).unwrap();
        change = returned;
        service.begin_edit(&mut change, &record).unwrap();
        record.set("name", name);
        service.record_edit(&mut change, &record).unwrap();
    }

    assert_eq!(change.edits().len(), 1);
    let edit = change.edit("Widget", id).unwrap();
    assert_eq!(edit.original, Some(fields(json!({ "name": "A" }))));
    assert_eq!(edit.changes, Some(fields(json!({ "name": "C" }))));
    assert_eq!(edit.kind().unwrap(), EditKind::Update);
}

#[test]
fn malformed_staging_input_is_a_bad_request() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let user = Uuid::new_v4();
    let existing = draft(&service, user);

    let both = service
        .resolve_or_create_change(Some(existing.id()), Some(ChangeSeed::default()), Some(user))
        .unwrap_err();
    assert_eq!(both.kind(), ChangeErrorKind::BadRequest);

    let neither = service
        .resolve_or_create_change(None, None, Some(user))
        .unwrap_err();
    assert_eq!(neither.kind(), ChangeErrorKind::BadRequest);

    let anonymous = service
        .resolve_or_create_change(None, Some(ChangeSeed::default()), None)
        .unwrap_err();
    assert!(matches!(anonymous, ChangeError::BadRequest(_)));

    let mut change = draft(&service, user);
    let unnamed = EntityRecord::with_new_id(" ", fields(json!({ "name": "X" })));
    assert!(matches!(
        service.record_create(&mut change, &unnamed),
        Err(ChangeError::BadRequest(_))
    ));
}

#[test]
fn record_edit_without_begin_is_not_found() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let mut change = draft(&service, Uuid::new_v4());
    let widget = insert_widget(&conn, "A");

    let err = service.record_edit(&mut change, &widget).unwrap_err();
    assert!(matches!(err, ChangeError::EditNotFound { .. }));
    assert_eq!(err.kind(), ChangeErrorKind::NotFound);

    let err = service
        .discard_edit(&mut change, widget.id.unwrap())
        .unwrap_err();
    assert_eq!(err.kind(), ChangeErrorKind::NotFound);
}

#[test]
fn missing_entity_and_unknown_type_are_reported() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let change = draft(&service, Uuid::new_v4());

    let err = service
        .resolve_entity_reference(&change, "Widget", Uuid::new_v4())
        .unwrap_err();
    assert!(matches!(err, ChangeError::EntityNotFound { .. }));

    let err = service
        .resolve_entity_reference(&change, "Gadget", Uuid::new_v4())
        .unwrap_err();
    assert!(matches!(err, ChangeError::Registry(_)));
    assert!(err.to_string().contains("Gadget"));
}

#[test]
fn staged_create_is_visible_to_later_lookups() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let mut change = draft(&service, Uuid::new_v4());

    let created = EntityRecord::with_new_id("Process", fields(json!({ "name": "Milling" })));
    let id = created.id.unwrap();
    service.record_create(&mut change, &created).unwrap();

    let typed = service.resolve_entity_reference(&change, "Process", id).unwrap();
    assert_eq!(typed.get_str("name"), Some("Milling"));

    let any = service.resolve_any_entity_reference(&change, id).unwrap();
    assert_eq!(any.entity_name, "Process");

    let other = draft(&service, change.user_id());
    assert!(service.resolve_any_entity_reference(&other, id).is_err());
}

#[test]
fn record_delete_discards_staged_create_and_stages_delete_otherwise() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let mut change = draft(&service, Uuid::new_v4());

    let created = EntityRecord::with_new_id("Widget", fields(json!({ "name": "New" })));
    service.record_create(&mut change, &created).unwrap();
    service.record_delete(&mut change, &created).unwrap();
    assert!(change.edits().is_empty());

    let persisted = insert_widget(&conn, "Old");
    service.record_delete(&mut change, &persisted).unwrap();
    let edit = change.edit("Widget", persisted.id.unwrap()).unwrap();
    assert_eq!(edit.kind().unwrap(), EditKind::Delete);
    assert_eq!(edit.original, Some(fields(json!({ "name": "Old" }))));
}

#[test]
fn saved_changes_reload_for_owner_only() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();

    let mut change = service
        .create_change(
            ChangeSeed {
                title: Some("Rename widget".to_string()),
                ..ChangeSeed::default()
            },
            Some(owner),
        )
        .unwrap();
    let widget = insert_widget(&conn, "A");
    service.begin_edit(&mut change, &widget).unwrap();
    service.save_change(&mut change).unwrap();
    draft(&service, stranger);

    let loaded = service.get_change(change.id(), owner).unwrap();
    assert_eq!(loaded.title.as_deref(), Some("Rename widget"));
    assert_eq!(loaded.edits(), change.edits());

    assert!(matches!(
        service.get_change(change.id(), stranger),
        Err(ChangeError::ChangeNotFound(_))
    ));

    let owned = service
        .list_changes(&ChangeListQuery {
            user_id: Some(owner),
            ..ChangeListQuery::default()
        })
        .unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].id(), change.id());

    let everything = service.list_changes(&ChangeListQuery::default()).unwrap();
    assert_eq!(everything.len(), 2);
}

#[test]
fn open_staging_applies_source_changes() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let user = Uuid::new_v4();
    let kept = Uuid::new_v4();
    let dropped = Uuid::new_v4();

    let direct = service
        .open_staging(&StagedEditInput::default(), Some(user))
        .unwrap();
    assert!(direct.is_none());

    let stray_sources = StagedEditInput {
        add_sources: vec![kept],
        ..StagedEditInput::default()
    };
    assert!(service.open_staging(&stray_sources, Some(user)).is_err());

    let input = StagedEditInput {
        change: Some(ChangeSeed {
            sources: vec![dropped],
            ..ChangeSeed::default()
        }),
        add_sources: vec![kept],
        remove_sources: vec![dropped],
        ..StagedEditInput::default()
    };
    let change = service.open_staging(&input, Some(user)).unwrap().unwrap();
    assert!(change.sources().contains(&kept));
    assert!(!change.sources().contains(&dropped));
}

#[test]
fn status_updates_follow_the_lifecycle() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let user = Uuid::new_v4();
    let change = draft(&service, user);

    let proposed = service
        .update_status(change.id(), user, ChangeStatus::Proposed)
        .unwrap();
    assert_eq!(proposed.status, ChangeStatus::Proposed);

    assert!(matches!(
        service.update_status(change.id(), user, ChangeStatus::Merged),
        Err(ChangeError::InvalidStatusTransition { .. })
    ));

    service
        .update_status(change.id(), user, ChangeStatus::Rejected)
        .unwrap();
    assert!(matches!(
        service.update_status(change.id(), user, ChangeStatus::Approved),
        Err(ChangeError::InvalidStatusTransition {
            from: ChangeStatus::Rejected,
            to: ChangeStatus::Approved,
        })
    ));

    assert!(matches!(
        service.create_change(
            ChangeSeed {
                status: Some(ChangeStatus::Merged),
                ..ChangeSeed::default()
            },
            Some(user),
        ),
        Err(ChangeError::BadRequest(_))
    ));
}

#[test]
fn preview_renders_edits_through_registry_hooks() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let mut change = draft(&service, Uuid::new_v4());

    let process = EntityRecord::with_new_id("Process", fields(json!({ "name": "Milling" })));
    service.record_create(&mut change, &process).unwrap();

    let views = service.preview_change(&change).unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].kind, EditKind::Create);
    assert_eq!(views[0].payload["name"], json!("Milling"));

    let blank = EntityRecord::with_new_id("Process", fields(json!({ "name": "" })));
    service.record_create(&mut change, &blank).unwrap();
    let err = service.preview_change(&change).unwrap_err();
    assert!(matches!(err, ChangeError::Registry(_)));
    assert_eq!(err.kind(), ChangeErrorKind::BadRequest);
}

#[test]
fn entities_without_ids_are_bad_requests() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let mut change = draft(&service, Uuid::new_v4());
    let unsaved = EntityRecord::new("Widget", None, fields(json!({ "name": "?" })));

    let err = service.begin_edit(&mut change, &unsaved).unwrap_err();
    assert!(matches!(
        err,
        ChangeError::MissingEntityId { ref entity_name } if entity_name == "Widget"
    ));
    assert_eq!(err.kind(), ChangeErrorKind::BadRequest);

    assert!(matches!(
        service.record_delete(&mut change, &unsaved),
        Err(ChangeError::MissingEntityId { .. })
    ));
    assert!(change.edits().is_empty());
}

#[test]
fn closed_changes_refuse_new_edits() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let user = Uuid::new_v4();
    let widget = insert_widget(&conn, "A");
    let change = draft(&service, user);
    service
        .update_status(change.id(), user, ChangeStatus::Rejected)
        .unwrap();

    let err = service
        .resolve_or_create_change(Some(change.id()), None, Some(user))
        .unwrap_err();
    assert!(matches!(
        err,
        ChangeError::ChangeClosed {
            status: ChangeStatus::Rejected,
            ..
        }
    ));
    assert_eq!(err.kind(), ChangeErrorKind::BadRequest);

    let mut rejected = service.get_change(change.id(), user).unwrap();
    assert!(matches!(
        service.begin_edit(&mut rejected, &widget),
        Err(ChangeError::ChangeClosed { .. })
    ));
    assert!(matches!(
        service.record_create(&mut rejected, &widget),
        Err(ChangeError::ChangeClosed { .. })
    ));
    assert!(matches!(
        service.record_delete(&mut rejected, &widget),
        Err(ChangeError::ChangeClosed { .. })
    ));
    assert!(matches!(
        service.discard_edit(&mut rejected, widget.id.unwrap()),
        Err(ChangeError::ChangeClosed { .. })
    ));
    assert!(rejected.edits().is_empty());

    rejected.status = ChangeStatus::Draft;
    assert!(matches!(
        service.save_change(&mut rejected),
        Err(ChangeError::InvalidStatusTransition {
            from: ChangeStatus::Rejected,
            to: ChangeStatus::Draft,
        })
    ));
}

#[test]
fn seeded_change_is_stored_on_first_save() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let user = Uuid::new_v4();
    let input = StagedEditInput {
        change: Some(ChangeSeed {
            title: Some("Rename".to_string()),
            ..ChangeSeed::default()
        }),
        ..StagedEditInput::default()
    };

    let mut change = service.open_staging(&input, Some(user)).unwrap().unwrap();
    assert!(matches!(
        service.get_change(change.id(), user),
        Err(ChangeError::ChangeNotFound(_))
    ));

    service.save_change(&mut change).unwrap();
    let stored = service.get_change(change.id(), user).unwrap();
    assert_eq!(stored.title.as_deref(), Some("Rename"));
    assert_eq!(stored.status, ChangeStatus::Draft);

    let mut merged_seed = Change::new(user);
    merged_seed.status = ChangeStatus::Merged;
    assert!(matches!(
        service.save_change(&mut merged_seed),
        Err(ChangeError::BadRequest(_))
    ));
}
