//! Entity store contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist catalog entities as `(entity_name, entity_id, fields)` rows.
//! - Address per-type `<Name>History` audit tables.
//!
//! # Invariants
//! - History rows are append-only; no API updates or deletes them.
//! - History timestamps are strictly increasing per entity.
//! - Table names built from entity names pass `is_valid_entity_name` first.

use crate::db::{table_exists, table_has_column};
use crate::model::entity::{history_store_name, EntityId, EntityRecord, HistoryRecord, Snapshot};
use crate::model::now_epoch_ms;
use crate::registry::is_valid_entity_name;
use crate::repo::change_repo::{ensure_schema_version, parse_uuid, RepoError, RepoResult};
use rusqlite::{params, Connection, OptionalExtension, Row};

const ENTITY_COLUMNS: &[&str] = &[
    "entity_name",
    "entity_id",
    "fields",
    "created_at",
    "updated_at",
];

/// Repository interface for the entity store.
pub trait EntityStore {
    fn find_entity(&self, entity_name: &str, entity_id: EntityId)
        -> RepoResult<Option<EntityRecord>>;
    /// Lists every entity of one type ordered by id.
    fn list_entities(&self, entity_name: &str) -> RepoResult<Vec<EntityRecord>>;
    fn insert_entity(&self, record: &EntityRecord) -> RepoResult<EntityId>;
    /// Replaces the stored fields of an existing entity.
    fn update_entity(&self, record: &EntityRecord) -> RepoResult<()>;
    fn delete_entity(&self, entity_name: &str, entity_id: EntityId) -> RepoResult<()>;
    fn history_store_exists(&self, store_name: &str) -> RepoResult<bool>;
    /// Creates the `<Name>History` table when missing and returns its name.
    fn ensure_history_store(&self, entity_name: &str) -> RepoResult<String>;
    /// Appends one audit row; the timestamp is bumped past the latest row
    /// for the same entity when the clock has not advanced.
    fn append_history(&self, store_name: &str, record: &HistoryRecord)
        -> RepoResult<HistoryRecord>;
    fn list_history(&self, entity_name: &str, entity_id: EntityId)
        -> RepoResult<Vec<HistoryRecord>>;
}

/// SQLite-backed entity store.
pub struct SqliteEntityStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteEntityStore<'conn> {
    /// Constructs a store from a migrated/ready connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_entity_connection_ready(conn)?;
        Ok(Self { conn })
    }

    pub(crate) fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl EntityStore for SqliteEntityStore<'_> {
    fn find_entity(
        &self,
        entity_name: &str,
        entity_id: EntityId,
    ) -> RepoResult<Option<EntityRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_name, entity_id, fields
             FROM entities
             WHERE entity_name = ?1
               AND entity_id = ?2;",
        )?;
        let mut rows = stmt.query(params![entity_name, entity_id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_entity_row(row)?));
        }
        Ok(None)
    }

    fn list_entities(&self, entity_name: &str) -> RepoResult<Vec<EntityRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_name, entity_id, fields
             FROM entities
             WHERE entity_name = ?1
             ORDER BY entity_id ASC;",
        )?;
        let mut rows = stmt.query([entity_name])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_entity_row(row)?);
        }
        Ok(records)
    }

    fn insert_entity(&self, record: &EntityRecord) -> RepoResult<EntityId> {
        let entity_id = record.id.ok_or_else(|| {
            RepoError::InvalidData(format!("{} insert requires an id", record.entity_name))
        })?;
        if self.find_entity(&record.entity_name, entity_id)?.is_some() {
            return Err(RepoError::EntityAlreadyExists {
                entity_name: record.entity_name.clone(),
                entity_id,
            });
        }

        let now = now_epoch_ms();
        self.conn.execute(
            "INSERT INTO entities (
                entity_name,
                entity_id,
                fields,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?4);",
            params![
                record.entity_name.as_str(),
                entity_id.to_string(),
                serde_json::to_string(&record.snapshot())?,
                now,
            ],
        )?;
        Ok(entity_id)
    }

    fn update_entity(&self, record: &EntityRecord) -> RepoResult<()> {
        let entity_id = record.id.ok_or_else(|| {
            RepoError::InvalidData(format!("{} update requires an id", record.entity_name))
        })?;

        let changed = self.conn.execute(
            "UPDATE entities
             SET
                fields = ?3,
                updated_at = ?4
             WHERE entity_name = ?1
               AND entity_id = ?2;",
            params![
                record.entity_name.as_str(),
                entity_id.to_string(),
                serde_json::to_string(&record.snapshot())?,
                now_epoch_ms(),
            ],
        )?;

        if changed == 0 {
            return Err(RepoError::EntityNotFound {
                entity_name: record.entity_name.clone(),
                entity_id,
            });
        }
        Ok(())
    }

    fn delete_entity(&self, entity_name: &str, entity_id: EntityId) -> RepoResult<()> {
        let changed = self.conn.execute(
            "DELETE FROM entities
             WHERE entity_name = ?1
               AND entity_id = ?2;",
            params![entity_name, entity_id.to_string()],
        )?;

        if changed == 0 {
            return Err(RepoError::EntityNotFound {
                entity_name: entity_name.to_string(),
                entity_id,
            });
        }
        Ok(())
    }

    fn history_store_exists(&self, store_name: &str) -> RepoResult<bool> {
        Ok(table_exists(self.conn, store_name)?)
    }

    fn ensure_history_store(&self, entity_name: &str) -> RepoResult<String> {
        if !is_valid_entity_name(entity_name) {
            return Err(RepoError::InvalidEntityName(entity_name.to_string()));
        }

        let store_name = history_store_name(entity_name);
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{store_name}\" (
                entity_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                original TEXT,
                changes TEXT,
                PRIMARY KEY (entity_id, timestamp)
            );"
        ))?;
        Ok(store_name)
    }

    fn append_history(
        &self,
        store_name: &str,
        record: &HistoryRecord,
    ) -> RepoResult<HistoryRecord> {
        if !self.history_store_exists(store_name)? {
            return Err(RepoError::HistoryStoreNotFound(store_name.to_string()));
        }

        let latest: Option<i64> = self
            .conn
            .query_row(
                &format!(
                    "SELECT MAX(timestamp)
                     FROM \"{store_name}\"
                     WHERE entity_id = ?1;"
                ),
                [record.entity_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        let mut stored = record.clone();
        if let Some(latest) = latest {
            stored.timestamp = stored.timestamp.max(latest + 1);
        }

        self.conn.execute(
            &format!(
                "INSERT INTO \"{store_name}\" (
                    entity_id,
                    timestamp,
                    user_id,
                    original,
                    changes
                ) VALUES (?1, ?2, ?3, ?4, ?5);"
            ),
            params![
                stored.entity_id.to_string(),
                stored.timestamp,
                stored.user_id.to_string(),
                stored
                    .original
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                stored
                    .changes
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            ],
        )?;
        Ok(stored)
    }

    fn list_history(
        &self,
        entity_name: &str,
        entity_id: EntityId,
    ) -> RepoResult<Vec<HistoryRecord>> {
        if !is_valid_entity_name(entity_name) {
            return Err(RepoError::InvalidEntityName(entity_name.to_string()));
        }
        let store_name = history_store_name(entity_name);
        if !self.history_store_exists(&store_name)? {
            return Err(RepoError::HistoryStoreNotFound(store_name));
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT entity_id, timestamp, user_id, original, changes
             FROM \"{store_name}\"
             WHERE entity_id = ?1
             ORDER BY timestamp ASC;"
        ))?;
        let mut rows = stmt.query([entity_id.to_string()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_history_row(row, &store_name)?);
        }
        Ok(records)
    }
}

fn parse_entity_row(row: &Row<'_>) -> RepoResult<EntityRecord> {
    let entity_id = parse_uuid(&row.get::<_, String>("entity_id")?, "entities.entity_id")?;
    let fields_text: String = row.get("fields")?;
    let fields: Snapshot = serde_json::from_str(&fields_text).map_err(|err| {
        RepoError::InvalidData(format!("invalid json in entities.fields: {err}"))
    })?;

    Ok(EntityRecord::new(
        row.get::<_, String>("entity_name")?,
        Some(entity_id),
        fields,
    ))
}

fn parse_history_row(row: &Row<'_>, store_name: &str) -> RepoResult<HistoryRecord> {
    let entity_id = parse_uuid(&row.get::<_, String>("entity_id")?, "history.entity_id")?;
    let user_id = parse_uuid(&row.get::<_, String>("user_id")?, "history.user_id")?;
    let parse_snapshot = |column: &str| -> RepoResult<Option<Snapshot>> {
        row.get::<_, Option<String>>(column)?
            .map(|text| {
                serde_json::from_str(&text).map_err(|err| {
                    RepoError::InvalidData(format!("invalid json in {store_name}.{column}: {err}"))
                })
            })
            .transpose()
    };

    Ok(HistoryRecord {
        entity_id,
        timestamp: row.get("timestamp")?,
        user_id,
        original: parse_snapshot("original")?,
        changes: parse_snapshot("changes")?,
    })
}

fn ensure_entity_connection_ready(conn: &Connection) -> RepoResult<()> {
    ensure_schema_version(conn)?;

    if !table_exists(conn, "entities")? {
        return Err(RepoError::MissingRequiredTable("entities"));
    }

    for &column in ENTITY_COLUMNS {
        if !table_has_column(conn, "entities", column)? {
            return Err(RepoError::MissingRequiredColumn {
                table: "entities",
                column,
            });
        }
    }

    Ok(())
}
