//! Change repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist the Change aggregate with its embedded edits, sources and
//!   metadata as JSON columns.
//! - Provide owner-filtered reads and the merge claim compare-and-swap.
//!
//! # Invariants
//! - Edits are never stored as independent rows.
//! - `claim_for_merge` is the only write that sets `merging`.

use crate::db::migrations::{latest_version, schema_state, SchemaState};
use crate::db::{table_exists, table_has_column, DbError};
use crate::model::change::{Change, ChangeId, ChangeStatus, Edit};
use crate::model::entity::{EntityId, UserId};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

const CHANGE_SELECT_SQL: &str = "SELECT
    id,
    title,
    description,
    status,
    user_id,
    edits,
    sources,
    metadata,
    created_at,
    updated_at
FROM changes";

const CHANGE_COLUMNS: &[&str] = &[
    "id",
    "title",
    "description",
    "status",
    "user_id",
    "edits",
    "sources",
    "metadata",
    "created_at",
    "updated_at",
];

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error shared by change and entity persistence.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    ChangeNotFound(ChangeId),
    EntityNotFound {
        entity_name: String,
        entity_id: EntityId,
    },
    EntityAlreadyExists {
        entity_name: String,
        entity_id: EntityId,
    },
    HistoryStoreNotFound(String),
    /// Entity name cannot address a history table.
    InvalidEntityName(String),
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    MissingRequiredTable(&'static str),
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
    Serialization(serde_json::Error),
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::ChangeNotFound(id) => write!(f, "change not found: {id}"),
            Self::EntityNotFound {
                entity_name,
                entity_id,
            } => write!(f, "{entity_name} not found: {entity_id}"),
            Self::EntityAlreadyExists {
                entity_name,
                entity_id,
            } => write!(f, "{entity_name} already exists: {entity_id}"),
            Self::HistoryStoreNotFound(store) => write!(f, "history store not found: {store}"),
            Self::InvalidEntityName(name) => write!(f, "invalid entity name `{name}`"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "repository requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "repository requires table `{table}`")
            }
            Self::MissingRequiredColumn { table, column } => write!(
                f,
                "repository requires column `{column}` in table `{table}`"
            ),
            Self::Serialization(err) => write!(f, "snapshot serialization failed: {err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Query options for listing changes.
#[derive(Debug, Clone, Default)]
pub struct ChangeListQuery {
    pub user_id: Option<UserId>,
    pub status: Option<ChangeStatus>,
    pub limit: Option<u32>,
    pub offset: u32,
}

/// Repository interface for change persistence.
pub trait ChangeRepository {
    fn create_change(&self, change: &Change) -> RepoResult<ChangeId>;
    /// Overwrites every mutable column, edits included.
    fn save_change(&self, change: &Change) -> RepoResult<()>;
    fn get_change(&self, id: ChangeId) -> RepoResult<Option<Change>>;
    /// Loads a change only when owned by `user_id`.
    fn get_change_for_user(&self, id: ChangeId, user_id: UserId) -> RepoResult<Option<Change>>;
    fn list_changes(&self, query: &ChangeListQuery) -> RepoResult<Vec<Change>>;
    /// Moves a persisted change from `approved` to `merging`.
    ///
    /// Returns `false` when the row is missing or not approved.
    fn claim_for_merge(&self, id: ChangeId) -> RepoResult<bool>;
}

/// SQLite-backed change repository.
pub struct SqliteChangeRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteChangeRepository<'conn> {
    /// Constructs a repository from a migrated/ready connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_change_connection_ready(conn)?;
        Ok(Self { conn })
    }

    /// Wraps a connection already checked by the caller, e.g. an open
    /// transaction.
    pub(crate) fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl ChangeRepository for SqliteChangeRepository<'_> {
    fn create_change(&self, change: &Change) -> RepoResult<ChangeId> {
        self.conn.execute(
            "INSERT INTO changes (
                id,
                title,
                description,
                status,
                user_id,
                edits,
                sources,
                metadata,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            params![
                change.id().to_string(),
                change.title.as_deref(),
                change.description.as_deref(),
                change.status.as_str(),
                change.user_id().to_string(),
                serde_json::to_string(change.edits())?,
                serde_json::to_string(change.sources())?,
                serde_json::to_string(&change.metadata)?,
                change.created_at(),
                change.updated_at,
            ],
        )?;

        Ok(change.id())
    }

    fn save_change(&self, change: &Change) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE changes
             SET
                title = ?2,
                description = ?3,
                status = ?4,
                edits = ?5,
                sources = ?6,
                metadata = ?7,
                updated_at = ?8
             WHERE id = ?1;",
            params![
                change.id().to_string(),
                change.title.as_deref(),
                change.description.as_deref(),
                change.status.as_str(),
                serde_json::to_string(change.edits())?,
                serde_json::to_string(change.sources())?,
                serde_json::to_string(&change.metadata)?,
                change.updated_at,
            ],
        )?;

        if changed == 0 {
            return Err(RepoError::ChangeNotFound(change.id()));
        }

        Ok(())
    }

    fn get_change(&self, id: ChangeId) -> RepoResult<Option<Change>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{CHANGE_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_change_row(row)?));
        }
        Ok(None)
    }

    fn get_change_for_user(&self, id: ChangeId, user_id: UserId) -> RepoResult<Option<Change>> {
        let mut stmt = self.conn.prepare(&format!(
            "{CHANGE_SELECT_SQL}
             WHERE id = ?1
               AND user_id = ?2;"
        ))?;
        let mut rows = stmt.query(params![id.to_string(), user_id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_change_row(row)?));
        }
        Ok(None)
    }

    fn list_changes(&self, query: &ChangeListQuery) -> RepoResult<Vec<Change>> {
        let mut sql = format!("{CHANGE_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values: Vec<Value> = Vec::new();

        if let Some(user_id) = query.user_id {
            sql.push_str(" AND user_id = ?");
            bind_values.push(Value::Text(user_id.to_string()));
        }

        if let Some(status) = query.status {
            sql.push_str(" AND status = ?");
            bind_values.push(Value::Text(status.as_str().to_string()));
        }

        sql.push_str(" ORDER BY updated_at DESC, id ASC");

        match (query.limit, query.offset) {
            (Some(limit), offset) => {
                sql.push_str(" LIMIT ? OFFSET ?");
                bind_values.push(Value::Integer(i64::from(limit)));
                bind_values.push(Value::Integer(i64::from(offset)));
            }
            (None, 0) => {}
            (None, offset) => {
                sql.push_str(" LIMIT -1 OFFSET ?");
                bind_values.push(Value::Integer(i64::from(offset)));
            }
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut changes = Vec::new();
        while let Some(row) = rows.next()? {
            changes.push(parse_change_row(row)?);
        }
        Ok(changes)
    }

    fn claim_for_merge(&self, id: ChangeId) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE changes
             SET status = 'merging'
             WHERE id = ?1
               AND status = 'approved';",
            [id.to_string()],
        )?;
        Ok(changed == 1)
    }
}

fn parse_change_row(row: &Row<'_>) -> RepoResult<Change> {
    let id = parse_uuid(&row.get::<_, String>("id")?, "changes.id")?;
    let user_id = parse_uuid(&row.get::<_, String>("user_id")?, "changes.user_id")?;

    let status_text: String = row.get("status")?;
    let status = ChangeStatus::parse(&status_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid status `{status_text}` in changes.status"))
    })?;

    let edits: Vec<Edit> = parse_json(&row.get::<_, String>("edits")?, "changes.edits")?;
    let sources: BTreeSet<EntityId> =
        parse_json(&row.get::<_, String>("sources")?, "changes.sources")?;
    let metadata = parse_json(&row.get::<_, String>("metadata")?, "changes.metadata")?;

    Ok(Change::from_parts(
        id,
        row.get("title")?,
        row.get("description")?,
        status,
        user_id,
        edits,
        sources,
        metadata,
        row.get("created_at")?,
        row.get("updated_at")?,
    ))
}

fn parse_json<T: serde::de::DeserializeOwned>(value: &str, column: &'static str) -> RepoResult<T> {
    serde_json::from_str(value)
        .map_err(|err| RepoError::InvalidData(format!("invalid json in {column}: {err}")))
}

pub(crate) fn parse_uuid(value: &str, column: &'static str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

fn ensure_change_connection_ready(conn: &Connection) -> RepoResult<()> {
    ensure_schema_version(conn)?;

    if !table_exists(conn, "changes")? {
        return Err(RepoError::MissingRequiredTable("changes"));
    }

    for &column in CHANGE_COLUMNS {
        if !table_has_column(conn, "changes", column)? {
            return Err(RepoError::MissingRequiredColumn {
                table: "changes",
                column,
            });
        }
    }

    Ok(())
}

/// Shared readiness gate: the connection must sit at this build's schema.
pub(crate) fn ensure_schema_version(conn: &Connection) -> RepoResult<()> {
    match schema_state(conn)? {
        SchemaState::Current => Ok(()),
        state => Err(RepoError::UninitializedConnection {
            expected_version: latest_version(),
            actual_version: state.version(),
        }),
    }
}
