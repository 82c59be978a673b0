//! Schema versioning for the catalog database.
//!
//! Each step is a named SQL script; the highest applied step is stamped into
//! `PRAGMA user_version`. Repositories ask [`schema_state`] before touching
//! tables, so a connection opened by an older or newer binary is caught at
//! construction time rather than on the first failing query.

use crate::db::{DbError, DbResult};
use log::{debug, info};
use rusqlite::Connection;

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "changes",
        sql: include_str!("0001_changes.sql"),
    },
    Migration {
        version: 2,
        name: "entities",
        sql: include_str!("0002_entities.sql"),
    },
    Migration {
        version: 3,
        name: "catalog_history",
        sql: include_str!("0003_catalog_history.sql"),
    },
];

/// Position of a connection's schema relative to this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaState {
    Current,
    /// Older schema; `apply_migrations` can bring it forward.
    Behind { version: u32 },
    /// Written by a newer build; never touched.
    Ahead { version: u32 },
}

impl SchemaState {
    pub fn version(self) -> u32 {
        match self {
            Self::Current => latest_version(),
            Self::Behind { version } | Self::Ahead { version } => version,
        }
    }
}

/// Returns the latest migration version known by this binary.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Reads the schema version stamped on the connection.
pub fn current_user_version(conn: &Connection) -> DbResult<u32> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    Ok(version)
}

/// Classifies the connection's schema version.
pub fn schema_state(conn: &Connection) -> DbResult<SchemaState> {
    let version = current_user_version(conn)?;
    let latest = latest_version();
    Ok(if version == latest {
        SchemaState::Current
    } else if version < latest {
        SchemaState::Behind { version }
    } else {
        SchemaState::Ahead { version }
    })
}

/// Brings the schema up to [`latest_version`] in one transaction.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let from_version = match schema_state(conn)? {
        SchemaState::Current => return Ok(()),
        SchemaState::Ahead { version } => {
            return Err(DbError::UnsupportedSchemaVersion {
                db_version: version,
                latest_supported: latest_version(),
            })
        }
        SchemaState::Behind { version } => version,
    };

    let tx = conn.transaction()?;
    for migration in pending(from_version) {
        tx.execute_batch(migration.sql)?;
        tx.pragma_update(None, "user_version", migration.version)?;
        debug!(
            "event=db_migrate_step module=db status=ok version={} name={}",
            migration.version, migration.name
        );
    }
    tx.commit()?;

    info!(
        "event=db_migrate module=db status=ok from_version={} to_version={}",
        from_version,
        latest_version()
    );
    Ok(())
}

fn pending(from_version: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS
        .iter()
        .filter(move |migration| migration.version > from_version)
}
