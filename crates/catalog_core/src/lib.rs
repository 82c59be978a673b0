//! Core of the catalog change engine.
//! Stages edits to catalog entities into changes and merges approved changes
//! atomically with per-entity audit history.

pub mod db;
pub mod logging;
pub mod model;
pub mod registry;
pub mod repo;
pub mod service;

pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::catalog::{Component, Process, Product};
pub use model::change::{
    Change, ChangeId, ChangeSeed, ChangeStatus, Edit, EditKind, InvalidEditShape,
    StagedEditInput,
};
pub use model::entity::{
    CatalogEntity, EntityId, EntityRecord, HistoryRecord, Snapshot, UserId,
};
pub use registry::{EntityRegistryError, EntityTypeRegistry};
pub use repo::change_repo::{
    ChangeListQuery, ChangeRepository, RepoError, RepoResult, SqliteChangeRepository,
};
pub use repo::entity_store::{EntityStore, SqliteEntityStore};
pub use service::change_service::{
    ChangeError, ChangeErrorKind, ChangeResult, ChangeService, EditView,
};
pub use service::entity_mutation::{EntityMutationService, MutationOutcome};
pub use service::merge_engine::MergeEngine;
