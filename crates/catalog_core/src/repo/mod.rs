//! Persistence contracts and SQLite implementations.
//!
//! # Responsibility
//! - Store changes with their staged edits.
//! - Store catalog entities and their per-type history tables.
//!
//! # Invariants
//! - Repository APIs return semantic errors (`ChangeNotFound`,
//!   `EntityNotFound`, `HistoryStoreNotFound`) next to transport errors.
//! - `try_new` constructors refuse connections with an unexpected schema.

pub mod change_repo;
pub mod entity_store;
