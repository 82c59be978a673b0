//! Change staging, merge and mutation services.
//!
//! # Responsibility
//! - Stage entity edits into changes on behalf of an explicit user.
//! - Merge approved changes atomically with audit history.
//! - Route per-entity mutations either directly or through a change.

pub mod change_service;
pub mod entity_mutation;
pub mod merge_engine;
