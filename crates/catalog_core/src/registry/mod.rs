//! Entity type registry.
//!
//! # Responsibility
//! - Map entity type names to lookup and edit-view hooks.
//! - Keep the merge/display machinery free of per-type rules.
//!
//! # Invariants
//! - Registered names are unique and safe to use as SQL table prefixes.

pub mod entity_types;

pub use entity_types::{
    is_valid_entity_name, EditHookFn, EntityRegistryError, EntityTypeEntry, EntityTypeRegistry,
    LookupFn,
};
