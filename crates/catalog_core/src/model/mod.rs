//! Domain model for staged catalog changes.
//!
//! # Responsibility
//! - Define the Change aggregate and its embedded Edit diffs.
//! - Define the structural entity projection shared by staging and merging.
//! - Define the built-in catalog entity types.
//!
//! # Invariants
//! - A Change holds at most one Edit per `(entity_name, entity_id)`.
//! - Snapshots never carry `id` or audit collections.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod catalog;
pub mod change;
pub mod entity;

/// Current wall clock in Unix epoch milliseconds.
///
/// Clamps to `0` if the system clock is set before the epoch.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
