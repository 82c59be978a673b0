//! Change aggregate and embedded edit diffs.
//!
//! # Responsibility
//! - Define the staged batch (`Change`) and its lifecycle status.
//! - Define per-entity diffs (`Edit`) and their derived classification.
//!
//! # Invariants
//! - At most one Edit per `(entity_name, entity_id)` within a Change.
//! - The edit list is only mutated through the staging operations below.
//! - `Merged` and `Rejected` are terminal.

use crate::model::entity::{EntityId, Snapshot, UserId};
use crate::model::now_epoch_ms;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identifier of a Change.
pub type ChangeId = Uuid;

/// Change lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Initial state; edits are being collected.
    Draft,
    /// Submitted for review.
    Proposed,
    /// Ready to merge.
    Approved,
    /// Claimed by one merge run; never set by callers.
    Merging,
    /// All edits applied to the entity store.
    Merged,
    /// A merge attempt failed or a reviewer declined the change.
    Rejected,
}

impl ChangeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Proposed => "proposed",
            Self::Approved => "approved",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "proposed" => Some(Self::Proposed),
            "approved" => Some(Self::Approved),
            "merging" => Some(Self::Merging),
            "merged" => Some(Self::Merged),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Rejected)
    }

    /// Whether callers may set this status directly.
    pub fn is_caller_settable(self) -> bool {
        matches!(
            self,
            Self::Draft | Self::Proposed | Self::Approved | Self::Rejected
        )
    }
}

impl Display for ChangeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived classification of one Edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Create,
    Update,
    Delete,
}

/// Edit shape that maps to no classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidEditShape {
    pub entity_name: String,
    pub entity_id: Option<EntityId>,
}

impl Display for InvalidEditShape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.entity_id {
            Some(id) => write!(f, "invalid edit shape for {} {id}", self.entity_name),
            None => write!(f, "invalid edit shape for {}", self.entity_name),
        }
    }
}

impl Error for InvalidEditShape {}

/// Per-entity before/after diff embedded in a Change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    pub entity_name: String,
    pub entity_id: Option<EntityId>,
    /// State before the change; `None` for creates.
    pub original: Option<Snapshot>,
    /// State after the change; `None` for deletes.
    pub changes: Option<Snapshot>,
}

impl Edit {
    pub fn create(
        entity_name: impl Into<String>,
        entity_id: Option<EntityId>,
        changes: Snapshot,
    ) -> Self {
        Self {
            entity_name: entity_name.into(),
            entity_id,
            original: None,
            changes: Some(changes),
        }
    }

    /// Classifies the edit from which snapshots are present.
    pub fn kind(&self) -> Result<EditKind, InvalidEditShape> {
        match (self.entity_id, &self.original, &self.changes) {
            (_, None, Some(_)) => Ok(EditKind::Create),
            (Some(_), Some(_), Some(_)) => Ok(EditKind::Update),
            (Some(_), Some(_), None) => Ok(EditKind::Delete),
            _ => Err(InvalidEditShape {
                entity_name: self.entity_name.clone(),
                entity_id: self.entity_id,
            }),
        }
    }

    fn matches(&self, entity_name: &str, entity_id: EntityId) -> bool {
        self.entity_id == Some(entity_id) && self.entity_name == entity_name
    }
}

/// Caller input for creating a Change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSeed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<ChangeStatus>,
    #[serde(default)]
    pub sources: Vec<EntityId>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Envelope accepted by per-entity mutations that support staging.
///
/// Neither `change_id` nor `change` means "mutate directly".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagedEditInput {
    pub change_id: Option<ChangeId>,
    pub change: Option<ChangeSeed>,
    #[serde(default)]
    pub add_sources: Vec<EntityId>,
    #[serde(default)]
    pub remove_sources: Vec<EntityId>,
    /// Merge immediately when the change ends up approved.
    #[serde(default)]
    pub apply: bool,
}

impl StagedEditInput {
    /// Whether the caller asked for change staging at all.
    pub fn requests_staging(&self) -> bool {
        self.change_id.is_some() || self.change.is_some()
    }
}

/// Staged batch of entity edits with an approval lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    id: ChangeId,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: ChangeStatus,
    user_id: UserId,
    edits: Vec<Edit>,
    sources: BTreeSet<EntityId>,
    pub metadata: Map<String, Value>,
    created_at: i64,
    pub updated_at: i64,
}

impl Change {
    /// Creates an empty `Draft` change owned by `user_id`.
    pub fn new(user_id: UserId) -> Self {
        let now = now_epoch_ms();
        Self {
            id: Uuid::new_v4(),
            title: None,
            description: None,
            status: ChangeStatus::Draft,
            user_id,
            edits: Vec::new(),
            sources: BTreeSet::new(),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a change from caller input; status defaults to `Draft`.
    pub fn from_seed(user_id: UserId, seed: ChangeSeed) -> Self {
        let mut change = Self::new(user_id);
        change.title = seed.title;
        change.description = seed.description;
        change.status = seed.status.unwrap_or(ChangeStatus::Draft);
        change.sources = seed.sources.into_iter().collect();
        change.metadata = seed.metadata;
        change
    }

    /// Reassembles a persisted change.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: ChangeId,
        title: Option<String>,
        description: Option<String>,
        status: ChangeStatus,
        user_id: UserId,
        edits: Vec<Edit>,
        sources: BTreeSet<EntityId>,
        metadata: Map<String, Value>,
        created_at: i64,
        updated_at: i64,
    ) -> Self {
        Self {
            id,
            title,
            description,
            status,
            user_id,
            edits,
            sources,
            metadata,
            created_at,
            updated_at,
        }
    }

    pub fn id(&self) -> ChangeId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Edits in insertion order, which is also merge order.
    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }

    pub fn sources(&self) -> &BTreeSet<EntityId> {
        &self.sources
    }

    /// Looks up the edit for one entity.
    pub fn edit(&self, entity_name: &str, entity_id: EntityId) -> Option<&Edit> {
        self.edits
            .iter()
            .find(|edit| edit.matches(entity_name, entity_id))
    }

    pub(crate) fn edit_mut(
        &mut self,
        entity_name: &str,
        entity_id: EntityId,
    ) -> Option<&mut Edit> {
        self.edits
            .iter_mut()
            .find(|edit| edit.matches(entity_name, entity_id))
    }

    /// Appends `edit`, or overwrites `changes` of the edit with the same key.
    ///
    /// Edits without an id never match and are always appended.
    pub(crate) fn upsert_edit(&mut self, edit: Edit) {
        if let Some(id) = edit.entity_id {
            if let Some(existing) = self.edit_mut(&edit.entity_name, id) {
                existing.changes = edit.changes;
                return;
            }
        }
        self.edits.push(edit);
    }

    /// Removes every edit targeting `entity_id`.
    ///
    /// Returns the removed edits; empty when nothing matched.
    pub fn discard_edit(&mut self, entity_id: EntityId) -> Vec<Edit> {
        let (removed, kept) = std::mem::take(&mut self.edits)
            .into_iter()
            .partition(|edit| edit.entity_id == Some(entity_id));
        self.edits = kept;
        removed
    }

    pub fn add_sources(&mut self, sources: impl IntoIterator<Item = EntityId>) {
        self.sources.extend(sources);
    }

    pub fn remove_sources<'a>(&mut self, sources: impl IntoIterator<Item = &'a EntityId>) {
        for source in sources {
            self.sources.remove(source);
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_epoch_ms().max(self.updated_at);
    }
}
