//! Domain model types used throughout branchbase.
//!
//! These types bridge the engine components, the database layer, and the web
//! API. Everything that crosses the wire serializes in camelCase with the
//! enum spellings the admin UI expects (`CREATE`, `FIELD_CONFLICT`, ...).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A structured entity snapshot: a flat JSON object of field -> value.
pub type Record = serde_json::Map<String, Value>;

/// Field-level differences keyed by field name.
pub type FieldChanges = BTreeMap<String, FieldChange>;

// ---------------------------------------------------------------------------
// Entity types
// ---------------------------------------------------------------------------

/// The closed set of entity kinds managed by the admin surface.
///
/// Deserializes from either the type name or the pluralized resource key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String")]
pub enum EntityType {
    Rule,
    Process,
    Node,
    Office,
    Workflow,
    Credential,
    Tag,
    Class,
    Group,
}

impl EntityType {
    pub const ALL: [EntityType; 9] = [
        Self::Rule,
        Self::Process,
        Self::Node,
        Self::Office,
        Self::Workflow,
        Self::Credential,
        Self::Tag,
        Self::Class,
        Self::Group,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "Rule",
            Self::Process => "Process",
            Self::Node => "Node",
            Self::Office => "Office",
            Self::Workflow => "Workflow",
            Self::Credential => "Credential",
            Self::Tag => "Tag",
            Self::Class => "Class",
            Self::Group => "Group",
        }
    }

    /// The pluralized resource key used by the UI's resource registry.
    pub fn resource_key(&self) -> &'static str {
        match self {
            Self::Rule => "rules",
            Self::Process => "processes",
            Self::Node => "nodes",
            Self::Office => "offices",
            Self::Workflow => "workflows",
            Self::Credential => "credentials",
            Self::Tag => "tags",
            Self::Class => "classes",
            Self::Group => "groups",
        }
    }

    /// Parse either the type name (`Rule`, `rule`) or its resource key (`rules`).
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| {
            t.as_str().eq_ignore_ascii_case(&lower) || t.resource_key() == lower
        })
    }
}

impl TryFrom<String> for EntityType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown entity type '{value}'"))
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Change records
// ---------------------------------------------------------------------------

/// Kind of change a [`ChangeRecord`] represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    Merge,
    Rollback,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Merge => "MERGE",
            Self::Rollback => "ROLLBACK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Some(Self::Create),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            "MERGE" => Some(Self::Merge),
            "ROLLBACK" => Some(Self::Rollback),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a single field difference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldChangeType {
    Added,
    Modified,
    Deleted,
}

/// One field-level difference, produced by [`crate::diff`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldChange {
    #[serde(rename = "type")]
    pub kind: FieldChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Value>,
}

/// One immutable entry in a per-(entity, branch) change chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub id: String,
    pub sha: String,
    /// Global append sequence; total order across all chains.
    pub seq: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub branch_id: String,
    pub change_type: ChangeType,
    pub before_data: Option<Record>,
    pub after_data: Option<Record>,
    pub field_changes: FieldChanges,
    pub author_id: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub merge_event_id: Option<String>,
    pub rollback_id: Option<String>,
    pub batch_id: Option<String>,
    pub is_conflicted: bool,
}

// ---------------------------------------------------------------------------
// Branches
// ---------------------------------------------------------------------------

/// A named line of edits over the entity overlay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub description: Option<String>,
    pub parent_branch_id: Option<String>,
    pub is_default: bool,
    pub is_locked: bool,
    pub collaborator_ids: Vec<String>,
    pub change_count: i64,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    /// Global sequence at fork time.
    pub base_seq: i64,
}

/// Explicit session context replacing an ambient "current branch".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BranchContext {
    pub user_id: String,
    pub tenant_id: String,
    pub branch_id: String,
    pub branch_name: String,
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStrategy {
    #[default]
    Auto,
    FastForward,
    ThreeWay,
    Squash,
    Selective,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::FastForward => "FAST_FORWARD",
            Self::ThreeWay => "THREE_WAY",
            Self::Squash => "SQUASH",
            Self::Selective => "SELECTIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "AUTO" => Some(Self::Auto),
            "FAST_FORWARD" => Some(Self::FastForward),
            "THREE_WAY" => Some(Self::ThreeWay),
            "SQUASH" => Some(Self::Squash),
            "SELECTIVE" => Some(Self::Selective),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictResolution {
    #[default]
    AbortOnConflict,
    Manual,
    FavorSource,
    FavorTarget,
}

impl ConflictResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AbortOnConflict => "ABORT_ON_CONFLICT",
            Self::Manual => "MANUAL",
            Self::FavorSource => "FAVOR_SOURCE",
            Self::FavorTarget => "FAVOR_TARGET",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "ABORT_ON_CONFLICT" => Some(Self::AbortOnConflict),
            "MANUAL" => Some(Self::Manual),
            "FAVOR_SOURCE" => Some(Self::FavorSource),
            "FAVOR_TARGET" => Some(Self::FavorTarget),
            _ => None,
        }
    }
}

/// How an entity differs on the source side relative to the merge base.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeChangeType {
    Added,
    Modified,
    Deleted,
}

impl MergeChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ADDED" => Some(Self::Added),
            "MODIFIED" => Some(Self::Modified),
            "DELETED" => Some(Self::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    FieldConflict,
    DeletionConflict,
    CreationConflict,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FieldConflict => "FIELD_CONFLICT",
            Self::DeletionConflict => "DELETION_CONFLICT",
            Self::CreationConflict => "CREATION_CONFLICT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FIELD_CONFLICT" => Some(Self::FieldConflict),
            "DELETION_CONFLICT" => Some(Self::DeletionConflict),
            "CREATION_CONFLICT" => Some(Self::CreationConflict),
            _ => None,
        }
    }
}

/// Per-entity outcome of a merge (or a planned merge in a preview).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AffectedEntity {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub change_type: MergeChangeType,
    pub has_conflict: bool,
    pub conflict_type: Option<ConflictType>,
    pub resolution: Option<ConflictResolution>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicting_fields: Vec<String>,
}

/// Immutable record of applying one branch's changes onto another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergeEvent {
    pub id: String,
    pub sha: String,
    pub source_branch_id: String,
    pub target_branch_id: String,
    pub strategy: MergeStrategy,
    pub conflict_resolution: ConflictResolution,
    pub message: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
    pub affected_entities: Vec<AffectedEntity>,
    pub fast_forward: bool,
    /// Global sequence right after the merge committed.
    pub watermark_seq: i64,
}

/// One field both sides changed to different values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldConflict {
    pub field: String,
    pub base: Option<Value>,
    pub source: Option<Value>,
    pub target: Option<Value>,
}

/// A conflict surfaced for resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergeConflict {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub conflict_type: ConflictType,
    pub fields: Vec<FieldConflict>,
    pub base_data: Option<Record>,
    pub source_data: Option<Record>,
    pub target_data: Option<Record>,
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

/// Wire-level rollback strategy.
///
/// `DirectRollback` is accepted on the wire for compatibility, but the engine
/// routes it to a separate destructive operation that must be explicitly
/// confirmed; see [`crate::rollback::executor::DirectRollback`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackStrategy {
    #[default]
    CreateRevertCommit,
    SelectiveRevert,
    DirectRollback,
    RestoreToPoint,
}

impl RollbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateRevertCommit => "CREATE_REVERT_COMMIT",
            Self::SelectiveRevert => "SELECTIVE_REVERT",
            Self::DirectRollback => "DIRECT_ROLLBACK",
            Self::RestoreToPoint => "RESTORE_TO_POINT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "CREATE_REVERT_COMMIT" => Some(Self::CreateRevertCommit),
            "SELECTIVE_REVERT" => Some(Self::SelectiveRevert),
            "DIRECT_ROLLBACK" => Some(Self::DirectRollback),
            "RESTORE_TO_POINT" => Some(Self::RestoreToPoint),
            _ => None,
        }
    }
}

/// A later edit that prevents a merge from being safely reverted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollbackBlocker {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub later_change_id: String,
    pub later_change_sha: String,
    pub later_change_type: ChangeType,
    pub later_author_id: String,
    pub later_author_name: Option<String>,
    pub message: String,
}

/// A merge event annotated with whether it can be reverted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollbackCandidate {
    #[serde(flatten)]
    pub merge_event: MergeEvent,
    pub can_revert: bool,
    pub blockers: Vec<RollbackBlocker>,
    pub reverted_entity_ids: Vec<String>,
}

/// Outcome of a rollback or selective revert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub id: String,
    pub merge_event_id: Option<String>,
    pub strategy: RollbackStrategy,
    pub message: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
    pub records: Vec<ChangeRecord>,
    pub reverted_entity_ids: Vec<String>,
    pub skipped_entity_ids: Vec<String>,
    /// Set when a destructive rollback ran despite blockers.
    pub forced: bool,
    pub irreversible: bool,
    pub blockers: Vec<RollbackBlocker>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Best-effort human-readable name for an entity snapshot.
pub fn entity_display_name(record: Option<&Record>) -> Option<String> {
    let record = record?;
    ["name", "title", "label"]
        .iter()
        .find_map(|key| record.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}
