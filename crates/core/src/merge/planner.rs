//! Three-way merge planning between two branches.
//!
//! The fork point of a source `S` and target `T` is the global sequence
//! number where the branches below their lowest common ancestor split off.
//! Past merges are tracked per entity: a merge mark records the highest
//! source-side record already carried from a branch into `T`, so only
//! records above both the fork point and the mark count as pending.
//!
//! The three-way base of an entity is the state the source edited from:
//! the `before_data` of its oldest pending record. Classification compares
//! that base with the current source and target states.

use std::collections::HashSet;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db::queries;
use crate::diff;
use crate::errors::EngineError;
use crate::models::{
    entity_display_name, AffectedEntity, Branch, ChangeRecord, ConflictType, EntityType,
    FieldChanges, FieldConflict, MergeChangeType, MergeConflict, Record,
};
use crate::version_store::VersionStore;

/// What a merge would do, without doing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergePreview {
    pub source_branch_id: String,
    pub target_branch_id: String,
    pub common_ancestor_id: String,
    pub divergence_seq: i64,
    pub added_count: usize,
    pub modified_count: usize,
    pub deleted_count: usize,
    pub conflicts: Vec<MergeConflict>,
    pub affected_entities: Vec<AffectedEntity>,
    pub can_fast_forward: bool,
    /// Records on the target side since divergence.
    pub target_change_count: usize,
}

/// One entity the source changed since divergence.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedEntity {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub change_type: MergeChangeType,
    pub base: Option<Record>,
    pub source: Option<Record>,
    pub target: Option<Record>,
    pub source_changes: FieldChanges,
    pub target_changes: FieldChanges,
    pub conflict: Option<MergeConflict>,
    /// Pending source-side records, oldest first.
    pub source_records: Vec<ChangeRecord>,
}

/// An entity the source edited whose state already matches the target.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedEntity {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub source_records: Vec<ChangeRecord>,
}

impl PlannedEntity {
    pub fn affected(&self) -> AffectedEntity {
        AffectedEntity {
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
            entity_name: self.entity_name.clone(),
            change_type: self.change_type,
            has_conflict: self.conflict.is_some(),
            conflict_type: self.conflict.as_ref().map(|c| c.conflict_type),
            resolution: None,
            conflicting_fields: self
                .conflict
                .as_ref()
                .map(|c| c.fields.iter().map(|f| f.field.clone()).collect())
                .unwrap_or_default(),
        }
    }
}

/// A full merge plan; the executor consumes it.
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub source: Branch,
    pub target: Branch,
    pub common_ancestor_id: String,
    pub divergence_seq: i64,
    /// Branches whose records count as source-side changes.
    pub source_side: Vec<String>,
    /// Branches whose records count as target-side changes.
    pub target_side: Vec<String>,
    /// Target-side records since the fork that never reached the source.
    pub target_change_count: usize,
    pub entities: Vec<PlannedEntity>,
    pub in_sync: Vec<SyncedEntity>,
}

impl MergePlan {
    pub fn conflicts(&self) -> impl Iterator<Item = &MergeConflict> {
        self.entities.iter().filter_map(|e| e.conflict.as_ref())
    }

    /// True when the target has no changes since divergence and nothing
    /// conflicts, so the source's records can be replayed as they are.
    pub fn can_fast_forward(&self) -> bool {
        self.target_change_count == 0 && self.conflicts().next().is_none()
    }

    pub fn preview(&self) -> MergePreview {
        let count = |kind: MergeChangeType| {
            self.entities
                .iter()
                .filter(|e| e.change_type == kind)
                .count()
        };
        MergePreview {
            source_branch_id: self.source.id.clone(),
            target_branch_id: self.target.id.clone(),
            common_ancestor_id: self.common_ancestor_id.clone(),
            divergence_seq: self.divergence_seq,
            added_count: count(MergeChangeType::Added),
            modified_count: count(MergeChangeType::Modified),
            deleted_count: count(MergeChangeType::Deleted),
            conflicts: self.conflicts().cloned().collect(),
            affected_entities: self.entities.iter().map(PlannedEntity::affected).collect(),
            can_fast_forward: self.can_fast_forward(),
            target_change_count: self.target_change_count,
        }
    }

    /// Keep only entities whose id is in `selected`.
    pub fn restrict_to(&mut self, selected: &HashSet<String>) {
        self.entities.retain(|e| selected.contains(&e.entity_id));
        self.in_sync.retain(|e| selected.contains(&e.entity_id));
    }

    /// Every entity a successful merge carries, with its pending records.
    pub fn carried(&self) -> impl Iterator<Item = (EntityType, &str, &[ChangeRecord])> {
        self.entities
            .iter()
            .map(|e| (e.entity_type, e.entity_id.as_str(), e.source_records.as_slice()))
            .chain(
                self.in_sync
                    .iter()
                    .map(|e| (e.entity_type, e.entity_id.as_str(), e.source_records.as_slice())),
            )
    }
}

pub struct MergePlanner<'c> {
    conn: &'c Connection,
    store: VersionStore<'c>,
}

impl<'c> MergePlanner<'c> {
    pub fn new(conn: &'c Connection, max_depth: usize) -> Self {
        Self {
            conn,
            store: VersionStore::new(conn, max_depth),
        }
    }

    pub fn preview(&self, source_id: &str, target_id: &str) -> Result<MergePreview, EngineError> {
        Ok(self.plan(source_id, target_id)?.preview())
    }

    pub fn plan(&self, source_id: &str, target_id: &str) -> Result<MergePlan, EngineError> {
        if source_id == target_id {
            return Err(EngineError::invalid("cannot merge a branch into itself"));
        }
        let branches = self.store.branches();
        let source = branches.get(source_id)?;
        let target = branches.get(target_id)?;
        if source.tenant_id != target.tenant_id {
            return Err(EngineError::invalid(
                "source and target belong to different tenants",
            ));
        }

        let ancestry = branches.common_ancestry(source_id, target_id)?;
        let fork_seq = match (ancestry.left_path.last(), ancestry.right_path.last()) {
            (Some(s), Some(t)) => s.base_seq.min(t.base_seq),
            (Some(s), None) => s.base_seq,
            (None, Some(t)) => t.base_seq,
            (None, None) => return Err(EngineError::invalid("cannot merge a branch into itself")),
        };
        let divergence_seq = fork_seq;

        let side = |path: &[Branch]| -> Vec<String> {
            if path.is_empty() {
                vec![ancestry.ancestor.id.clone()]
            } else {
                path.iter().map(|b| b.id.clone()).collect()
            }
        };
        let source_side = side(&ancestry.left_path);
        let target_side = side(&ancestry.right_path);

        let mut target_change_count = 0usize;
        for branch_id in &target_side {
            target_change_count += queries::count_unmerged_records(
                self.conn,
                branch_id,
                fork_seq,
                Some(source_id),
            )? as usize;
        }

        let mut seen = HashSet::new();
        let mut touched = Vec::new();
        for branch_id in &source_side {
            for key in queries::entities_touched_since(self.conn, branch_id, fork_seq)? {
                if seen.insert(key.clone()) {
                    touched.push(key);
                }
            }
        }

        let mut entities = Vec::new();
        let mut in_sync = Vec::new();
        for (entity_type, entity_id) in touched {
            let records =
                self.pending_records(&source_side, target_id, fork_seq, entity_type, &entity_id)?;
            let Some(first) = records.first() else {
                continue;
            };
            let base = first.before_data.clone();
            let src = self.store.current_state(entity_type, &entity_id, source_id)?;
            let tgt = self.store.current_state(entity_type, &entity_id, target_id)?;
            match classify(entity_type, &entity_id, base, src, tgt) {
                Some(mut planned) => {
                    debug!(
                        entity_type = %planned.entity_type,
                        entity_id = %planned.entity_id,
                        change_type = planned.change_type.as_str(),
                        conflict = ?planned.conflict.as_ref().map(|c| c.conflict_type),
                        pending = records.len(),
                        "classified entity"
                    );
                    planned.source_records = records;
                    entities.push(planned);
                }
                None => in_sync.push(SyncedEntity {
                    entity_type,
                    entity_id,
                    source_records: records,
                }),
            }
        }

        let plan = MergePlan {
            common_ancestor_id: ancestry.ancestor.id.clone(),
            source,
            target,
            divergence_seq,
            source_side,
            target_side,
            target_change_count,
            entities,
            in_sync,
        };
        info!(
            source = %plan.source.name,
            target = %plan.target.name,
            divergence_seq,
            entities = plan.entities.len(),
            conflicts = plan.conflicts().count(),
            target_changes = target_change_count,
            "planned merge"
        );
        Ok(plan)
    }

    /// Source-side records for one entity above the fork point and above
    /// each branch's merge mark into `target_id`, oldest first.
    fn pending_records(
        &self,
        source_side: &[String],
        target_id: &str,
        fork_seq: i64,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<ChangeRecord>, EngineError> {
        let mut records = Vec::new();
        for branch_id in source_side {
            let mark = queries::merge_mark(self.conn, branch_id, target_id, entity_type, entity_id)?;
            let since = mark.map_or(fork_seq, |m| m.max(fork_seq));
            records.extend(self.store.chain_after(entity_type, entity_id, branch_id, since)?);
        }
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }
}

/// Classify one entity given its base, source and target states.
///
/// Returns `None` when the source did not change it or both sides already
/// agree.
pub fn classify(
    entity_type: EntityType,
    entity_id: &str,
    base: Option<Record>,
    source: Option<Record>,
    target: Option<Record>,
) -> Option<PlannedEntity> {
    let source_changes = diff::diff(base.as_ref(), source.as_ref());
    if source_changes.is_empty() || source == target {
        return None;
    }
    let target_changes = diff::diff(base.as_ref(), target.as_ref());

    let change_type = match (&base, &source) {
        (None, _) => MergeChangeType::Added,
        (_, None) => MergeChangeType::Deleted,
        _ => MergeChangeType::Modified,
    };
    let entity_name = entity_display_name(source.as_ref())
        .or_else(|| entity_display_name(target.as_ref()))
        .or_else(|| entity_display_name(base.as_ref()));

    let conflict_type = if target_changes.is_empty() {
        None
    } else {
        match (&base, &source, &target) {
            (None, Some(_), Some(_)) => Some(ConflictType::CreationConflict),
            (_, None, Some(_)) | (_, Some(_), None) => Some(ConflictType::DeletionConflict),
            (_, None, None) => return None,
            (Some(_), Some(s), Some(t)) => {
                let overlapping = source_changes
                    .keys()
                    .filter(|f| target_changes.contains_key(*f))
                    .any(|f| s.get(f) != t.get(f));
                overlapping.then_some(ConflictType::FieldConflict)
            }
        }
    };

    let conflict = conflict_type.map(|conflict_type| {
        let fields = conflicting_fields(
            conflict_type,
            base.as_ref(),
            source.as_ref(),
            target.as_ref(),
            &source_changes,
            &target_changes,
        );
        MergeConflict {
            entity_type,
            entity_id: entity_id.to_string(),
            entity_name: entity_name.clone(),
            conflict_type,
            fields,
            base_data: base.clone(),
            source_data: source.clone(),
            target_data: target.clone(),
        }
    });

    Some(PlannedEntity {
        entity_type,
        entity_id: entity_id.to_string(),
        entity_name,
        change_type,
        base,
        source,
        target,
        source_changes,
        target_changes,
        conflict,
        source_records: Vec::new(),
    })
}

fn conflicting_fields(
    conflict_type: ConflictType,
    base: Option<&Record>,
    source: Option<&Record>,
    target: Option<&Record>,
    source_changes: &FieldChanges,
    target_changes: &FieldChanges,
) -> Vec<FieldConflict> {
    let value = |record: Option<&Record>, field: &str| record.and_then(|r| r.get(field)).cloned();

    let fields: Vec<&String> = match conflict_type {
        // The surviving side's edits are what the deletion would discard.
        ConflictType::DeletionConflict if source.is_none() => target_changes.keys().collect(),
        ConflictType::DeletionConflict => source_changes.keys().collect(),
        ConflictType::FieldConflict | ConflictType::CreationConflict => source_changes
            .keys()
            .filter(|f| target_changes.contains_key(*f))
            .filter(|f| value(source, f.as_str()) != value(target, f.as_str()))
            .collect(),
    };

    fields
        .into_iter()
        .map(|field| FieldConflict {
            field: field.clone(),
            base: value(base, field.as_str()),
            source: value(source, field.as_str()),
            target: value(target, field.as_str()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Option<Record> {
        value.as_object().cloned()
    }

    fn plan(
        base: Option<Record>,
        source: Option<Record>,
        target: Option<Record>,
    ) -> Option<PlannedEntity> {
        classify(EntityType::Rule, "R1", base, source, target)
    }

    #[test]
    fn test_source_only_modification() {
        let base = record(json!({"name": "A", "active": true}));
        let src = record(json!({"name": "A", "active": false}));
        let p = plan(base.clone(), src, base).unwrap();
        assert_eq!(p.change_type, MergeChangeType::Modified);
        assert!(p.conflict.is_none());
        assert_eq!(p.entity_name.as_deref(), Some("A"));
    }

    #[test]
    fn test_source_only_add_and_delete() {
        let added = plan(None, record(json!({"name": "N"})), None).unwrap();
        assert_eq!(added.change_type, MergeChangeType::Added);

        let base = record(json!({"name": "A"}));
        let deleted = plan(base.clone(), None, base).unwrap();
        assert_eq!(deleted.change_type, MergeChangeType::Deleted);
        assert!(deleted.conflict.is_none());
    }

    #[test]
    fn test_unchanged_or_identical_is_skipped() {
        let base = record(json!({"name": "A"}));
        let tgt = record(json!({"name": "B"}));
        assert!(plan(base.clone(), base.clone(), tgt.clone()).is_none());
        assert!(plan(base, tgt.clone(), tgt).is_none());
        assert!(plan(None, None, None).is_none());
    }

    #[test]
    fn test_field_conflict_on_overlap() {
        let base = record(json!({"name": "A", "active": true}));
        let src = record(json!({"name": "A2", "active": true}));
        let tgt = record(json!({"name": "A-main", "active": true}));
        let p = plan(base, src, tgt).unwrap();
        let conflict = p.conflict.unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::FieldConflict);
        assert_eq!(conflict.fields.len(), 1);
        assert_eq!(conflict.fields[0].field, "name");
        assert_eq!(conflict.fields[0].base, Some(json!("A")));
        assert_eq!(conflict.fields[0].source, Some(json!("A2")));
        assert_eq!(conflict.fields[0].target, Some(json!("A-main")));
    }

    #[test]
    fn test_disjoint_and_agreeing_edits_merge_cleanly() {
        let base = record(json!({"name": "A", "active": true, "owner": "x"}));
        let src = record(json!({"name": "A2", "active": true, "owner": "y"}));
        let tgt = record(json!({"name": "A", "active": false, "owner": "y"}));
        let p = plan(base, src, tgt).unwrap();
        assert!(p.conflict.is_none());
        assert_eq!(p.change_type, MergeChangeType::Modified);
    }

    #[test]
    fn test_deletion_conflict() {
        let base = record(json!({"name": "A", "active": true}));
        let src = record(json!({"name": "A", "active": false}));
        let p = plan(base.clone(), None, src.clone()).unwrap();
        let conflict = p.conflict.unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::DeletionConflict);
        assert_eq!(p.change_type, MergeChangeType::Deleted);
        assert_eq!(conflict.fields[0].field, "active");

        let p = plan(base, src, None).unwrap();
        assert_eq!(
            p.conflict.unwrap().conflict_type,
            ConflictType::DeletionConflict
        );
    }

    #[test]
    fn test_creation_conflict() {
        let src = record(json!({"name": "N", "active": true}));
        let tgt = record(json!({"name": "M", "active": true}));
        let p = plan(None, src, tgt).unwrap();
        assert_eq!(p.change_type, MergeChangeType::Added);
        let conflict = p.conflict.unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::CreationConflict);
        let fields: Vec<_> = conflict.fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(fields, vec!["name"]);
    }

    #[test]
    fn test_affected_entity_lists_conflicting_fields() {
        let base = record(json!({"name": "A"}));
        let p = plan(base, record(json!({"name": "B"})), record(json!({"name": "C"}))).unwrap();
        let affected = p.affected();
        assert!(affected.has_conflict);
        assert_eq!(affected.conflict_type, Some(ConflictType::FieldConflict));
        assert_eq!(affected.conflicting_fields, vec!["name".to_string()]);
    }
}
