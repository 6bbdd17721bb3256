//! Merge execution.
//!
//! All strategies share [`plan_apply`], which turns a plan into one final
//! state per entity under the chosen conflict resolution policy. The
//! strategy only decides how those states are written: replayed record by
//! record ([`ApplyMode::Replay`]) or committed as one `MERGE` record per
//! entity ([`ApplyMode::Commit`]).
//!
//! The executor runs inside the caller's transaction. Any error, including
//! cancellation, leaves no trace once the transaction rolls back.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cancel::{CancellationToken, Checkpoint};
use crate::db::queries;
use crate::diff;
use crate::errors::{ConflictError, EngineError};
use crate::models::{
    AffectedEntity, ChangeType, ConflictResolution, ConflictType, EntityType, MergeEvent,
    MergeStrategy, Record,
};
use crate::version_store::{NewChange, VersionStore};

use super::planner::{MergePlan, MergePlanner, PlannedEntity};

/// Caller-supplied final state for one conflicted entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManualResolution {
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    pub entity_id: String,
    /// `None` resolves the conflict by deleting the entity on the target.
    #[serde(default)]
    pub resolved: Option<Record>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub source_branch_id: String,
    pub target_branch_id: String,
    #[serde(default)]
    pub strategy: MergeStrategy,
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub author_id: String,
    #[serde(default, alias = "selectedChanges")]
    pub selected_entity_ids: Vec<String>,
    #[serde(default)]
    pub resolutions: Vec<ManualResolution>,
}

/// How resolved states are written to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Re-append the source's own records in order.
    Replay,
    /// One `MERGE` record per entity; `squash` folds source messages in.
    Commit { squash: bool },
}

/// The resolved outcome for one planned entity.
#[derive(Debug, Clone)]
pub struct Outcome<'p> {
    pub entity: &'p PlannedEntity,
    pub result: Option<Record>,
    pub resolution: Option<ConflictResolution>,
}

impl Outcome<'_> {
    fn affected(&self) -> AffectedEntity {
        AffectedEntity {
            resolution: self.resolution,
            ..self.entity.affected()
        }
    }
}

/// Resolve every planned entity to its final target state.
///
/// Fails with [`ConflictError::Conflicts`] under `ABORT_ON_CONFLICT` if any
/// entity conflicts, and with [`ConflictError::Unresolved`] under `MANUAL`
/// if a conflicted entity has no resolution.
pub fn plan_apply<'p>(
    entities: &'p [PlannedEntity],
    policy: ConflictResolution,
    manual: &[ManualResolution],
) -> Result<Vec<Outcome<'p>>, EngineError> {
    let conflicts: Vec<_> = entities.iter().filter_map(|e| e.conflict.clone()).collect();
    if policy == ConflictResolution::AbortOnConflict && !conflicts.is_empty() {
        return Err(ConflictError::Conflicts { conflicts }.into());
    }

    let mut outcomes = Vec::with_capacity(entities.len());
    let mut unresolved = Vec::new();

    for entity in entities {
        let Some(conflict) = &entity.conflict else {
            outcomes.push(Outcome {
                entity,
                result: clean_result(entity),
                resolution: None,
            });
            continue;
        };

        let result = match policy {
            ConflictResolution::AbortOnConflict => {
                return Err(ConflictError::Conflicts {
                    conflicts: conflicts.clone(),
                }
                .into())
            }
            ConflictResolution::Manual => {
                let found = manual.iter().find(|r| {
                    r.entity_id == entity.entity_id
                        && r.entity_type.map_or(true, |t| t == entity.entity_type)
                });
                match found {
                    Some(r) => r.resolved.clone(),
                    None => {
                        unresolved.push(entity.entity_id.clone());
                        continue;
                    }
                }
            }
            ConflictResolution::FavorSource | ConflictResolution::FavorTarget => {
                let favor_source = policy == ConflictResolution::FavorSource;
                match conflict.conflict_type {
                    ConflictType::DeletionConflict => {
                        if favor_source {
                            entity.source.clone()
                        } else {
                            entity.target.clone()
                        }
                    }
                    ConflictType::FieldConflict | ConflictType::CreationConflict => {
                        let contested: HashSet<&str> =
                            conflict.fields.iter().map(|f| f.field.as_str()).collect();
                        let patch = entity
                            .source_changes
                            .iter()
                            .filter(|(field, _)| favor_source || !contested.contains(field.as_str()))
                            .map(|(field, change)| (field.clone(), change.clone()))
                            .collect();
                        Some(diff::apply(entity.target.as_ref(), &patch))
                    }
                }
            }
        };
        outcomes.push(Outcome {
            entity,
            result,
            resolution: Some(policy),
        });
    }

    if !unresolved.is_empty() {
        return Err(ConflictError::Unresolved {
            entity_ids: unresolved,
            conflicts,
        }
        .into());
    }
    Ok(outcomes)
}

/// Result for an entity without conflict: the target plus the source's patch.
fn clean_result(entity: &PlannedEntity) -> Option<Record> {
    entity.source.as_ref()?;
    Some(diff::apply(entity.target.as_ref(), &entity.source_changes))
}

pub struct MergeExecutor<'c> {
    conn: &'c Connection,
    planner: MergePlanner<'c>,
    store: VersionStore<'c>,
    cancel: CancellationToken,
}

impl<'c> MergeExecutor<'c> {
    pub fn new(conn: &'c Connection, max_depth: usize, cancel: CancellationToken) -> Self {
        Self {
            conn,
            planner: MergePlanner::new(conn, max_depth),
            store: VersionStore::new(conn, max_depth),
            cancel,
        }
    }

    pub fn merge(&self, request: &MergeRequest) -> Result<MergeEvent, EngineError> {
        if request.author_id.trim().is_empty() {
            return Err(EngineError::invalid("merge author must not be empty"));
        }
        let mut plan = self
            .planner
            .plan(&request.source_branch_id, &request.target_branch_id)?;
        if plan.target.is_locked {
            return Err(EngineError::invalid(format!(
                "branch '{}' is locked",
                plan.target.name
            )));
        }

        if request.strategy == MergeStrategy::Selective {
            if request.selected_entity_ids.is_empty() {
                return Err(EngineError::invalid(
                    "a selective merge needs at least one selected entity",
                ));
            }
            let selected: HashSet<String> = request.selected_entity_ids.iter().cloned().collect();
            plan.restrict_to(&selected);
        } else if !request.selected_entity_ids.is_empty() {
            return Err(EngineError::invalid(format!(
                "entity selection requires the SELECTIVE strategy, not {}",
                request.strategy.as_str()
            )));
        }

        let (strategy, mode) = match request.strategy {
            MergeStrategy::Auto if plan.can_fast_forward() => {
                (MergeStrategy::FastForward, ApplyMode::Replay)
            }
            MergeStrategy::Auto => (MergeStrategy::ThreeWay, ApplyMode::Commit { squash: false }),
            MergeStrategy::FastForward => {
                if !plan.can_fast_forward() {
                    return Err(ConflictError::NotFastForwardable {
                        target_branch_id: plan.target.id.clone(),
                        target_changes: plan.target_change_count,
                    }
                    .into());
                }
                (MergeStrategy::FastForward, ApplyMode::Replay)
            }
            MergeStrategy::ThreeWay => (MergeStrategy::ThreeWay, ApplyMode::Commit { squash: false }),
            MergeStrategy::Squash => (MergeStrategy::Squash, ApplyMode::Commit { squash: true }),
            MergeStrategy::Selective => {
                (MergeStrategy::Selective, ApplyMode::Commit { squash: false })
            }
        };

        let outcomes = plan_apply(&plan.entities, request.conflict_resolution, &request.resolutions)?;

        let event_id = Uuid::new_v4().to_string();
        let message = request.message.clone().unwrap_or_else(|| {
            format!("Merge {} into {}", plan.source.name, plan.target.name)
        });

        let mut record_shas = Vec::new();
        for outcome in &outcomes {
            self.cancel.checkpoint()?;
            let written = match mode {
                ApplyMode::Replay => self.replay(&plan, outcome, &event_id, &request.author_id)?,
                ApplyMode::Commit { squash } => {
                    self.commit(&plan, outcome, &event_id, &request.author_id, &message, squash)?
                }
            };
            record_shas.extend(written);
        }

        self.cancel.checkpoint()?;
        let created_at = Utc::now();
        let mut event = MergeEvent {
            id: event_id,
            sha: String::new(),
            source_branch_id: plan.source.id.clone(),
            target_branch_id: plan.target.id.clone(),
            strategy,
            conflict_resolution: request.conflict_resolution,
            message,
            author_id: request.author_id.clone(),
            created_at,
            affected_entities: outcomes.iter().map(Outcome::affected).collect(),
            fast_forward: mode == ApplyMode::Replay,
            watermark_seq: queries::current_seq(self.conn)?,
        };
        event.sha = event_sha(&event, &record_shas);
        queries::insert_merge_event(self.conn, &event)?;
        self.record_marks(&plan, &event.id)?;

        info!(
            merge_event_id = %event.id,
            source = %plan.source.name,
            target = %plan.target.name,
            strategy = strategy.as_str(),
            resolution = request.conflict_resolution.as_str(),
            affected = event.affected_entities.len(),
            records = record_shas.len(),
            "merge applied"
        );
        Ok(event)
    }

    /// Re-append the source's records, then converge on the planned state if
    /// the replay alone does not reach it.
    fn replay(
        &self,
        plan: &MergePlan,
        outcome: &Outcome<'_>,
        event_id: &str,
        merge_author: &str,
    ) -> Result<Vec<String>, EngineError> {
        let entity = outcome.entity;
        let target_id = &plan.target.id;
        let mut shas = Vec::new();

        for source in &entity.source_records {
            let before = self
                .store
                .current_state(entity.entity_type, &entity.entity_id, target_id)?;
            if before == source.after_data {
                continue;
            }
            let change_type = match (&before, &source.after_data, source.change_type) {
                (None, Some(_), ChangeType::Update) => ChangeType::Create,
                (Some(_), Some(_), ChangeType::Create) => ChangeType::Update,
                (_, _, kind) => kind,
            };
            let record = self.store.append(
                NewChange::new(
                    entity.entity_type,
                    &entity.entity_id,
                    target_id,
                    change_type,
                    before,
                    source.after_data.clone(),
                    source.author_id.clone(),
                )
                .message(source.message.clone())
                .merge_event(event_id, false),
            )?;
            shas.push(record.sha);
        }

        let reached = self
            .store
            .current_state(entity.entity_type, &entity.entity_id, target_id)?;
        if reached != outcome.result {
            let record = self.store.append(
                NewChange::new(
                    entity.entity_type,
                    &entity.entity_id,
                    target_id,
                    ChangeType::Merge,
                    reached,
                    outcome.result.clone(),
                    merge_author,
                )
                .merge_event(event_id, false),
            )?;
            shas.push(record.sha);
        }
        Ok(shas)
    }

    fn commit(
        &self,
        plan: &MergePlan,
        outcome: &Outcome<'_>,
        event_id: &str,
        author_id: &str,
        message: &str,
        squash: bool,
    ) -> Result<Vec<String>, EngineError> {
        let entity = outcome.entity;
        if outcome.result == entity.target {
            debug!(entity_id = %entity.entity_id, "merge result equals target, nothing to write");
            return Ok(Vec::new());
        }

        let message = if squash {
            let sources = &entity.source_records;
            let notes: Vec<&str> = sources.iter().filter_map(|r| r.message.as_deref()).collect();
            if notes.is_empty() {
                format!("{message} (squashed {} change(s))", sources.len())
            } else {
                format!(
                    "{message} (squashed {} change(s): {})",
                    sources.len(),
                    notes.join("; ")
                )
            }
        } else {
            message.to_string()
        };

        let record = self.store.append(
            NewChange::new(
                entity.entity_type,
                &entity.entity_id,
                &plan.target.id,
                ChangeType::Merge,
                entity.target.clone(),
                outcome.result.clone(),
                author_id,
            )
            .message(Some(message))
            .merge_event(event_id, outcome.resolution.is_some()),
        )?;
        Ok(vec![record.sha])
    }

    /// Mark what this merge carried so later merges skip it. When source and
    /// target end up equal, the target's head is marked for the reverse
    /// direction as well.
    fn record_marks(&self, plan: &MergePlan, event_id: &str) -> Result<(), EngineError> {
        for (entity_type, entity_id, records) in plan.carried() {
            let mut heads: BTreeMap<&str, i64> = BTreeMap::new();
            for record in records {
                let seq = heads.entry(record.branch_id.as_str()).or_insert(record.seq);
                *seq = (*seq).max(record.seq);
            }
            for (branch_id, seq) in heads {
                queries::upsert_merge_mark(
                    self.conn,
                    branch_id,
                    &plan.target.id,
                    entity_type,
                    entity_id,
                    seq,
                    event_id,
                )?;
            }

            let target = self.store.current_state(entity_type, entity_id, &plan.target.id)?;
            let source = self.store.current_state(entity_type, entity_id, &plan.source.id)?;
            if target != source {
                continue;
            }
            if let Some(head) =
                queries::chain_head(self.conn, entity_type, entity_id, &plan.target.id, None)?
            {
                queries::upsert_merge_mark(
                    self.conn,
                    &plan.target.id,
                    &plan.source.id,
                    entity_type,
                    entity_id,
                    head.seq,
                    event_id,
                )?;
            }
        }
        Ok(())
    }
}

fn event_sha(event: &MergeEvent, record_shas: &[String]) -> String {
    let mut hasher = Sha256::new();
    for part in [
        event.id.as_str(),
        event.source_branch_id.as_str(),
        event.target_branch_id.as_str(),
        event.strategy.as_str(),
        event.conflict_resolution.as_str(),
        event.author_id.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    for sha in record_shas {
        hasher.update(sha.as_bytes());
    }
    hasher.update(event.created_at.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::planner::classify;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Option<Record> {
        value.as_object().cloned()
    }

    fn field_conflict() -> PlannedEntity {
        classify(
            EntityType::Rule,
            "R1",
            record(json!({"name": "A", "active": true, "owner": "x"})),
            record(json!({"name": "A2", "active": true, "owner": "y"})),
            record(json!({"name": "A-main", "active": false, "owner": "x"})),
        )
        .unwrap()
    }

    #[test]
    fn test_abort_on_conflict_returns_structured_conflicts() {
        let entities = vec![field_conflict()];
        let err = plan_apply(&entities, ConflictResolution::AbortOnConflict, &[]).unwrap_err();
        match err {
            EngineError::Conflict(ConflictError::Conflicts { conflicts }) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].fields[0].field, "name");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_favor_source_unions_non_conflicting_changes() {
        let entities = vec![field_conflict()];
        let outcomes = plan_apply(&entities, ConflictResolution::FavorSource, &[]).unwrap();
        assert_eq!(
            outcomes[0].result,
            record(json!({"name": "A2", "active": false, "owner": "y"}))
        );
        assert_eq!(outcomes[0].resolution, Some(ConflictResolution::FavorSource));
    }

    #[test]
    fn test_favor_target_keeps_target_on_contested_fields() {
        let entities = vec![field_conflict()];
        let outcomes = plan_apply(&entities, ConflictResolution::FavorTarget, &[]).unwrap();
        assert_eq!(
            outcomes[0].result,
            record(json!({"name": "A-main", "active": false, "owner": "y"}))
        );
    }

    #[test]
    fn test_manual_requires_every_conflict_resolved() {
        let entities = vec![field_conflict()];
        let err = plan_apply(&entities, ConflictResolution::Manual, &[]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Conflict(ConflictError::Unresolved { ref entity_ids, .. })
                if entity_ids == &vec!["R1".to_string()]
        ));

        let manual = vec![ManualResolution {
            entity_type: Some(EntityType::Rule),
            entity_id: "R1".into(),
            resolved: record(json!({"name": "picked"})),
        }];
        let outcomes = plan_apply(&entities, ConflictResolution::Manual, &manual).unwrap();
        assert_eq!(outcomes[0].result, record(json!({"name": "picked"})));
    }

    #[test]
    fn test_deletion_conflict_picks_whole_side() {
        let entities = vec![classify(
            EntityType::Rule,
            "R1",
            record(json!({"name": "A"})),
            None,
            record(json!({"name": "B"})),
        )
        .unwrap()];
        let source = plan_apply(&entities, ConflictResolution::FavorSource, &[]).unwrap();
        assert_eq!(source[0].result, None);
        let target = plan_apply(&entities, ConflictResolution::FavorTarget, &[]).unwrap();
        assert_eq!(target[0].result, record(json!({"name": "B"})));
    }

    #[test]
    fn test_clean_entities_ignore_policy() {
        let entities = vec![classify(
            EntityType::Rule,
            "R1",
            record(json!({"name": "A", "active": true})),
            record(json!({"name": "A", "active": false})),
            record(json!({"name": "A", "active": true})),
        )
        .unwrap()];
        let outcomes = plan_apply(&entities, ConflictResolution::AbortOnConflict, &[]).unwrap();
        assert_eq!(outcomes[0].result, record(json!({"name": "A", "active": false})));
        assert_eq!(outcomes[0].resolution, None);
        assert!(!outcomes[0].affected().has_conflict);
    }
}
