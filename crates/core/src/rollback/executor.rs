//! Rollback execution.
//!
//! Additive rollbacks never rewrite history: they append `ROLLBACK` records
//! that move each entity back to its pre-merge state. [`DirectRollback`] is
//! the one exception and has its own entry point that must be confirmed.

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::{CancellationToken, Checkpoint};
use crate::db::queries::{self, RollbackEntry};
use crate::errors::EngineError;
use crate::models::{ChangeRecord, ChangeType, EntityType, Record, RollbackResult, RollbackStrategy};
use crate::version_store::{NewChange, VersionStore};

use super::planner::{short_sha, MergedEntity, RevertAnalysis, RollbackPlanner};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub merge_event_id: String,
    #[serde(default)]
    pub strategy: RollbackStrategy,
    /// Restricts the rollback to these entities; required for
    /// `SELECTIVE_REVERT`.
    #[serde(default, alias = "selectedEntities")]
    pub entity_ids: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub author_id: String,
    /// Only meaningful for `DIRECT_ROLLBACK`.
    #[serde(default)]
    pub confirm_irreversible: bool,
}

/// Physically delete a merge's records from the target chains.
///
/// Unlike every other write this destroys history, so it only runs when
/// `confirm_irreversible` is set. Later edits on the affected chains are
/// deleted with it; the result reports them as blockers with `forced` set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectRollback {
    pub merge_event_id: String,
    #[serde(default)]
    pub entity_ids: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub author_id: String,
    #[serde(default)]
    pub confirm_irreversible: bool,
}

impl From<RollbackRequest> for DirectRollback {
    fn from(request: RollbackRequest) -> Self {
        Self {
            merge_event_id: request.merge_event_id,
            entity_ids: request.entity_ids,
            message: request.message,
            author_id: request.author_id,
            confirm_irreversible: request.confirm_irreversible,
        }
    }
}

/// Restore one entity on one branch to an earlier version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointRollbackRequest {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub branch_id: String,
    pub target_version_sha: String,
    #[serde(default)]
    pub author_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

pub struct RollbackExecutor<'c> {
    conn: &'c Connection,
    planner: RollbackPlanner<'c>,
    store: VersionStore<'c>,
    cancel: CancellationToken,
}

impl<'c> RollbackExecutor<'c> {
    pub fn new(conn: &'c Connection, max_depth: usize, cancel: CancellationToken) -> Self {
        Self {
            conn,
            planner: RollbackPlanner::new(conn, max_depth),
            store: VersionStore::new(conn, max_depth),
            cancel,
        }
    }

    /// Revert a merge by appending `ROLLBACK` records.
    pub fn rollback(&self, request: &RollbackRequest) -> Result<RollbackResult, EngineError> {
        require_author(&request.author_id)?;
        let analysis = self.planner.analyze(&request.merge_event_id)?;

        match request.strategy {
            RollbackStrategy::DirectRollback => Err(EngineError::invalid(
                "DIRECT_ROLLBACK deletes history and must go through the confirmed direct rollback operation",
            )),
            RollbackStrategy::CreateRevertCommit | RollbackStrategy::SelectiveRevert => {
                self.revert(&analysis, request)
            }
            RollbackStrategy::RestoreToPoint => self.restore_to_point(&analysis, request),
        }
    }

    fn revert(
        &self,
        analysis: &RevertAnalysis,
        request: &RollbackRequest,
    ) -> Result<RollbackResult, EngineError> {
        if request.strategy == RollbackStrategy::SelectiveRevert && request.entity_ids.is_empty() {
            return Err(EngineError::invalid(
                "a selective revert needs at least one entity id",
            ));
        }
        let selected = select(analysis, &request.entity_ids)?;

        let mut skipped = Vec::new();
        let mut pending = Vec::new();
        for entity in selected {
            if analysis.reverted.contains(&entity.entity_id) {
                skipped.push(entity.entity_id.clone());
            } else {
                pending.push(entity);
            }
        }
        if pending.is_empty() {
            return Err(EngineError::invalid(format!(
                "merge {} has nothing left to revert",
                analysis.event.id
            )));
        }

        let blockers = self.planner.blockers(&analysis.event, pending.iter().copied())?;
        if !blockers.is_empty() {
            return Err(EngineError::BlockedRollback { blockers });
        }

        let rollback_id = Uuid::new_v4().to_string();
        let message = request
            .message
            .clone()
            .unwrap_or_else(|| format!("Revert merge {}", short_sha(&analysis.event.sha)));
        let branch_id = &analysis.event.target_branch_id;

        let mut records = Vec::new();
        let mut reverted = Vec::new();
        for entity in pending {
            self.cancel.checkpoint()?;
            let target = entity.first.before_data.clone();
            if let Some(record) = self.write_inverse(
                entity.entity_type,
                &entity.entity_id,
                branch_id,
                target,
                &request.author_id,
                &message,
                &rollback_id,
            )? {
                records.push(record);
            }
            reverted.push(entity.entity_id.clone());
        }

        self.finish(Finish {
            rollback_id,
            merge_event_id: Some(analysis.event.id.clone()),
            branch_id,
            strategy: request.strategy,
            message,
            author_id: &request.author_id,
            records,
            reverted,
            skipped,
            forced: false,
            irreversible: false,
            blockers: Vec::new(),
        })
    }

    /// Restore every entity touched since just before the merge. Later edits
    /// do not block this strategy: they are overwritten and come back as
    /// blockers on a `forced` result.
    fn restore_to_point(
        &self,
        analysis: &RevertAnalysis,
        request: &RollbackRequest,
    ) -> Result<RollbackResult, EngineError> {
        let event = &analysis.event;
        let point = analysis
            .entities
            .iter()
            .map(|e| e.first.seq - 1)
            .min()
            .unwrap_or(event.watermark_seq);
        let branch_id = &event.target_branch_id;

        let mut touched = queries::entities_touched_since(self.conn, branch_id, point)?;
        if !request.entity_ids.is_empty() {
            touched.retain(|(_, id)| request.entity_ids.contains(id));
        }

        let rollback_id = Uuid::new_v4().to_string();
        let message = request
            .message
            .clone()
            .unwrap_or_else(|| format!("Restore to before merge {}", short_sha(&event.sha)));

        let mut blockers = Vec::new();
        for (entity_type, entity_id) in &touched {
            let name = analysis.entity(entity_id).and_then(|e| e.entity_name.as_deref());
            blockers.extend(
                self.planner
                    .edits_after(event, *entity_type, entity_id, name, point)?,
            );
        }
        let forced = !blockers.is_empty();
        if forced {
            warn!(
                merge_event_id = %event.id,
                blockers = blockers.len(),
                "restore to point overwrites later changes"
            );
        }

        let mut records = Vec::new();
        let mut reverted = Vec::new();
        for (entity_type, entity_id) in touched {
            self.cancel.checkpoint()?;
            let target = self.store.state_at(entity_type, &entity_id, branch_id, point)?;
            if let Some(record) = self.write_inverse(
                entity_type,
                &entity_id,
                branch_id,
                target,
                &request.author_id,
                &message,
                &rollback_id,
            )? {
                records.push(record);
            }
            reverted.push(entity_id);
        }

        self.finish(Finish {
            rollback_id,
            merge_event_id: Some(event.id.clone()),
            branch_id,
            strategy: RollbackStrategy::RestoreToPoint,
            message,
            author_id: &request.author_id,
            records,
            reverted,
            skipped: Vec::new(),
            forced,
            irreversible: false,
            blockers,
        })
    }

    /// Delete the merge's records, and everything after them, from the
    /// target chains.
    pub fn direct_rollback(&self, request: &DirectRollback) -> Result<RollbackResult, EngineError> {
        require_author(&request.author_id)?;
        if !request.confirm_irreversible {
            return Err(EngineError::invalid(
                "direct rollback permanently deletes history; set confirmIrreversible to proceed",
            ));
        }
        let analysis = self.planner.analyze(&request.merge_event_id)?;
        let branch = self.store.branch(&analysis.event.target_branch_id)?;
        if branch.is_locked {
            return Err(EngineError::invalid(format!(
                "branch '{}' is locked",
                branch.name
            )));
        }

        let pending: Vec<&MergedEntity> = select(&analysis, &request.entity_ids)?
            .into_iter()
            .filter(|e| !analysis.reverted.contains(&e.entity_id))
            .collect();
        if pending.is_empty() {
            return Err(EngineError::invalid(format!(
                "merge {} has nothing left to revert",
                analysis.event.id
            )));
        }

        let blockers = self.planner.blockers(&analysis.event, pending.iter().copied())?;
        let forced = !blockers.is_empty();
        if forced {
            warn!(
                merge_event_id = %analysis.event.id,
                blockers = blockers.len(),
                "direct rollback discards later changes"
            );
        }

        let mut removed = 0usize;
        let mut reverted = Vec::new();
        for entity in pending {
            self.cancel.checkpoint()?;
            removed += queries::delete_chain_from(
                self.conn,
                entity.entity_type,
                &entity.entity_id,
                &branch.id,
                entity.first.seq,
            )?;
            // The source edits are pending again.
            queries::delete_merge_marks(
                self.conn,
                &analysis.event.id,
                entity.entity_type,
                &entity.entity_id,
            )?;
            reverted.push(entity.entity_id.clone());
        }
        let delta = i64::try_from(removed).unwrap_or(i64::MAX);
        queries::record_branch_activity(self.conn, &branch.id, -delta, Utc::now())?;

        let message = request.message.clone().unwrap_or_else(|| {
            format!("Direct rollback of merge {}", short_sha(&analysis.event.sha))
        });
        self.finish(Finish {
            rollback_id: Uuid::new_v4().to_string(),
            merge_event_id: Some(analysis.event.id.clone()),
            branch_id: &branch.id,
            strategy: RollbackStrategy::DirectRollback,
            message,
            author_id: &request.author_id,
            records: Vec::new(),
            reverted,
            skipped: Vec::new(),
            forced,
            irreversible: true,
            blockers,
        })
    }

    /// Point rollback: make a visible earlier version of one entity current
    /// again.
    pub fn restore_version(
        &self,
        request: &PointRollbackRequest,
    ) -> Result<RollbackResult, EngineError> {
        require_author(&request.author_id)?;
        let history = self.store.history(
            request.entity_type,
            &request.entity_id,
            &request.branch_id,
            None,
            true,
        )?;
        let version = history
            .into_iter()
            .find(|r| r.sha == request.target_version_sha)
            .ok_or_else(|| EngineError::not_found("version", &request.target_version_sha))?;

        let rollback_id = Uuid::new_v4().to_string();
        let message = request.reason.clone().unwrap_or_else(|| {
            format!(
                "Restore {} {} to {}",
                request.entity_type,
                request.entity_id,
                short_sha(&version.sha)
            )
        });

        let mut records = Vec::new();
        let mut skipped = Vec::new();
        self.cancel.checkpoint()?;
        match self.write_inverse(
            request.entity_type,
            &request.entity_id,
            &request.branch_id,
            version.after_data,
            &request.author_id,
            &message,
            &rollback_id,
        )? {
            Some(record) => records.push(record),
            None => skipped.push(request.entity_id.clone()),
        }

        self.finish(Finish {
            rollback_id,
            merge_event_id: None,
            branch_id: &request.branch_id,
            strategy: RollbackStrategy::RestoreToPoint,
            message,
            author_id: &request.author_id,
            records,
            reverted: vec![request.entity_id.clone()],
            skipped,
            forced: false,
            irreversible: false,
            blockers: Vec::new(),
        })
    }

    /// Append a `ROLLBACK` record moving the entity to `target`, unless it is
    /// already there.
    #[allow(clippy::too_many_arguments)]
    fn write_inverse(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        branch_id: &str,
        target: Option<Record>,
        author_id: &str,
        message: &str,
        rollback_id: &str,
    ) -> Result<Option<ChangeRecord>, EngineError> {
        let current = self.store.current_state(entity_type, entity_id, branch_id)?;
        if current == target {
            return Ok(None);
        }
        let change = NewChange::new(
            entity_type,
            entity_id,
            branch_id,
            ChangeType::Rollback,
            current,
            target,
            author_id,
        )
        .message(Some(message.to_string()))
        .rollback(rollback_id);
        self.store.append(change).map(Some)
    }

    fn finish(&self, done: Finish<'_>) -> Result<RollbackResult, EngineError> {
        self.cancel.checkpoint()?;
        let created_at = Utc::now();
        queries::insert_rollback(
            self.conn,
            &RollbackEntry {
                id: done.rollback_id.clone(),
                merge_event_id: done.merge_event_id.clone(),
                branch_id: done.branch_id.to_string(),
                strategy: done.strategy,
                message: done.message.clone(),
                author_id: done.author_id.to_string(),
                forced: done.forced,
                entity_ids: done.reverted.clone(),
                created_at,
            },
        )?;

        info!(
            rollback_id = %done.rollback_id,
            merge_event_id = done.merge_event_id.as_deref().unwrap_or("-"),
            strategy = done.strategy.as_str(),
            records = done.records.len(),
            reverted = done.reverted.len(),
            forced = done.forced,
            "rollback applied"
        );
        Ok(RollbackResult {
            id: done.rollback_id,
            merge_event_id: done.merge_event_id,
            strategy: done.strategy,
            message: done.message,
            author_id: done.author_id.to_string(),
            created_at,
            records: done.records,
            reverted_entity_ids: done.reverted,
            skipped_entity_ids: done.skipped,
            forced: done.forced,
            irreversible: done.irreversible,
            blockers: done.blockers,
        })
    }
}

struct Finish<'a> {
    rollback_id: String,
    merge_event_id: Option<String>,
    branch_id: &'a str,
    strategy: RollbackStrategy,
    message: String,
    author_id: &'a str,
    records: Vec<ChangeRecord>,
    reverted: Vec<String>,
    skipped: Vec<String>,
    forced: bool,
    irreversible: bool,
    blockers: Vec<crate::models::RollbackBlocker>,
}

fn require_author(author_id: &str) -> Result<(), EngineError> {
    if author_id.trim().is_empty() {
        return Err(EngineError::invalid("rollback author must not be empty"));
    }
    Ok(())
}

/// The merged entities named by `ids`, or all of them when `ids` is empty.
fn select<'a>(
    analysis: &'a RevertAnalysis,
    ids: &[String],
) -> Result<Vec<&'a MergedEntity>, EngineError> {
    if ids.is_empty() {
        return Ok(analysis.entities.iter().collect());
    }
    ids.iter()
        .map(|id| {
            analysis.entity(id).ok_or_else(|| {
                EngineError::invalid(format!(
                    "entity {id} was not written by merge {}",
                    analysis.event.id
                ))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branches::NewBranch;
    use crate::db::Database;
    use crate::merge::{MergeExecutor, MergeRequest};
    use crate::models::{Branch, MergeEvent};
    use serde_json::json;

    fn record(value: serde_json::Value) -> Option<Record> {
        value.as_object().cloned()
    }

    struct Fixture {
        main: Branch,
        event: MergeEvent,
    }

    /// main has R1 and R2; dev edits both and adds R3, then merges into main.
    fn fixture(conn: &Connection) -> Fixture {
        let store = VersionStore::new(conn, 8);
        let main = store.branches().ensure_default("t1", "main", "alice").unwrap();
        for id in ["R1", "R2"] {
            store
                .append(NewChange::new(
                    EntityType::Rule,
                    id,
                    &main.id,
                    ChangeType::Create,
                    None,
                    record(json!({"name": id, "active": true})),
                    "alice",
                ))
                .unwrap();
        }
        let dev = store
            .branches()
            .create("t1", "bob", NewBranch { name: "dev".into(), ..NewBranch::default() })
            .unwrap();
        for id in ["R1", "R2"] {
            store
                .append(NewChange::new(
                    EntityType::Rule,
                    id,
                    &dev.id,
                    ChangeType::Update,
                    record(json!({"name": id, "active": true})),
                    record(json!({"name": id, "active": false})),
                    "bob",
                ))
                .unwrap();
        }
        store
            .append(NewChange::new(
                EntityType::Rule,
                "R3",
                &dev.id,
                ChangeType::Create,
                None,
                record(json!({"name": "R3"})),
                "bob",
            ))
            .unwrap();
        let event = MergeExecutor::new(conn, 8, CancellationToken::new())
            .merge(&MergeRequest {
                source_branch_id: dev.id.clone(),
                target_branch_id: main.id.clone(),
                author_id: "bob".into(),
                ..MergeRequest::default()
            })
            .unwrap();
        Fixture { main, event }
    }

    fn state(conn: &Connection, branch: &Branch, id: &str) -> Option<Record> {
        VersionStore::new(conn, 8)
            .current_state(EntityType::Rule, id, &branch.id)
            .unwrap()
    }

    fn request(event: &MergeEvent, strategy: RollbackStrategy) -> RollbackRequest {
        RollbackRequest {
            merge_event_id: event.id.clone(),
            strategy,
            author_id: "alice".into(),
            ..RollbackRequest::default()
        }
    }

    #[test]
    fn test_revert_commit_restores_pre_merge_state() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let f = fixture(&conn);
        let executor = RollbackExecutor::new(&conn, 8, CancellationToken::new());

        let result = executor
            .rollback(&request(&f.event, RollbackStrategy::CreateRevertCommit))
            .unwrap();
        assert_eq!(result.records.len(), 3);
        assert!(result.records.iter().all(|r| r.change_type == ChangeType::Rollback));
        assert_eq!(state(&conn, &f.main, "R1"), record(json!({"name": "R1", "active": true})));
        assert_eq!(state(&conn, &f.main, "R3"), None);

        let again = executor.rollback(&request(&f.event, RollbackStrategy::CreateRevertCommit));
        assert!(matches!(again, Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_selective_revert_then_remaining() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let f = fixture(&conn);
        let executor = RollbackExecutor::new(&conn, 8, CancellationToken::new());

        let empty = executor.rollback(&request(&f.event, RollbackStrategy::SelectiveRevert));
        assert!(matches!(empty, Err(EngineError::Validation(_))));

        let mut selective = request(&f.event, RollbackStrategy::SelectiveRevert);
        selective.entity_ids = vec!["R2".into()];
        let result = executor.rollback(&selective).unwrap();
        assert_eq!(result.reverted_entity_ids, vec!["R2".to_string()]);
        assert_eq!(state(&conn, &f.main, "R1"), record(json!({"name": "R1", "active": false})));
        assert_eq!(state(&conn, &f.main, "R2"), record(json!({"name": "R2", "active": true})));

        let candidates = RollbackPlanner::new(&conn, 8).rollbackable(&f.main.id, 10).unwrap();
        assert!(candidates[0].can_revert);
        assert_eq!(candidates[0].reverted_entity_ids, vec!["R2".to_string()]);

        let rest = executor
            .rollback(&request(&f.event, RollbackStrategy::CreateRevertCommit))
            .unwrap();
        assert_eq!(rest.skipped_entity_ids, vec!["R2".to_string()]);
        assert_eq!(rest.reverted_entity_ids.len(), 2);
    }

    #[test]
    fn test_blocked_revert_reports_blockers() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let f = fixture(&conn);
        let store = VersionStore::new(&conn, 8);
        store
            .append(NewChange::new(
                EntityType::Rule,
                "R1",
                &f.main.id,
                ChangeType::Update,
                state(&conn, &f.main, "R1"),
                record(json!({"name": "R1", "active": false, "priority": 2})),
                "carol",
            ))
            .unwrap();

        let executor = RollbackExecutor::new(&conn, 8, CancellationToken::new());
        match executor.rollback(&request(&f.event, RollbackStrategy::CreateRevertCommit)) {
            Err(EngineError::BlockedRollback { blockers }) => {
                assert_eq!(blockers.len(), 1);
                assert_eq!(blockers[0].later_author_id, "carol");
            }
            other => panic!("expected blocked rollback, got {other:?}"),
        }

        // Restoring to the point before the merge overwrites the later edit
        // and reports it.
        let result = executor
            .rollback(&request(&f.event, RollbackStrategy::RestoreToPoint))
            .unwrap();
        assert_eq!(result.strategy, RollbackStrategy::RestoreToPoint);
        assert!(result.forced);
        assert_eq!(result.blockers.len(), 1);
        assert_eq!(result.blockers[0].entity_id, "R1");
        assert_eq!(result.blockers[0].later_author_id, "carol");
        assert_eq!(state(&conn, &f.main, "R1"), record(json!({"name": "R1", "active": true})));
        assert_eq!(state(&conn, &f.main, "R3"), None);
    }

    #[test]
    fn test_direct_rollback_requires_confirmation() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let f = fixture(&conn);
        let executor = RollbackExecutor::new(&conn, 8, CancellationToken::new());

        let additive = executor.rollback(&request(&f.event, RollbackStrategy::DirectRollback));
        assert!(matches!(additive, Err(EngineError::Validation(_))));

        let mut direct: DirectRollback =
            request(&f.event, RollbackStrategy::DirectRollback).into();
        assert!(matches!(
            executor.direct_rollback(&direct),
            Err(EngineError::Validation(_))
        ));

        direct.confirm_irreversible = true;
        let result = executor.direct_rollback(&direct).unwrap();
        assert!(result.irreversible);
        assert!(!result.forced);
        assert!(result.records.is_empty());
        assert_eq!(state(&conn, &f.main, "R1"), record(json!({"name": "R1", "active": true})));
        assert_eq!(state(&conn, &f.main, "R3"), None);
        assert!(queries::records_for_merge_event(&conn, &f.event.id)
            .unwrap()
            .iter()
            .all(|r| r.branch_id != f.main.id));
    }

    #[test]
    fn test_restore_version_appends_rollback_record() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let f = fixture(&conn);
        let store = VersionStore::new(&conn, 8);
        let history = store
            .history(EntityType::Rule, "R1", &f.main.id, None, true)
            .unwrap();
        let original = history.last().unwrap();
        assert_eq!(original.change_type, ChangeType::Create);

        let executor = RollbackExecutor::new(&conn, 8, CancellationToken::new());
        let result = executor
            .restore_version(&PointRollbackRequest {
                entity_type: EntityType::Rule,
                entity_id: "R1".into(),
                branch_id: f.main.id.clone(),
                target_version_sha: original.sha.clone(),
                author_id: "alice".into(),
                reason: Some("undo".into()),
            })
            .unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].message.as_deref(), Some("undo"));
        assert_eq!(state(&conn, &f.main, "R1"), original.after_data);

        let missing = executor.restore_version(&PointRollbackRequest {
            entity_type: EntityType::Rule,
            entity_id: "R1".into(),
            branch_id: f.main.id.clone(),
            target_version_sha: "deadbeef".into(),
            author_id: "alice".into(),
            reason: None,
        });
        assert!(matches!(missing, Err(EngineError::NotFound { .. })));
    }

    #[test]
    fn test_cancelled_rollback_stops_at_checkpoint() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let f = fixture(&conn);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = RollbackExecutor::new(&conn, 8, cancel)
            .rollback(&request(&f.event, RollbackStrategy::CreateRevertCommit));
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
