//! Which merges can be reverted, and why not.
//!
//! A merged entity is blocked when its chain on the target has a record after
//! the merge's last record for it that is not itself a rollback: reverting
//! would silently discard that later edit.

use std::collections::{BTreeSet, HashMap};

use rusqlite::Connection;
use tracing::debug;

use crate::db::queries;
use crate::errors::EngineError;
use crate::models::{
    entity_display_name, ChangeRecord, ChangeType, EntityType, MergeEvent, RollbackBlocker,
    RollbackCandidate,
};
use crate::version_store::VersionStore;

/// The records one merge event wrote for one entity.
#[derive(Debug, Clone)]
pub struct MergedEntity {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: Option<String>,
    /// Oldest record; its `before_data` is the pre-merge state.
    pub first: ChangeRecord,
    /// Newest record; later edits are measured from here.
    pub last: ChangeRecord,
}

/// A merge event with its written records and rollback history.
#[derive(Debug, Clone)]
pub struct RevertAnalysis {
    pub event: MergeEvent,
    pub entities: Vec<MergedEntity>,
    /// Entity ids already reverted by an earlier rollback.
    pub reverted: BTreeSet<String>,
}

impl RevertAnalysis {
    /// Entities written by the merge that no rollback has reverted yet.
    pub fn pending(&self) -> impl Iterator<Item = &MergedEntity> {
        self.entities
            .iter()
            .filter(|e| !self.reverted.contains(&e.entity_id))
    }

    pub fn entity(&self, entity_id: &str) -> Option<&MergedEntity> {
        self.entities.iter().find(|e| e.entity_id == entity_id)
    }
}

pub struct RollbackPlanner<'c> {
    conn: &'c Connection,
    store: VersionStore<'c>,
}

impl<'c> RollbackPlanner<'c> {
    pub fn new(conn: &'c Connection, max_depth: usize) -> Self {
        Self {
            conn,
            store: VersionStore::new(conn, max_depth),
        }
    }

    /// Recent merges into `branch_id`, newest first, annotated with
    /// `can_revert` and blockers.
    pub fn rollbackable(
        &self,
        branch_id: &str,
        limit: u32,
    ) -> Result<Vec<RollbackCandidate>, EngineError> {
        self.store.branch(branch_id)?;
        let events = queries::list_merge_events_into(self.conn, branch_id, limit)?;

        let mut candidates = Vec::with_capacity(events.len());
        for event in events {
            let analysis = self.analyze_event(event)?;
            let pending: Vec<&MergedEntity> = analysis.pending().collect();
            let blockers = self.blockers(&analysis.event, pending.iter().copied())?;
            let can_revert = !pending.is_empty() && blockers.is_empty();
            debug!(
                merge_event_id = %analysis.event.id,
                pending = pending.len(),
                blockers = blockers.len(),
                can_revert,
                "evaluated rollback candidate"
            );
            candidates.push(RollbackCandidate {
                can_revert,
                blockers,
                reverted_entity_ids: analysis.reverted.iter().cloned().collect(),
                merge_event: analysis.event,
            });
        }
        Ok(candidates)
    }

    pub fn analyze(&self, merge_event_id: &str) -> Result<RevertAnalysis, EngineError> {
        let event = queries::get_merge_event(self.conn, merge_event_id)?
            .ok_or_else(|| EngineError::not_found("merge event", merge_event_id))?;
        self.analyze_event(event)
    }

    fn analyze_event(&self, event: MergeEvent) -> Result<RevertAnalysis, EngineError> {
        let names: HashMap<&str, Option<&String>> = event
            .affected_entities
            .iter()
            .map(|a| (a.entity_id.as_str(), a.entity_name.as_ref()))
            .collect();

        let mut entities: Vec<MergedEntity> = Vec::new();
        for record in queries::records_for_merge_event(self.conn, &event.id)? {
            if record.branch_id != event.target_branch_id {
                continue;
            }
            match entities.iter_mut().find(|e| {
                e.entity_type == record.entity_type && e.entity_id == record.entity_id
            }) {
                Some(existing) => existing.last = record,
                None => {
                    let entity_name = names
                        .get(record.entity_id.as_str())
                        .copied()
                        .flatten()
                        .cloned()
                        .or_else(|| {
                            entity_display_name(
                                record.after_data.as_ref().or(record.before_data.as_ref()),
                            )
                        });
                    entities.push(MergedEntity {
                        entity_type: record.entity_type,
                        entity_id: record.entity_id.clone(),
                        entity_name,
                        first: record.clone(),
                        last: record,
                    });
                }
            }
        }

        let mut reverted = BTreeSet::new();
        for rollback in queries::rollbacks_for_merge_event(self.conn, &event.id)? {
            reverted.extend(rollback.entity_ids);
        }

        Ok(RevertAnalysis {
            event,
            entities,
            reverted,
        })
    }

    /// Later non-rollback edits on the target for each given entity.
    pub fn blockers<'e>(
        &self,
        event: &MergeEvent,
        entities: impl IntoIterator<Item = &'e MergedEntity>,
    ) -> Result<Vec<RollbackBlocker>, EngineError> {
        let mut blockers = Vec::new();
        for entity in entities {
            blockers.extend(self.edits_after(
                event,
                entity.entity_type,
                &entity.entity_id,
                entity.entity_name.as_deref(),
                entity.last.seq,
            )?);
        }
        Ok(blockers)
    }

    /// Non-rollback records for one entity on the merge's target after
    /// `after_seq` that the merge itself did not write.
    pub fn edits_after(
        &self,
        event: &MergeEvent,
        entity_type: EntityType,
        entity_id: &str,
        entity_name: Option<&str>,
        after_seq: i64,
    ) -> Result<Vec<RollbackBlocker>, EngineError> {
        let later =
            self.store
                .chain_after(entity_type, entity_id, &event.target_branch_id, after_seq)?;
        let mut blockers = Vec::new();
        for record in later {
            if record.change_type == ChangeType::Rollback
                || record.merge_event_id.as_deref() == Some(event.id.as_str())
            {
                continue;
            }
            let author_name = queries::author_name(self.conn, &record.author_id)?;
            let who = author_name.as_deref().unwrap_or(&record.author_id);
            let label = entity_name.unwrap_or(entity_id);
            blockers.push(RollbackBlocker {
                entity_type,
                entity_id: entity_id.to_string(),
                entity_name: entity_name.map(str::to_string),
                message: format!(
                    "{} '{}' was changed by {} after this merge ({} {})",
                    entity_type,
                    label,
                    who,
                    record.change_type,
                    short_sha(&record.sha)
                ),
                later_change_id: record.id,
                later_change_sha: record.sha,
                later_change_type: record.change_type,
                later_author_id: record.author_id,
                later_author_name: author_name,
            });
        }
        Ok(blockers)
    }
}

pub(crate) fn short_sha(sha: &str) -> &str {
    &sha[..sha.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branches::NewBranch;
    use crate::cancel::CancellationToken;
    use crate::db::Database;
    use crate::merge::{MergeExecutor, MergeRequest};
    use crate::models::{Branch, Record};
    use crate::version_store::NewChange;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Option<Record> {
        value.as_object().cloned()
    }

    /// main has R1; dev edits it and is merged back into main.
    fn merged_fixture(conn: &Connection) -> (Branch, MergeEvent) {
        let store = VersionStore::new(conn, 8);
        let main = store.branches().ensure_default("t1", "main", "alice").unwrap();
        store
            .append(NewChange::new(
                EntityType::Rule,
                "R1",
                &main.id,
                ChangeType::Create,
                None,
                record(json!({"name": "A", "active": true})),
                "alice",
            ))
            .unwrap();
        let dev = store
            .branches()
            .create("t1", "bob", NewBranch { name: "dev".into(), ..NewBranch::default() })
            .unwrap();
        store
            .append(NewChange::new(
                EntityType::Rule,
                "R1",
                &dev.id,
                ChangeType::Update,
                record(json!({"name": "A", "active": true})),
                record(json!({"name": "A", "active": false})),
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
        (main, event)
    }

    #[test]
    fn test_fresh_merge_is_revertible() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let (main, event) = merged_fixture(&conn);

        let candidates = RollbackPlanner::new(&conn, 8).rollbackable(&main.id, 10).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].merge_event.id, event.id);
        assert!(candidates[0].can_revert);
        assert!(candidates[0].blockers.is_empty());
    }

    #[test]
    fn test_later_edit_blocks_revert() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let (main, event) = merged_fixture(&conn);
        queries::upsert_author(&conn, "carol", "Carol C.").unwrap();

        let store = VersionStore::new(&conn, 8);
        let current = store.current_state(EntityType::Rule, "R1", &main.id).unwrap();
        store
            .append(NewChange::new(
                EntityType::Rule,
                "R1",
                &main.id,
                ChangeType::Update,
                current,
                record(json!({"name": "A", "active": true, "note": "x"})),
                "carol",
            ))
            .unwrap();

        let planner = RollbackPlanner::new(&conn, 8);
        let candidates = planner.rollbackable(&main.id, 10).unwrap();
        assert!(!candidates[0].can_revert);
        let blocker = &candidates[0].blockers[0];
        assert_eq!(blocker.entity_id, "R1");
        assert_eq!(blocker.later_author_name.as_deref(), Some("Carol C."));
        assert!(blocker.message.contains("Carol C."));
        assert!(blocker.message.contains('A'));

        let analysis = planner.analyze(&event.id).unwrap();
        assert_eq!(analysis.entities.len(), 1);
        assert_eq!(analysis.pending().count(), 1);
    }

    #[test]
    fn test_unknown_merge_event() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        assert!(matches!(
            RollbackPlanner::new(&conn, 8).analyze("missing"),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_short_sha() {
        assert_eq!(short_sha("abcdef0123456789"), "abcdef012345");
        assert_eq!(short_sha("abc"), "abc");
    }
}
