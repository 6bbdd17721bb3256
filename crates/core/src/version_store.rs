//! Append-only change log, one linear chain per (entity, branch).
//!
//! The head of a chain is the entity's state on that branch. A branch with
//! no chain for an entity inherits the state from its nearest ancestor that
//! has one (overlay resolution). All reads accept an optional `as_of`
//! sequence number so callers can resolve the overlay at a past point.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::branches::BranchRegistry;
use crate::db::queries;
use crate::diff;
use crate::errors::EngineError;
use crate::models::{Branch, ChangeRecord, ChangeType, EntityType, Record};

/// Everything needed to append one change record.
#[derive(Debug, Clone)]
pub struct NewChange {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub branch_id: String,
    pub change_type: ChangeType,
    pub before: Option<Record>,
    pub after: Option<Record>,
    pub author_id: String,
    pub message: Option<String>,
    pub merge_event_id: Option<String>,
    pub rollback_id: Option<String>,
    pub batch_id: Option<String>,
    pub is_conflicted: bool,
}

impl NewChange {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        branch_id: impl Into<String>,
        change_type: ChangeType,
        before: Option<Record>,
        after: Option<Record>,
        author_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            branch_id: branch_id.into(),
            change_type,
            before,
            after,
            author_id: author_id.into(),
            message: None,
            merge_event_id: None,
            rollback_id: None,
            batch_id: None,
            is_conflicted: false,
        }
    }

    pub fn message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    pub fn merge_event(mut self, merge_event_id: &str, is_conflicted: bool) -> Self {
        self.merge_event_id = Some(merge_event_id.to_string());
        self.is_conflicted = is_conflicted;
        self
    }

    pub fn rollback(mut self, rollback_id: &str) -> Self {
        self.rollback_id = Some(rollback_id.to_string());
        self
    }

    pub fn batch(mut self, batch_id: &str) -> Self {
        self.batch_id = Some(batch_id.to_string());
        self
    }
}

/// An entity's effective state on a branch and where it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedState {
    pub state: Option<Record>,
    /// Branch whose chain supplied the state (`None` if no chain exists).
    pub from_branch_id: Option<String>,
    pub head_sha: Option<String>,
}

pub struct VersionStore<'c> {
    conn: &'c Connection,
    branches: BranchRegistry<'c>,
}

impl<'c> VersionStore<'c> {
    pub fn new(conn: &'c Connection, max_depth: usize) -> Self {
        Self {
            conn,
            branches: BranchRegistry::new(conn, max_depth),
        }
    }

    pub fn branches(&self) -> &BranchRegistry<'c> {
        &self.branches
    }

    /// Append one change record to its chain and bump branch statistics.
    pub fn append(&self, change: NewChange) -> Result<ChangeRecord, EngineError> {
        let branch = self.branches.get(&change.branch_id)?;
        if branch.is_locked {
            return Err(EngineError::invalid(format!(
                "branch '{}' is locked",
                branch.name
            )));
        }
        check_shape(&change)?;

        let created_at = Utc::now();
        let field_changes = diff::diff(change.before.as_ref(), change.after.as_ref());
        let id = Uuid::new_v4().to_string();
        let sha = record_sha(&id, &change, created_at);

        let mut record = ChangeRecord {
            id,
            sha,
            seq: 0,
            entity_type: change.entity_type,
            entity_id: change.entity_id,
            branch_id: change.branch_id,
            change_type: change.change_type,
            before_data: change.before,
            after_data: change.after,
            field_changes,
            author_id: change.author_id,
            message: change.message,
            created_at,
            merge_event_id: change.merge_event_id,
            rollback_id: change.rollback_id,
            batch_id: change.batch_id,
            is_conflicted: change.is_conflicted,
        };
        record.seq = queries::insert_change_record(self.conn, &record)?;
        queries::record_branch_activity(self.conn, &record.branch_id, 1, created_at)?;

        debug!(
            seq = record.seq,
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            branch_id = %record.branch_id,
            change_type = %record.change_type,
            fields = record.field_changes.len(),
            "appended change record"
        );
        Ok(record)
    }

    /// The entity's effective state on `branch_id`, `None` if it does not exist.
    pub fn current_state(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        branch_id: &str,
    ) -> Result<Option<Record>, EngineError> {
        Ok(self.resolve(entity_type, entity_id, branch_id, None)?.state)
    }

    /// The entity's effective state as it was right after record `as_of_seq`.
    pub fn state_at(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        branch_id: &str,
        as_of_seq: i64,
    ) -> Result<Option<Record>, EngineError> {
        Ok(self
            .resolve(entity_type, entity_id, branch_id, Some(as_of_seq))?
            .state)
    }

    /// Overlay resolution: the first chain with a record wins.
    pub fn resolve(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        branch_id: &str,
        as_of_seq: Option<i64>,
    ) -> Result<ResolvedState, EngineError> {
        for branch in self.branches.ancestry(branch_id)? {
            let head =
                queries::chain_head(self.conn, entity_type, entity_id, &branch.id, as_of_seq)?;
            if let Some(head) = head {
                return Ok(ResolvedState {
                    state: head.after_data,
                    from_branch_id: Some(branch.id),
                    head_sha: Some(head.sha),
                });
            }
        }
        Ok(ResolvedState {
            state: None,
            from_branch_id: None,
            head_sha: None,
        })
    }

    /// Records affecting the entity on `branch_id`, newest first.
    ///
    /// With `include_ancestry`, once the local chain is exhausted the walk
    /// continues into each ancestor with the records that predate the
    /// descendant's first local record.
    pub fn history(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        branch_id: &str,
        limit: Option<usize>,
        include_ancestry: bool,
    ) -> Result<Vec<ChangeRecord>, EngineError> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        let mut upper = i64::MAX;

        for branch in self.branches.ancestry(branch_id)? {
            let records = queries::chain_range(
                self.conn,
                entity_type,
                entity_id,
                &branch.id,
                0,
                Some(upper.saturating_sub(1)),
            )?;
            if let Some(first) = records.first() {
                upper = first.seq;
            }
            out.extend(records.into_iter().rev());
            if out.len() >= limit || !include_ancestry {
                break;
            }
        }
        out.truncate(limit);
        Ok(out)
    }

    /// Records on one chain after the record identified by `since_sha`.
    pub fn chain_since(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        branch_id: &str,
        since_sha: &str,
    ) -> Result<Vec<ChangeRecord>, EngineError> {
        let anchor = queries::get_change_record_by_sha(self.conn, since_sha)?
            .ok_or_else(|| EngineError::not_found("change record", since_sha))?;
        if anchor.entity_type != entity_type || anchor.entity_id != entity_id {
            return Err(EngineError::invalid(format!(
                "record {since_sha} belongs to {} {}",
                anchor.entity_type, anchor.entity_id
            )));
        }
        self.chain_after(entity_type, entity_id, branch_id, anchor.seq)
    }

    /// Records on one chain with a sequence number above `after_seq`.
    pub fn chain_after(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        branch_id: &str,
        after_seq: i64,
    ) -> Result<Vec<ChangeRecord>, EngineError> {
        Ok(queries::chain_range(
            self.conn,
            entity_type,
            entity_id,
            branch_id,
            after_seq,
            None,
        )?)
    }

    /// Look up a record by sha.
    pub fn record_by_sha(&self, sha: &str) -> Result<ChangeRecord, EngineError> {
        queries::get_change_record_by_sha(self.conn, sha)?
            .ok_or_else(|| EngineError::not_found("change record", sha))
    }

    pub fn branch(&self, branch_id: &str) -> Result<Branch, EngineError> {
        self.branches.get(branch_id)
    }
}

fn check_shape(change: &NewChange) -> Result<(), EngineError> {
    let ok = match change.change_type {
        ChangeType::Create => change.after.is_some(),
        ChangeType::Update => change.after.is_some(),
        ChangeType::Delete => change.after.is_none() && change.before.is_some(),
        ChangeType::Merge | ChangeType::Rollback => true,
    };
    if ok {
        Ok(())
    } else {
        Err(EngineError::invalid(format!(
            "{} of {} {} has an inconsistent before/after pair",
            change.change_type, change.entity_type, change.entity_id
        )))
    }
}

/// Content-derived sha over the record's identity and payload.
fn record_sha(id: &str, change: &NewChange, created_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    for part in [
        id,
        change.entity_type.as_str(),
        change.entity_id.as_str(),
        change.branch_id.as_str(),
        change.change_type.as_str(),
        change.author_id.as_str(),
        change.message.as_deref().unwrap_or(""),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    for data in [&change.before, &change.after] {
        match data {
            Some(record) => hasher.update(serde_json::Value::Object(record.clone()).to_string()),
            None => hasher.update(b"null"),
        }
        hasher.update([0u8]);
    }
    hasher.update(created_at.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branches::NewBranch;
    use crate::db::Database;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn fork(conn: &Connection, name: &str, parent: Option<&str>) -> Branch {
        BranchRegistry::new(conn, 8)
            .create(
                "t1",
                "alice",
                NewBranch {
                    name: name.into(),
                    parent_branch_id: parent.map(str::to_string),
                    ..NewBranch::default()
                },
            )
            .unwrap()
    }

    fn create(store: &VersionStore<'_>, branch: &str, id: &str, data: serde_json::Value) -> ChangeRecord {
        store
            .append(NewChange::new(
                EntityType::Rule,
                id,
                branch,
                ChangeType::Create,
                None,
                Some(record(data)),
                "alice",
            ))
            .unwrap()
    }

    #[test]
    fn test_append_computes_diff_and_bumps_branch() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let store = VersionStore::new(&conn, 8);
        let main = store.branches().ensure_default("t1", "main", "alice").unwrap();

        let rec = create(&store, &main.id, "R1", json!({"name": "A", "active": true}));
        assert_eq!(rec.field_changes.len(), 2);
        assert_eq!(rec.sha.len(), 64);
        assert!(rec.seq > 0);

        let main = store.branch(&main.id).unwrap();
        assert_eq!(main.change_count, 1);
        assert!(main.last_activity_at.is_some());
    }

    #[test]
    fn test_append_to_locked_branch_fails() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let store = VersionStore::new(&conn, 8);
        let main = store.branches().ensure_default("t1", "main", "alice").unwrap();
        store.branches().lock(&main.id).unwrap();

        let result = store.append(NewChange::new(
            EntityType::Rule,
            "R1",
            &main.id,
            ChangeType::Create,
            None,
            Some(record(json!({"name": "A"}))),
            "alice",
        ));
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_inconsistent_shape_rejected() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let store = VersionStore::new(&conn, 8);
        let main = store.branches().ensure_default("t1", "main", "alice").unwrap();

        let result = store.append(NewChange::new(
            EntityType::Rule,
            "R1",
            &main.id,
            ChangeType::Create,
            None,
            None,
            "alice",
        ));
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_overlay_inherits_until_overridden() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let store = VersionStore::new(&conn, 8);
        let main = store.branches().ensure_default("t1", "main", "alice").unwrap();
        create(&store, &main.id, "R1", json!({"name": "A"}));
        let dev = fork(&conn, "dev", None);
        let feature = fork(&conn, "feature", Some(&dev.id));

        let on_main = store.current_state(EntityType::Rule, "R1", &main.id).unwrap();
        assert_eq!(
            store.current_state(EntityType::Rule, "R1", &feature.id).unwrap(),
            on_main
        );

        let before = on_main.clone();
        store
            .append(NewChange::new(
                EntityType::Rule,
                "R1",
                &dev.id,
                ChangeType::Delete,
                before,
                None,
                "bob",
            ))
            .unwrap();
        assert_eq!(store.current_state(EntityType::Rule, "R1", &dev.id).unwrap(), None);
        assert_eq!(
            store.current_state(EntityType::Rule, "R1", &feature.id).unwrap(),
            None
        );
        assert!(store.current_state(EntityType::Rule, "R1", &main.id).unwrap().is_some());
        assert_eq!(store.current_state(EntityType::Rule, "R9", &main.id).unwrap(), None);
    }

    #[test]
    fn test_state_at_past_sequence() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let store = VersionStore::new(&conn, 8);
        let main = store.branches().ensure_default("t1", "main", "alice").unwrap();
        let first = create(&store, &main.id, "R1", json!({"name": "A"}));
        store
            .append(NewChange::new(
                EntityType::Rule,
                "R1",
                &main.id,
                ChangeType::Update,
                first.after_data.clone(),
                Some(record(json!({"name": "B"}))),
                "alice",
            ))
            .unwrap();

        let then = store.state_at(EntityType::Rule, "R1", &main.id, first.seq).unwrap();
        assert_eq!(then, first.after_data);
        assert_eq!(
            store.state_at(EntityType::Rule, "R1", &main.id, 0).unwrap(),
            None
        );
    }

    #[test]
    fn test_history_walks_into_ancestry() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let store = VersionStore::new(&conn, 8);
        let main = store.branches().ensure_default("t1", "main", "alice").unwrap();
        let created = create(&store, &main.id, "R1", json!({"name": "A"}));
        let dev = fork(&conn, "dev", None);
        let local = store
            .append(NewChange::new(
                EntityType::Rule,
                "R1",
                &dev.id,
                ChangeType::Update,
                created.after_data.clone(),
                Some(record(json!({"name": "B"}))),
                "bob",
            ))
            .unwrap();
        // A later parent edit is shadowed by dev's own chain.
        store
            .append(NewChange::new(
                EntityType::Rule,
                "R1",
                &main.id,
                ChangeType::Update,
                created.after_data.clone(),
                Some(record(json!({"name": "C"}))),
                "carol",
            ))
            .unwrap();

        let local_only = store
            .history(EntityType::Rule, "R1", &dev.id, None, false)
            .unwrap();
        assert_eq!(local_only.len(), 1);

        let full = store
            .history(EntityType::Rule, "R1", &dev.id, None, true)
            .unwrap();
        let shas: Vec<_> = full.iter().map(|r| r.sha.as_str()).collect();
        assert_eq!(shas, vec![local.sha.as_str(), created.sha.as_str()]);

        let limited = store
            .history(EntityType::Rule, "R1", &dev.id, Some(1), true)
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_chain_since() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let store = VersionStore::new(&conn, 8);
        let main = store.branches().ensure_default("t1", "main", "alice").unwrap();
        let first = create(&store, &main.id, "R1", json!({"n": 1}));
        store
            .append(NewChange::new(
                EntityType::Rule,
                "R1",
                &main.id,
                ChangeType::Update,
                first.after_data.clone(),
                Some(record(json!({"n": 2}))),
                "alice",
            ))
            .unwrap();

        let since = store
            .chain_since(EntityType::Rule, "R1", &main.id, &first.sha)
            .unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].after_data, Some(record(json!({"n": 2}))));
        assert!(matches!(
            store.chain_since(EntityType::Rule, "R1", &main.id, "nope"),
            Err(EngineError::NotFound { .. })
        ));
    }
}
