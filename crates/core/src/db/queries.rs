//! Typed query helpers for every table in the branchbase database.
//!
//! All helpers take a `&Connection` (or an open transaction, which derefs to
//! one) so callers decide the transaction boundary.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::errors::DatabaseError;
use crate::models::{
    AffectedEntity, Branch, ChangeRecord, ChangeType, ConflictResolution, ConflictType,
    EntityType, MergeChangeType, MergeEvent, MergeStrategy, Record, RollbackStrategy,
};

// ---------------------------------------------------------------------------
// Row structs without a richer domain type
// ---------------------------------------------------------------------------

/// A row from the `rollbacks` table.
#[derive(Debug, Clone)]
pub struct RollbackEntry {
    pub id: String,
    pub merge_event_id: Option<String>,
    pub branch_id: String,
    pub strategy: RollbackStrategy,
    pub message: String,
    pub author_id: String,
    pub forced: bool,
    pub entity_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A row from the `batches` table.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub batch_id: String,
    pub version_id: String,
    pub tenant_id: String,
    pub branch_id: String,
    pub resource_type: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub record_count: i64,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Column codecs
// ---------------------------------------------------------------------------

fn conversion_error(idx: usize, detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, detail.into())
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp '{raw}': {e}")))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, format!("bad timestamp '{raw}': {e}")))
    })
    .transpose()
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn opt_record_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Record>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string())))
        .transpose()
}

fn enum_col<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, format!("unknown value '{raw}'")))
}

fn encode_json<T: Serialize + ?Sized>(column: &str, value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Codec {
        column: column.to_string(),
        detail: e.to_string(),
    })
}

fn encode_record(column: &str, value: Option<&Record>) -> Result<Option<String>, DatabaseError> {
    value.map(|r| encode_json(column, r)).transpose()
}

// ---------------------------------------------------------------------------
// Sequence
// ---------------------------------------------------------------------------

/// The highest change-record sequence ever assigned (never decreases, even
/// after destructive deletes).
pub fn current_seq(conn: &Connection) -> Result<i64, DatabaseError> {
    let seq: Option<i64> = conn
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = 'change_records'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(seq.unwrap_or(0))
}

// ---------------------------------------------------------------------------
// branches
// ---------------------------------------------------------------------------

const BRANCH_COLUMNS: &str = "id, tenant_id, name, description, parent_branch_id, is_default,
     is_locked, change_count, last_activity_at, created_at, created_by, base_seq";

fn row_to_branch(row: &Row<'_>) -> rusqlite::Result<Branch> {
    Ok(Branch {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        parent_branch_id: row.get(4)?,
        is_default: row.get(5)?,
        is_locked: row.get(6)?,
        collaborator_ids: Vec::new(),
        change_count: row.get(7)?,
        last_activity_at: opt_time_col(row, 8)?,
        created_at: time_col(row, 9)?,
        created_by: row.get(10)?,
        base_seq: row.get(11)?,
    })
}

fn load_collaborators(conn: &Connection, branch: &mut Branch) -> Result<(), DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM branch_collaborators WHERE branch_id = ?1 ORDER BY added_at, user_id",
    )?;
    branch.collaborator_ids = stmt
        .query_map(params![branch.id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(())
}

/// Insert a new branch row along with its collaborators.
pub fn insert_branch(conn: &Connection, branch: &Branch) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO branches (id, tenant_id, name, description, parent_branch_id, is_default,
         is_locked, change_count, last_activity_at, created_at, created_by, base_seq)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            branch.id,
            branch.tenant_id,
            branch.name,
            branch.description,
            branch.parent_branch_id,
            branch.is_default,
            branch.is_locked,
            branch.change_count,
            branch.last_activity_at.map(|t| t.to_rfc3339()),
            branch.created_at.to_rfc3339(),
            branch.created_by,
            branch.base_seq,
        ],
    )?;
    for user_id in &branch.collaborator_ids {
        add_collaborator(conn, &branch.id, user_id)?;
    }
    debug!(id = %branch.id, name = %branch.name, "inserted branch");
    Ok(())
}

/// Get a branch by ID.
pub fn get_branch(conn: &Connection, id: &str) -> Result<Option<Branch>, DatabaseError> {
    let sql = format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE id = ?1");
    let branch = conn.query_row(&sql, params![id], row_to_branch).optional()?;
    match branch {
        Some(mut branch) => {
            load_collaborators(conn, &mut branch)?;
            Ok(Some(branch))
        }
        None => Ok(None),
    }
}

/// Get a branch by tenant and name.
pub fn get_branch_by_name(
    conn: &Connection,
    tenant_id: &str,
    name: &str,
) -> Result<Option<Branch>, DatabaseError> {
    let sql = format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE tenant_id = ?1 AND name = ?2");
    let branch = conn
        .query_row(&sql, params![tenant_id, name], row_to_branch)
        .optional()?;
    match branch {
        Some(mut branch) => {
            load_collaborators(conn, &mut branch)?;
            Ok(Some(branch))
        }
        None => Ok(None),
    }
}

/// List all branches of a tenant, default branch first, then by creation.
pub fn list_branches(conn: &Connection, tenant_id: &str) -> Result<Vec<Branch>, DatabaseError> {
    let sql = format!(
        "SELECT {BRANCH_COLUMNS} FROM branches WHERE tenant_id = ?1
         ORDER BY is_default DESC, created_at, name"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut branches = stmt
        .query_map(params![tenant_id], row_to_branch)?
        .collect::<Result<Vec<_>, _>>()?;
    for branch in &mut branches {
        load_collaborators(conn, branch)?;
    }
    Ok(branches)
}

/// The default branch of a tenant, if one exists.
pub fn default_branch(conn: &Connection, tenant_id: &str) -> Result<Option<Branch>, DatabaseError> {
    let sql = format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE tenant_id = ?1 AND is_default = 1");
    let branch = conn
        .query_row(&sql, params![tenant_id], row_to_branch)
        .optional()?;
    match branch {
        Some(mut branch) => {
            load_collaborators(conn, &mut branch)?;
            Ok(Some(branch))
        }
        None => Ok(None),
    }
}

/// `(id, parent_branch_id, is_default)` for every branch of a tenant.
pub fn branch_links(
    conn: &Connection,
    tenant_id: &str,
) -> Result<Vec<(String, Option<String>, bool)>, DatabaseError> {
    let mut stmt = conn
        .prepare("SELECT id, parent_branch_id, is_default FROM branches WHERE tenant_id = ?1")?;
    let links = stmt
        .query_map(params![tenant_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(links)
}

/// Number of direct children of a branch.
pub fn count_children(conn: &Connection, branch_id: &str) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM branches WHERE parent_branch_id = ?1",
        params![branch_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Set or clear a branch's lock flag.
pub fn set_branch_locked(conn: &Connection, branch_id: &str, locked: bool) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE branches SET is_locked = ?1 WHERE id = ?2",
        params![locked, branch_id],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: "branch".into(),
            id: branch_id.to_string(),
        });
    }
    Ok(())
}

/// Adjust a branch's change counter and stamp its last activity.
pub fn record_branch_activity(
    conn: &Connection,
    branch_id: &str,
    delta: i64,
    at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE branches SET change_count = MAX(change_count + ?1, 0), last_activity_at = ?2
         WHERE id = ?3",
        params![delta, at.to_rfc3339(), branch_id],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: "branch".into(),
            id: branch_id.to_string(),
        });
    }
    Ok(())
}

/// Delete a branch together with its own change records, batch ledger rows
/// and merge marks (collaborators cascade). Returns the number of records removed.
pub fn delete_branch(conn: &Connection, branch_id: &str) -> Result<usize, DatabaseError> {
    let removed = conn.execute(
        "DELETE FROM change_records WHERE branch_id = ?1",
        params![branch_id],
    )?;
    conn.execute("DELETE FROM batches WHERE branch_id = ?1", params![branch_id])?;
    conn.execute(
        "DELETE FROM merge_marks WHERE source_branch_id = ?1 OR target_branch_id = ?1",
        params![branch_id],
    )?;
    conn.execute("DELETE FROM branches WHERE id = ?1", params![branch_id])?;
    Ok(removed)
}

pub fn add_collaborator(conn: &Connection, branch_id: &str, user_id: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO branch_collaborators (branch_id, user_id, added_at)
         VALUES (?1, ?2, ?3)",
        params![branch_id, user_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn remove_collaborator(conn: &Connection, branch_id: &str, user_id: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "DELETE FROM branch_collaborators WHERE branch_id = ?1 AND user_id = ?2",
        params![branch_id, user_id],
    )?;
    Ok(changed > 0)
}

// ---------------------------------------------------------------------------
// change_records
// ---------------------------------------------------------------------------

const RECORD_COLUMNS: &str = "seq, id, sha, entity_type, entity_id, branch_id, change_type,
     before_data, after_data, field_changes, author_id, message, created_at, merge_event_id,
     rollback_id, batch_id, is_conflicted";

fn row_to_change_record(row: &Row<'_>) -> rusqlite::Result<ChangeRecord> {
    Ok(ChangeRecord {
        seq: row.get(0)?,
        id: row.get(1)?,
        sha: row.get(2)?,
        entity_type: enum_col(row, 3, EntityType::parse)?,
        entity_id: row.get(4)?,
        branch_id: row.get(5)?,
        change_type: enum_col(row, 6, ChangeType::parse)?,
        before_data: opt_record_col(row, 7)?,
        after_data: opt_record_col(row, 8)?,
        field_changes: json_col(row, 9)?,
        author_id: row.get(10)?,
        message: row.get(11)?,
        created_at: time_col(row, 12)?,
        merge_event_id: row.get(13)?,
        rollback_id: row.get(14)?,
        batch_id: row.get(15)?,
        is_conflicted: row.get(16)?,
    })
}

/// Insert a change record and return the sequence number assigned to it.
///
/// The `seq` field of `record` is ignored.
pub fn insert_change_record(conn: &Connection, record: &ChangeRecord) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO change_records (id, sha, entity_type, entity_id, branch_id, change_type,
         before_data, after_data, field_changes, author_id, message, created_at, merge_event_id,
         rollback_id, batch_id, is_conflicted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            record.id,
            record.sha,
            record.entity_type.as_str(),
            record.entity_id,
            record.branch_id,
            record.change_type.as_str(),
            encode_record("before_data", record.before_data.as_ref())?,
            encode_record("after_data", record.after_data.as_ref())?,
            encode_json("field_changes", &record.field_changes)?,
            record.author_id,
            record.message,
            record.created_at.to_rfc3339(),
            record.merge_event_id,
            record.rollback_id,
            record.batch_id,
            record.is_conflicted,
        ],
    )?;
    let seq = conn.last_insert_rowid();
    debug!(seq, id = %record.id, entity_id = %record.entity_id, branch_id = %record.branch_id,
        change_type = %record.change_type, "inserted change record");
    Ok(seq)
}

/// The newest record of one chain, optionally as of a sequence number.
pub fn chain_head(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
    branch_id: &str,
    as_of_seq: Option<i64>,
) -> Result<Option<ChangeRecord>, DatabaseError> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM change_records
         WHERE entity_type = ?1 AND entity_id = ?2 AND branch_id = ?3 AND seq <= ?4
         ORDER BY seq DESC LIMIT 1"
    );
    let record = conn
        .query_row(
            &sql,
            params![entity_type.as_str(), entity_id, branch_id, as_of_seq.unwrap_or(i64::MAX)],
            row_to_change_record,
        )
        .optional()?;
    Ok(record)
}

/// Records of one chain with `after_seq < seq <= up_to_seq`, oldest first.
pub fn chain_range(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
    branch_id: &str,
    after_seq: i64,
    up_to_seq: Option<i64>,
) -> Result<Vec<ChangeRecord>, DatabaseError> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM change_records
         WHERE entity_type = ?1 AND entity_id = ?2 AND branch_id = ?3 AND seq > ?4 AND seq <= ?5
         ORDER BY seq ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(
            params![
                entity_type.as_str(),
                entity_id,
                branch_id,
                after_seq,
                up_to_seq.unwrap_or(i64::MAX)
            ],
            row_to_change_record,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Distinct entities with at least one record on `branch_id` after `after_seq`.
pub fn entities_touched_since(
    conn: &Connection,
    branch_id: &str,
    after_seq: i64,
) -> Result<Vec<(EntityType, String)>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT entity_type, entity_id, MIN(seq) AS first_seq FROM change_records
         WHERE branch_id = ?1 AND seq > ?2
         GROUP BY entity_type, entity_id ORDER BY first_seq",
    )?;
    let entities = stmt
        .query_map(params![branch_id, after_seq], |row| {
            Ok((enum_col(row, 0, EntityType::parse)?, row.get(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entities)
}

/// Look up a change record by SHA.
pub fn get_change_record_by_sha(conn: &Connection, sha: &str) -> Result<Option<ChangeRecord>, DatabaseError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM change_records WHERE sha = ?1 LIMIT 1");
    Ok(conn.query_row(&sql, params![sha], row_to_change_record).optional()?)
}


/// All records produced by one merge event, oldest first.
pub fn records_for_merge_event(
    conn: &Connection,
    merge_event_id: &str,
) -> Result<Vec<ChangeRecord>, DatabaseError> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM change_records WHERE merge_event_id = ?1 ORDER BY seq ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(params![merge_event_id], row_to_change_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}


/// Delete one chain's records with `seq >= from_seq`. Returns the number removed.
pub fn delete_chain_from(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
    branch_id: &str,
    from_seq: i64,
) -> Result<usize, DatabaseError> {
    let removed = conn.execute(
        "DELETE FROM change_records
         WHERE entity_type = ?1 AND entity_id = ?2 AND branch_id = ?3 AND seq >= ?4",
        params![entity_type.as_str(), entity_id, branch_id, from_seq],
    )?;
    Ok(removed)
}


// ---------------------------------------------------------------------------
// merge_events
// ---------------------------------------------------------------------------

const MERGE_COLUMNS: &str = "id, sha, source_branch_id, target_branch_id, strategy,
     conflict_resolution, message, author_id, created_at, fast_forward, watermark_seq";

fn row_to_merge_event(row: &Row<'_>) -> rusqlite::Result<MergeEvent> {
    Ok(MergeEvent {
        id: row.get(0)?,
        sha: row.get(1)?,
        source_branch_id: row.get(2)?,
        target_branch_id: row.get(3)?,
        strategy: enum_col(row, 4, MergeStrategy::parse)?,
        conflict_resolution: enum_col(row, 5, ConflictResolution::parse)?,
        message: row.get(6)?,
        author_id: row.get(7)?,
        created_at: time_col(row, 8)?,
        affected_entities: Vec::new(),
        fast_forward: row.get(9)?,
        watermark_seq: row.get(10)?,
    })
}

fn load_affected_entities(conn: &Connection, event: &mut MergeEvent) -> Result<(), DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT entity_type, entity_id, entity_name, change_type, has_conflict, conflict_type,
         resolution, conflicting_fields
         FROM merge_affected_entities WHERE merge_event_id = ?1 ORDER BY position",
    )?;
    event.affected_entities = stmt
        .query_map(params![event.id], |row| {
            let conflict_type: Option<String> = row.get(5)?;
            let resolution: Option<String> = row.get(6)?;
            Ok(AffectedEntity {
                entity_type: enum_col(row, 0, EntityType::parse)?,
                entity_id: row.get(1)?,
                entity_name: row.get(2)?,
                change_type: enum_col(row, 3, MergeChangeType::parse)?,
                has_conflict: row.get(4)?,
                conflict_type: conflict_type.as_deref().and_then(ConflictType::parse),
                resolution: resolution.as_deref().and_then(ConflictResolution::parse),
                conflicting_fields: json_col(row, 7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(())
}

/// Insert a merge event and its affected entities.
pub fn insert_merge_event(conn: &Connection, event: &MergeEvent) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO merge_events (id, sha, source_branch_id, target_branch_id, strategy,
         conflict_resolution, message, author_id, created_at, fast_forward, watermark_seq)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            event.id,
            event.sha,
            event.source_branch_id,
            event.target_branch_id,
            event.strategy.as_str(),
            event.conflict_resolution.as_str(),
            event.message,
            event.author_id,
            event.created_at.to_rfc3339(),
            event.fast_forward,
            event.watermark_seq,
        ],
    )?;
    for (position, entity) in event.affected_entities.iter().enumerate() {
        conn.execute(
            "INSERT INTO merge_affected_entities (merge_event_id, position, entity_type,
             entity_id, entity_name, change_type, has_conflict, conflict_type, resolution,
             conflicting_fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.id,
                position as i64,
                entity.entity_type.as_str(),
                entity.entity_id,
                entity.entity_name,
                entity.change_type.as_str(),
                entity.has_conflict,
                entity.conflict_type.map(|c| c.as_str()),
                entity.resolution.map(|r| r.as_str()),
                encode_json("conflicting_fields", &entity.conflicting_fields)?,
            ],
        )?;
    }
    debug!(id = %event.id, affected = event.affected_entities.len(), "inserted merge event");
    Ok(())
}

/// Get a merge event by ID, including its affected entities.
pub fn get_merge_event(conn: &Connection, id: &str) -> Result<Option<MergeEvent>, DatabaseError> {
    let sql = format!("SELECT {MERGE_COLUMNS} FROM merge_events WHERE id = ?1");
    let event = conn.query_row(&sql, params![id], row_to_merge_event).optional()?;
    match event {
        Some(mut event) => {
            load_affected_entities(conn, &mut event)?;
            Ok(Some(event))
        }
        None => Ok(None),
    }
}

/// Most recent merge events into a branch, newest first.
pub fn list_merge_events_into(
    conn: &Connection,
    target_branch_id: &str,
    limit: u32,
) -> Result<Vec<MergeEvent>, DatabaseError> {
    let sql = format!(
        "SELECT {MERGE_COLUMNS} FROM merge_events WHERE target_branch_id = ?1
         ORDER BY watermark_seq DESC, created_at DESC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut events = stmt
        .query_map(params![target_branch_id, limit], row_to_merge_event)?
        .collect::<Result<Vec<_>, _>>()?;
    for event in &mut events {
        load_affected_entities(conn, event)?;
    }
    Ok(events)
}

// ---------------------------------------------------------------------------
// merge_marks
// ---------------------------------------------------------------------------

/// Highest seq of `source_branch_id`'s records for one entity already carried
/// into `target_branch_id`.
pub fn merge_mark(
    conn: &Connection,
    source_branch_id: &str,
    target_branch_id: &str,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<Option<i64>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT merged_seq FROM merge_marks
             WHERE source_branch_id = ?1 AND target_branch_id = ?2
               AND entity_type = ?3 AND entity_id = ?4",
            params![source_branch_id, target_branch_id, entity_type.as_str(), entity_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Raise a merge mark; a mark never moves backwards.
pub fn upsert_merge_mark(
    conn: &Connection,
    source_branch_id: &str,
    target_branch_id: &str,
    entity_type: EntityType,
    entity_id: &str,
    merged_seq: i64,
    merge_event_id: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO merge_marks (source_branch_id, target_branch_id, entity_type, entity_id,
         merged_seq, merge_event_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(source_branch_id, target_branch_id, entity_type, entity_id)
         DO UPDATE SET merged_seq = MAX(merged_seq, excluded.merged_seq),
                       merge_event_id = excluded.merge_event_id",
        params![
            source_branch_id,
            target_branch_id,
            entity_type.as_str(),
            entity_id,
            merged_seq,
            merge_event_id
        ],
    )?;
    Ok(())
}

/// Drop the marks one merge event set for one entity.
pub fn delete_merge_marks(
    conn: &Connection,
    merge_event_id: &str,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<usize, DatabaseError> {
    let removed = conn.execute(
        "DELETE FROM merge_marks
         WHERE merge_event_id = ?1 AND entity_type = ?2 AND entity_id = ?3",
        params![merge_event_id, entity_type.as_str(), entity_id],
    )?;
    Ok(removed)
}

/// Records on `branch_id` after `after_seq` that no merge mark covers.
///
/// With `into` set only marks towards that branch count; otherwise a
/// record is covered once it was carried anywhere.
pub fn count_unmerged_records(
    conn: &Connection,
    branch_id: &str,
    after_seq: i64,
    into: Option<&str>,
) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM change_records c
         WHERE c.branch_id = ?1 AND c.seq > ?2
           AND NOT EXISTS (
               SELECT 1 FROM merge_marks m
               WHERE m.source_branch_id = c.branch_id
                 AND (?3 IS NULL OR m.target_branch_id = ?3)
                 AND m.entity_type = c.entity_type
                 AND m.entity_id = c.entity_id
                 AND m.merged_seq >= c.seq)",
        params![branch_id, after_seq, into],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// rollbacks
// ---------------------------------------------------------------------------

fn row_to_rollback(row: &Row<'_>) -> rusqlite::Result<RollbackEntry> {
    Ok(RollbackEntry {
        id: row.get(0)?,
        merge_event_id: row.get(1)?,
        branch_id: row.get(2)?,
        strategy: enum_col(row, 3, RollbackStrategy::parse)?,
        message: row.get(4)?,
        author_id: row.get(5)?,
        forced: row.get(6)?,
        entity_ids: json_col(row, 7)?,
        created_at: time_col(row, 8)?,
    })
}

pub fn insert_rollback(conn: &Connection, entry: &RollbackEntry) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO rollbacks (id, merge_event_id, branch_id, strategy, message, author_id,
         forced, entity_ids, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.id,
            entry.merge_event_id,
            entry.branch_id,
            entry.strategy.as_str(),
            entry.message,
            entry.author_id,
            entry.forced,
            encode_json("entity_ids", &entry.entity_ids)?,
            entry.created_at.to_rfc3339(),
        ],
    )?;
    debug!(id = %entry.id, strategy = entry.strategy.as_str(), "inserted rollback");
    Ok(())
}

/// Rollbacks executed against one merge event, oldest first.
pub fn rollbacks_for_merge_event(
    conn: &Connection,
    merge_event_id: &str,
) -> Result<Vec<RollbackEntry>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, merge_event_id, branch_id, strategy, message, author_id, forced, entity_ids,
         created_at FROM rollbacks WHERE merge_event_id = ?1 ORDER BY created_at",
    )?;
    let entries = stmt
        .query_map(params![merge_event_id], row_to_rollback)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

// ---------------------------------------------------------------------------
// batches
// ---------------------------------------------------------------------------

pub fn get_batch(conn: &Connection, batch_id: &str) -> Result<Option<BatchEntry>, DatabaseError> {
    let entry = conn
        .query_row(
            "SELECT batch_id, version_id, tenant_id, branch_id, resource_type, description, tags,
             record_count, author_id, created_at FROM batches WHERE batch_id = ?1",
            params![batch_id],
            |row| {
                Ok(BatchEntry {
                    batch_id: row.get(0)?,
                    version_id: row.get(1)?,
                    tenant_id: row.get(2)?,
                    branch_id: row.get(3)?,
                    resource_type: row.get(4)?,
                    description: row.get(5)?,
                    tags: json_col(row, 6)?,
                    record_count: row.get(7)?,
                    author_id: row.get(8)?,
                    created_at: time_col(row, 9)?,
                })
            },
        )
        .optional()?;
    Ok(entry)
}

pub fn insert_batch(conn: &Connection, entry: &BatchEntry) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO batches (batch_id, version_id, tenant_id, branch_id, resource_type,
         description, tags, record_count, author_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.batch_id,
            entry.version_id,
            entry.tenant_id,
            entry.branch_id,
            entry.resource_type,
            entry.description,
            encode_json("tags", &entry.tags)?,
            entry.record_count,
            entry.author_id,
            entry.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// authors
// ---------------------------------------------------------------------------

pub fn upsert_author(conn: &Connection, id: &str, display_name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO authors (id, display_name, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name,
                                       updated_at = excluded.updated_at",
        params![id, display_name, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn author_name(conn: &Connection, id: &str) -> Result<Option<String>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT display_name FROM authors WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Display names for the given author ids; unknown ids are left out.
pub fn author_names<'a>(
    conn: &Connection,
    ids: impl IntoIterator<Item = &'a str>,
) -> Result<HashMap<String, String>, DatabaseError> {
    let ids: BTreeSet<&str> = ids.into_iter().collect();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT id, display_name FROM authors WHERE id IN ({placeholders})");
    let mut stmt = conn.prepare(&sql)?;
    let names = stmt
        .query_map(params_from_iter(ids), |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn branch(id: &str, parent: Option<&str>, is_default: bool) -> Branch {
        Branch {
            id: id.to_string(),
            tenant_id: "t1".into(),
            name: id.to_string(),
            description: None,
            parent_branch_id: parent.map(str::to_string),
            is_default,
            is_locked: false,
            collaborator_ids: vec!["alice".into()],
            change_count: 0,
            last_activity_at: None,
            created_at: Utc::now(),
            created_by: "alice".into(),
            base_seq: 0,
        }
    }

    #[test]
    fn test_branch_round_trip() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        insert_branch(&conn, &branch("main", None, true)).unwrap();
        insert_branch(&conn, &branch("dev", Some("main"), false)).unwrap();

        let dev = get_branch(&conn, "dev").unwrap().unwrap();
        assert_eq!(dev.parent_branch_id.as_deref(), Some("main"));
        assert_eq!(dev.collaborator_ids, vec!["alice".to_string()]);

        let listed = list_branches(&conn, "t1").unwrap();
        assert_eq!(listed[0].id, "main");
        assert_eq!(count_children(&conn, "main").unwrap(), 1);
        assert_eq!(default_branch(&conn, "t1").unwrap().unwrap().id, "main");
    }

    #[test]
    fn test_activity_and_lock_updates() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        insert_branch(&conn, &branch("main", None, true)).unwrap();

        record_branch_activity(&conn, "main", 3, Utc::now()).unwrap();
        record_branch_activity(&conn, "main", -5, Utc::now()).unwrap();
        set_branch_locked(&conn, "main", true).unwrap();

        let main = get_branch(&conn, "main").unwrap().unwrap();
        assert_eq!(main.change_count, 0);
        assert!(main.last_activity_at.is_some());
        assert!(main.is_locked);

        assert!(matches!(
            set_branch_locked(&conn, "missing", true),
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[test]
    fn test_current_seq_starts_at_zero() {
        let db = Database::open_in_memory_initialized().unwrap();
        assert_eq!(current_seq(&db.conn()).unwrap(), 0);
    }

    #[test]
    fn test_author_directory() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        upsert_author(&conn, "u1", "Alice").unwrap();
        upsert_author(&conn, "u1", "Alice Liddell").unwrap();
        assert_eq!(author_name(&conn, "u1").unwrap().as_deref(), Some("Alice Liddell"));
        assert_eq!(author_name(&conn, "u2").unwrap(), None);
        upsert_author(&conn, "u3", "Carol").unwrap();
        let names = author_names(&conn, ["u1", "u2", "u1"]).unwrap();
        assert_eq!(names.len(), 1);
        assert_eq!(names["u1"], "Alice Liddell");
        assert!(author_names(&conn, []).unwrap().is_empty());
    }
}
