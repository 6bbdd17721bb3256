//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `schema_version`
//! user-version pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS branches (
            id                TEXT PRIMARY KEY,
            tenant_id         TEXT    NOT NULL,
            name              TEXT    NOT NULL,
            description       TEXT,
            parent_branch_id  TEXT REFERENCES branches (id),
            is_default        INTEGER NOT NULL DEFAULT 0,
            is_locked         INTEGER NOT NULL DEFAULT 0,
            change_count      INTEGER NOT NULL DEFAULT 0,
            last_activity_at  TEXT,
            created_at        TEXT    NOT NULL,
            created_by        TEXT    NOT NULL DEFAULT '',
            base_seq          INTEGER NOT NULL DEFAULT 0,
            UNIQUE (tenant_id, name)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_branches_one_default
            ON branches (tenant_id) WHERE is_default = 1;
        CREATE INDEX IF NOT EXISTS idx_branches_parent ON branches (parent_branch_id);

        CREATE TABLE IF NOT EXISTS branch_collaborators (
            branch_id   TEXT NOT NULL REFERENCES branches (id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            added_at    TEXT NOT NULL,
            PRIMARY KEY (branch_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS merge_events (
            id                   TEXT PRIMARY KEY,
            sha                  TEXT    NOT NULL,
            source_branch_id     TEXT    NOT NULL,
            target_branch_id     TEXT    NOT NULL,
            strategy             TEXT    NOT NULL,
            conflict_resolution  TEXT    NOT NULL,
            message              TEXT    NOT NULL DEFAULT '',
            author_id            TEXT    NOT NULL,
            created_at           TEXT    NOT NULL,
            fast_forward         INTEGER NOT NULL DEFAULT 0,
            watermark_seq        INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_merge_events_target ON merge_events (target_branch_id);
        CREATE INDEX IF NOT EXISTS idx_merge_events_source ON merge_events (source_branch_id);

        CREATE TABLE IF NOT EXISTS merge_affected_entities (
            merge_event_id     TEXT    NOT NULL REFERENCES merge_events (id) ON DELETE CASCADE,
            position           INTEGER NOT NULL,
            entity_type        TEXT    NOT NULL,
            entity_id          TEXT    NOT NULL,
            entity_name        TEXT,
            change_type        TEXT    NOT NULL,
            has_conflict       INTEGER NOT NULL DEFAULT 0,
            conflict_type      TEXT,
            resolution         TEXT,
            conflicting_fields TEXT    NOT NULL DEFAULT '[]',
            PRIMARY KEY (merge_event_id, position)
        );

        CREATE TABLE IF NOT EXISTS rollbacks (
            id               TEXT PRIMARY KEY,
            merge_event_id   TEXT REFERENCES merge_events (id),
            branch_id        TEXT    NOT NULL,
            strategy         TEXT    NOT NULL,
            message          TEXT    NOT NULL DEFAULT '',
            author_id        TEXT    NOT NULL,
            forced           INTEGER NOT NULL DEFAULT 0,
            entity_ids       TEXT    NOT NULL DEFAULT '[]',
            created_at       TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_rollbacks_merge_event ON rollbacks (merge_event_id);

        CREATE TABLE IF NOT EXISTS change_records (
            seq              INTEGER PRIMARY KEY AUTOINCREMENT,
            id               TEXT    NOT NULL UNIQUE,
            sha              TEXT    NOT NULL,
            entity_type      TEXT    NOT NULL,
            entity_id        TEXT    NOT NULL,
            branch_id        TEXT    NOT NULL REFERENCES branches (id),
            change_type      TEXT    NOT NULL
                CHECK (change_type IN ('CREATE', 'UPDATE', 'DELETE', 'MERGE', 'ROLLBACK')),
            before_data      TEXT,
            after_data       TEXT,
            field_changes    TEXT    NOT NULL DEFAULT '{}',
            author_id        TEXT    NOT NULL,
            message          TEXT,
            created_at       TEXT    NOT NULL,
            merge_event_id   TEXT,
            rollback_id      TEXT,
            batch_id         TEXT,
            is_conflicted    INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_change_records_chain
            ON change_records (entity_type, entity_id, branch_id, seq);
        CREATE INDEX IF NOT EXISTS idx_change_records_branch_seq
            ON change_records (branch_id, seq);
        CREATE INDEX IF NOT EXISTS idx_change_records_sha ON change_records (sha);
        CREATE INDEX IF NOT EXISTS idx_change_records_merge_event
            ON change_records (merge_event_id);
        CREATE INDEX IF NOT EXISTS idx_change_records_rollback
            ON change_records (rollback_id);
        "#,
    ),
    (
        2,
        "batch ledger and author directory",
        r#"
        CREATE TABLE IF NOT EXISTS batches (
            batch_id      TEXT PRIMARY KEY,
            version_id    TEXT    NOT NULL,
            tenant_id     TEXT    NOT NULL,
            branch_id     TEXT    NOT NULL REFERENCES branches (id),
            resource_type TEXT,
            description   TEXT,
            tags          TEXT    NOT NULL DEFAULT '[]',
            record_count  INTEGER NOT NULL DEFAULT 0,
            author_id     TEXT    NOT NULL,
            created_at    TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS authors (
            id            TEXT PRIMARY KEY,
            display_name  TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        "#,
    ),
    (
        3,
        "per-entity merge marks",
        r#"
        CREATE TABLE IF NOT EXISTS merge_marks (
            source_branch_id  TEXT    NOT NULL,
            target_branch_id  TEXT    NOT NULL,
            entity_type       TEXT    NOT NULL,
            entity_id         TEXT    NOT NULL,
            merged_seq        INTEGER NOT NULL,
            merge_event_id    TEXT    NOT NULL,
            PRIMARY KEY (source_branch_id, target_branch_id, entity_type, entity_id)
        );

        CREATE INDEX IF NOT EXISTS idx_merge_marks_event ON merge_marks (merge_event_id);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
pub fn schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 3);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        for table in [
            "branches",
            "branch_collaborators",
            "change_records",
            "merge_events",
            "merge_affected_entities",
            "rollbacks",
            "batches",
            "authors",
            "merge_marks",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_single_default_branch_per_tenant_enforced() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let insert = "INSERT INTO branches (id, tenant_id, name, is_default, created_at)
                      VALUES (?1, 't1', ?2, 1, '2025-01-01T00:00:00Z')";
        conn.execute(insert, rusqlite::params!["b1", "main"]).unwrap();
        assert!(conn.execute(insert, rusqlite::params!["b2", "other"]).is_err());
    }
}
