//! Error types for the branchbase core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

use crate::models::{MergeConflict, RollbackBlocker};

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the version-control engine.
///
/// Every mutation entry point is atomic: when one of these is returned, no
/// change record, merge event or rollback from the failed call is visible.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input: locked branch, unknown strategy, invariant violation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A branch, entity, merge event or version does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A merge could not proceed because of conflicts.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// Later edits make a safe revert impossible.
    #[error("rollback blocked by {} later change(s)", .blockers.len())]
    BlockedRollback { blockers: Vec<RollbackBlocker> },

    /// The per-branch mutation lock could not be acquired in time.
    #[error("branch '{branch_id}' is busy with another merge or rollback (waited {waited_ms} ms)")]
    ConcurrentMerge { branch_id: String, waited_ms: u64 },

    /// Storage-layer failure during an atomic operation.
    #[error("persistence failure: {0}")]
    Persistence(#[from] DatabaseError),

    /// The operation was cancelled before it committed.
    #[error("operation cancelled before commit")]
    Cancelled,

    /// The whole atomic operation exceeded its time budget.
    #[error("operation timed out after {0} ms")]
    TimedOut(u64),
}

impl EngineError {
    /// Shorthand for a [`EngineError::NotFound`].
    pub fn not_found(entity: &str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.into(),
        }
    }

    /// Shorthand for a [`EngineError::Validation`].
    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::Validation(detail.into())
    }

    /// Stable machine-readable error kind for API consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict_error",
            Self::BlockedRollback { .. } => "blocked_rollback_error",
            Self::ConcurrentMerge { .. } => "concurrent_merge_error",
            Self::Persistence(_) => "persistence_error",
            Self::Cancelled => "cancelled",
            Self::TimedOut(_) => "timed_out",
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(DatabaseError::SqliteError(e))
    }
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Reasons a merge was refused.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// `ABORT_ON_CONFLICT` was requested and at least one conflict exists.
    #[error("merge aborted: {} conflicting entit(y/ies)", .conflicts.len())]
    Conflicts { conflicts: Vec<MergeConflict> },

    /// `MANUAL` resolution was requested but some conflicts were not resolved.
    #[error("merge aborted: no manual resolution supplied for {}", .entity_ids.join(", "))]
    Unresolved {
        entity_ids: Vec<String>,
        conflicts: Vec<MergeConflict>,
    },

    /// A fast-forward was requested but the target has diverged.
    #[error("cannot fast-forward '{target_branch_id}': it has {target_changes} change(s) since divergence")]
    NotFastForwardable {
        target_branch_id: String,
        target_changes: usize,
    },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored JSON column could not be encoded or decoded.
    #[error("corrupt {column} column: {detail}")]
    Codec { column: String, detail: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
