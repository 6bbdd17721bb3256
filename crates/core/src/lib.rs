//! branchbase core library.
//!
//! A lightweight version-control engine for structured records: entities live
//! inside named branches that inherit from their parent until overridden,
//! every edit is an immutable change record, and branches are merged with
//! three-way conflict detection and reverted without losing history.
//!
//! [`Engine`] is the async entry point used by the web server, daemon and
//! CLI. The synchronous components it composes ([`version_store`],
//! [`branches`], [`merge`], [`rollback`], [`history`], [`batch`]) each run
//! against a borrowed SQLite connection inside the caller's transaction.

pub mod batch;
pub mod branches;
pub mod cancel;
pub mod config;
pub mod db;
pub mod diff;
pub mod engine;
pub mod errors;
pub mod history;
pub mod merge;
pub mod models;
pub mod rollback;
pub mod version_store;

// Re-exports for convenience.
pub use batch::{BatchAccumulator, BatchChange, BatchSink, CommitBatchRequest, CommitBatchResponse};
pub use branches::NewBranch;
pub use cancel::{CancellationToken, Checkpoint};
pub use config::AppConfig;
pub use db::Database;
pub use engine::{AppendRequest, Engine};
pub use errors::{ConflictError, CoreError, EngineError};
pub use history::{ChangeRecordView, HistoryQuery};
pub use merge::{ManualResolution, MergePreview, MergeRequest};
pub use rollback::{DirectRollback, PointRollbackRequest, RollbackRequest};
