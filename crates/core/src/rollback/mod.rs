//! Reverting merges and restoring single entities.
//!
//! [`planner`] decides which merge events can still be reverted and what
//! blocks the rest; [`executor`] writes the inverse records.

pub mod executor;
pub mod planner;

pub use executor::{DirectRollback, PointRollbackRequest, RollbackExecutor, RollbackRequest};
pub use planner::{MergedEntity, RevertAnalysis, RollbackPlanner};
