//! Branch merging.
//!
//! [`planner`] compares two branches against their merge base and classifies
//! every touched entity; [`executor`] applies a strategy and a conflict
//! resolution policy to a plan and records the resulting merge event.

pub mod executor;
pub mod planner;

pub use executor::{ManualResolution, MergeExecutor, MergeRequest};
pub use planner::{MergePlan, MergePlanner, MergePreview, PlannedEntity};
