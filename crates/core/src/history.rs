//! Read-side history timelines for presentation.
//!
//! Wraps [`VersionStore::history`] and decorates each record with the
//! author's display name, the name of the branch it was written on and
//! whether it was inherited from an ancestor branch.

use std::collections::HashMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::queries;
use crate::errors::EngineError;
use crate::models::{ChangeRecord, EntityType};
use crate::version_store::VersionStore;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub branch_id: String,
    #[serde(default = "default_true")]
    pub include_field_changes: bool,
    /// When false, `beforeData` and `afterData` are stripped.
    #[serde(default)]
    pub include_content: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// A change record as shown in a history timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecordView {
    #[serde(flatten)]
    pub record: ChangeRecord,
    pub author_name: Option<String>,
    pub branch_name: Option<String>,
    /// Written on an ancestor branch rather than the queried one.
    pub inherited: bool,
}

pub struct ChangeHistoryService<'c> {
    conn: &'c Connection,
    store: VersionStore<'c>,
    default_limit: usize,
}

impl<'c> ChangeHistoryService<'c> {
    pub fn new(conn: &'c Connection, max_depth: usize, default_limit: usize) -> Self {
        Self {
            conn,
            store: VersionStore::new(conn, max_depth),
            default_limit,
        }
    }

    pub fn history(&self, query: &HistoryQuery) -> Result<Vec<ChangeRecordView>, EngineError> {
        let lineage = self.store.branches().ancestry(&query.branch_id)?;
        let branch_names: HashMap<String, String> = lineage
            .into_iter()
            .map(|b| (b.id, b.name))
            .collect();
        let records = self.store.history(
            query.entity_type,
            &query.entity_id,
            &query.branch_id,
            Some(query.limit.unwrap_or(self.default_limit)),
            true,
        )?;
        let authors =
            queries::author_names(self.conn, records.iter().map(|r| r.author_id.as_str()))?;

        Ok(records
            .into_iter()
            .map(|mut record| {
                if !query.include_content {
                    record.before_data = None;
                    record.after_data = None;
                }
                if !query.include_field_changes {
                    record.field_changes.clear();
                }
                ChangeRecordView {
                    author_name: authors.get(&record.author_id).cloned(),
                    branch_name: branch_names.get(&record.branch_id).cloned(),
                    inherited: record.branch_id != query.branch_id,
                    record,
                }
            })
            .collect())
    }
}
