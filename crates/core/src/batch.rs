//! Batched commits.
//!
//! [`BatchAccumulator`] lives next to an editing session and coalesces rapid
//! edits of the same entity into one pending change. [`BatchAccumulator::flush`]
//! hands the batch to a [`BatchSink`] (normally the engine), whose server
//! side is [`BatchWriter`]: it writes one record per pending change and
//! remembers the `batchId` so a retried flush is answered from the ledger
//! instead of appending twice.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::queries::{self, BatchEntry};
use crate::diff;
use crate::errors::EngineError;
use crate::models::{
    ChangeRecord, ChangeType, EntityType, FieldChange, FieldChangeType, FieldChanges, Record,
};
use crate::version_store::{NewChange, VersionStore};

/// One coalesced pending edit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchChange {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: ChangeType,
    #[serde(default)]
    pub before_data: Option<Record>,
    #[serde(default)]
    pub after_data: Option<Record>,
    /// Every field touched at any point in the batch.
    #[serde(default)]
    pub field_changes: FieldChanges,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitBatchRequest {
    pub batch_id: String,
    #[serde(default)]
    pub tenant_id: String,
    pub branch_id: String,
    #[serde(default)]
    pub resource_type: Option<String>,
    pub changes: Vec<BatchChange>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub author_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitBatchResponse {
    pub version_id: String,
    pub batch_id: String,
    pub record_count: usize,
    /// The batch id was already committed; nothing new was written.
    pub replayed: bool,
}

/// Where a flushed batch goes.
pub trait BatchSink: Send + Sync {
    fn commit_batch(
        &self,
        request: CommitBatchRequest,
    ) -> impl Future<Output = Result<CommitBatchResponse, EngineError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchKey {
    entity_type: EntityType,
    entity_id: String,
    operation: ChangeType,
}

/// Session-scoped edit accumulator.
#[derive(Debug)]
pub struct BatchAccumulator {
    tenant_id: String,
    branch_id: String,
    author_id: String,
    resource_type: Option<String>,
    batch_id: String,
    changes: Vec<BatchChange>,
    index: HashMap<BatchKey, usize>,
    max_pending: usize,
}

impl BatchAccumulator {
    pub fn new(
        tenant_id: impl Into<String>,
        branch_id: impl Into<String>,
        author_id: impl Into<String>,
        max_pending: usize,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            branch_id: branch_id.into(),
            author_id: author_id.into(),
            resource_type: None,
            batch_id: Uuid::new_v4().to_string(),
            changes: Vec::new(),
            index: HashMap::new(),
            max_pending,
        }
    }

    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn branch_id(&self) -> &str {
        &self.branch_id
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &[BatchChange] {
        &self.changes
    }

    /// Record an edit, merging it into any pending edit with the same entity
    /// and operation.
    ///
    /// The merged entry keeps the first `before` and the latest `after`. Its
    /// field set only grows: a field changed and later changed back is still
    /// reported as touched.
    pub fn track_change(
        &mut self,
        entity_type: EntityType,
        entity_id: &str,
        operation: ChangeType,
        before: Option<Record>,
        after: Option<Record>,
    ) -> Result<(), EngineError> {
        if !matches!(
            operation,
            ChangeType::Create | ChangeType::Update | ChangeType::Delete
        ) {
            return Err(EngineError::invalid(format!(
                "{operation} cannot be batched"
            )));
        }
        let field_changes = diff::diff(before.as_ref(), after.as_ref());
        let key = BatchKey {
            entity_type,
            entity_id: entity_id.to_string(),
            operation,
        };

        if let Some(&pos) = self.index.get(&key) {
            let pending = &mut self.changes[pos];
            for (field, change) in field_changes {
                match pending.field_changes.get_mut(&field) {
                    Some(existing) => {
                        existing.to = change.to;
                        let kind = coalesced_kind(existing);
                        existing.kind = kind;
                    }
                    None => {
                        pending.field_changes.insert(field, change);
                    }
                }
            }
            pending.after_data = after;
            debug!(entity_id, %operation, fields = pending.field_changes.len(), "coalesced batch change");
            return Ok(());
        }

        if self.changes.len() >= self.max_pending {
            return Err(EngineError::invalid(format!(
                "batch {} already holds {} pending change(s)",
                self.batch_id, self.max_pending
            )));
        }
        self.index.insert(key, self.changes.len());
        self.changes.push(BatchChange {
            entity_type,
            entity_id: entity_id.to_string(),
            operation,
            before_data: before,
            after_data: after,
            field_changes,
        });
        Ok(())
    }

    /// Drop every pending change without committing.
    pub fn discard(&mut self) {
        self.changes.clear();
        self.index.clear();
    }

    pub fn to_request(&self, description: Option<String>, tags: Vec<String>) -> CommitBatchRequest {
        CommitBatchRequest {
            batch_id: self.batch_id.clone(),
            tenant_id: self.tenant_id.clone(),
            branch_id: self.branch_id.clone(),
            resource_type: self.resource_type.clone(),
            changes: self.changes.clone(),
            description,
            tags,
            author_id: self.author_id.clone(),
        }
    }

    /// Commit the pending changes. `Ok(None)` when there was nothing to do.
    ///
    /// On failure the pending changes and the batch id are kept, so the next
    /// flush resubmits the same batch and the sink can deduplicate it.
    pub async fn flush<S: BatchSink>(
        &mut self,
        sink: &S,
        description: Option<String>,
        tags: Vec<String>,
    ) -> Result<Option<CommitBatchResponse>, EngineError> {
        if self.is_empty() {
            return Ok(None);
        }
        let request = self.to_request(description, tags);
        let response = sink.commit_batch(request).await?;
        self.discard();
        self.batch_id = Uuid::new_v4().to_string();
        Ok(Some(response))
    }
}

/// Kind of a coalesced field change, judged from its earliest `from` and
/// latest `to`.
fn coalesced_kind(change: &FieldChange) -> FieldChangeType {
    match (&change.from, &change.to) {
        (None, Some(_)) => FieldChangeType::Added,
        (Some(_), None) => FieldChangeType::Deleted,
        _ => FieldChangeType::Modified,
    }
}

/// Flush `accumulator` into `sink` every `interval` until the task is aborted.
pub fn spawn_auto_flush<S>(
    accumulator: Arc<Mutex<BatchAccumulator>>,
    sink: Arc<S>,
    interval: Duration,
) -> JoinHandle<()>
where
    S: BatchSink + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mut acc = accumulator.lock().await;
            match acc.flush(sink.as_ref(), None, Vec::new()).await {
                Ok(Some(response)) => debug!(
                    batch_id = %response.batch_id,
                    records = response.record_count,
                    "auto-flushed batch"
                ),
                Ok(None) => {}
                Err(e) => warn!(batch_id = %acc.batch_id(), error = %e, "auto-flush failed, will retry"),
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Writes a committed batch inside the caller's transaction.
pub struct BatchWriter<'c> {
    conn: &'c Connection,
    store: VersionStore<'c>,
}

impl<'c> BatchWriter<'c> {
    pub fn new(conn: &'c Connection, max_depth: usize) -> Self {
        Self {
            conn,
            store: VersionStore::new(conn, max_depth),
        }
    }

    pub fn commit(&self, request: &CommitBatchRequest) -> Result<CommitBatchResponse, EngineError> {
        if request.batch_id.trim().is_empty() {
            return Err(EngineError::invalid("batchId must not be empty"));
        }
        if request.author_id.trim().is_empty() {
            return Err(EngineError::invalid("batch author must not be empty"));
        }

        if let Some(existing) = queries::get_batch(self.conn, &request.batch_id)? {
            if existing.branch_id != request.branch_id {
                return Err(EngineError::invalid(format!(
                    "batch {} was already committed to another branch",
                    request.batch_id
                )));
            }
            info!(batch_id = %request.batch_id, version_id = %existing.version_id, "batch replayed");
            return Ok(CommitBatchResponse {
                version_id: existing.version_id,
                batch_id: existing.batch_id,
                record_count: usize::try_from(existing.record_count).unwrap_or_default(),
                replayed: true,
            });
        }

        let branch = self.store.branch(&request.branch_id)?;
        if !request.tenant_id.is_empty() && branch.tenant_id != request.tenant_id {
            return Err(EngineError::not_found("branch", &request.branch_id));
        }

        let mut records = Vec::with_capacity(request.changes.len());
        for change in &request.changes {
            if let Some(record) = self.write(request, change)? {
                records.push(record);
            }
        }

        let entry = BatchEntry {
            batch_id: request.batch_id.clone(),
            version_id: Uuid::new_v4().to_string(),
            tenant_id: branch.tenant_id.clone(),
            branch_id: branch.id.clone(),
            resource_type: request.resource_type.clone(),
            description: request.description.clone(),
            tags: request.tags.clone(),
            record_count: i64::try_from(records.len()).unwrap_or(i64::MAX),
            author_id: request.author_id.clone(),
            created_at: Utc::now(),
        };
        queries::insert_batch(self.conn, &entry)?;

        info!(
            batch_id = %entry.batch_id,
            version_id = %entry.version_id,
            branch = %branch.name,
            records = entry.record_count,
            "batch committed"
        );
        Ok(CommitBatchResponse {
            version_id: entry.version_id,
            batch_id: entry.batch_id,
            record_count: records.len(),
            replayed: false,
        })
    }

    /// Append one batched change on top of whatever the chain holds now.
    fn write(
        &self,
        request: &CommitBatchRequest,
        change: &BatchChange,
    ) -> Result<Option<ChangeRecord>, EngineError> {
        let current = self.store.current_state(
            change.entity_type,
            &change.entity_id,
            &request.branch_id,
        )?;
        let (change_type, after) = match change.operation {
            ChangeType::Delete => {
                if current.is_none() {
                    return Err(EngineError::not_found(
                        change.entity_type.as_str(),
                        &change.entity_id,
                    ));
                }
                (ChangeType::Delete, None)
            }
            ChangeType::Create | ChangeType::Update => {
                let after = change.after_data.clone().ok_or_else(|| {
                    EngineError::invalid(format!(
                        "{} of {} {} has no afterData",
                        change.operation, change.entity_type, change.entity_id
                    ))
                })?;
                let kind = if current.is_some() {
                    ChangeType::Update
                } else {
                    ChangeType::Create
                };
                (kind, Some(after))
            }
            other => {
                return Err(EngineError::invalid(format!("{other} cannot be batched")));
            }
        };
        if current == after {
            return Ok(None);
        }

        let record = self.store.append(
            NewChange::new(
                change.entity_type,
                &change.entity_id,
                &request.branch_id,
                change_type,
                current,
                after,
                request.author_id.as_str(),
            )
            .message(request.description.clone())
            .batch(&request.batch_id),
        )?;
        Ok(Some(record))
    }
}
