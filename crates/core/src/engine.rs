//! Async, lock-aware facade over the engine components.
//!
//! Every call runs its blocking SQLite work on the blocking pool inside one
//! transaction. Merges and rollbacks are additionally serialized per target
//! branch: a caller waits at most `merge_lock_timeout` for the branch, then
//! the whole operation gets `operation_timeout` before it is cancelled and
//! rolled back. Reads never take the branch lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::batch::{BatchSink, BatchWriter, CommitBatchRequest, CommitBatchResponse};
use crate::branches::{BranchRegistry, NewBranch};
use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::db::{queries, Database};
use crate::errors::{DatabaseError, EngineError};
use crate::history::{ChangeHistoryService, ChangeRecordView, HistoryQuery};
use crate::merge::{MergeExecutor, MergePlanner, MergePreview, MergeRequest};
use crate::models::{
    Branch, BranchContext, ChangeRecord, ChangeType, EntityType, MergeEvent, Record,
    RollbackCandidate, RollbackResult,
};
use crate::rollback::{
    DirectRollback, PointRollbackRequest, RollbackExecutor, RollbackPlanner, RollbackRequest,
};
use crate::version_store::{NewChange, VersionStore};

/// A single edit outside a batch. The engine supplies `before` from the
/// entity's current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendRequest {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub branch_id: String,
    pub change_type: ChangeType,
    #[serde(default)]
    pub after_data: Option<Record>,
    #[serde(default)]
    pub author_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

type BranchLock = Arc<tokio::sync::Mutex<()>>;

pub struct Engine {
    db: Arc<Database>,
    config: EngineConfig,
    branch_locks: Mutex<HashMap<String, BranchLock>>,
}

impl Engine {
    pub fn new(db: Arc<Database>, config: EngineConfig) -> Self {
        info!(
            default_tenant = %config.default_tenant,
            merge_lock_timeout_ms = config.merge_lock_timeout_ms,
            operation_timeout_ms = config.operation_timeout_ms,
            "initializing engine"
        );
        Self {
            db,
            config,
            branch_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn tenant(&self, tenant_id: Option<&str>) -> String {
        tenant_id
            .filter(|t| !t.is_empty())
            .unwrap_or(self.config.default_tenant.as_str())
            .to_string()
    }

    // -----------------------------------------------------------------------
    // Branches
    // -----------------------------------------------------------------------

    /// The tenant's default branch, created on first use.
    pub async fn ensure_tenant(&self, tenant_id: Option<&str>) -> Result<Branch, EngineError> {
        let tenant = self.tenant(tenant_id);
        self.write(move |conn, config| bootstrap(conn, config, &tenant))
            .await
    }

    pub async fn list_branches(&self, tenant_id: Option<&str>) -> Result<Vec<Branch>, EngineError> {
        let tenant = self.tenant(tenant_id);
        self.write(move |conn, config| {
            bootstrap(conn, config, &tenant)?;
            registry(conn, config).list(&tenant)
        })
        .await
    }

    pub async fn get_branch(&self, branch_id: &str) -> Result<Branch, EngineError> {
        let id = branch_id.to_string();
        self.read(move |conn, config| registry(conn, config).get(&id))
            .await
    }

    pub async fn create_branch(
        &self,
        tenant_id: Option<&str>,
        created_by: &str,
        new: NewBranch,
    ) -> Result<Branch, EngineError> {
        let tenant = self.tenant(tenant_id);
        let created_by = created_by.to_string();
        self.write(move |conn, config| {
            if !new.is_default {
                bootstrap(conn, config, &tenant)?;
            }
            registry(conn, config).create(&tenant, &created_by, new)
        })
        .await
    }

    pub async fn lock_branch(&self, branch_id: &str) -> Result<Branch, EngineError> {
        let id = branch_id.to_string();
        self.write(move |conn, config| registry(conn, config).lock(&id))
            .await
    }

    pub async fn unlock_branch(&self, branch_id: &str) -> Result<Branch, EngineError> {
        let id = branch_id.to_string();
        self.write(move |conn, config| registry(conn, config).unlock(&id))
            .await
    }

    pub async fn switch_branch(
        &self,
        user_id: &str,
        branch_id: &str,
    ) -> Result<BranchContext, EngineError> {
        let (user, id) = (user_id.to_string(), branch_id.to_string());
        self.read(move |conn, config| registry(conn, config).switch(&user, &id))
            .await
    }

    pub async fn delete_branch(&self, branch_id: &str) -> Result<(), EngineError> {
        let id = branch_id.to_string();
        self.write(move |conn, config| registry(conn, config).delete(&id))
            .await
    }

    pub async fn add_collaborator(
        &self,
        branch_id: &str,
        user_id: &str,
    ) -> Result<Branch, EngineError> {
        let (id, user) = (branch_id.to_string(), user_id.to_string());
        self.write(move |conn, config| registry(conn, config).add_collaborator(&id, &user))
            .await
    }

    pub async fn remove_collaborator(
        &self,
        branch_id: &str,
        user_id: &str,
    ) -> Result<Branch, EngineError> {
        let (id, user) = (branch_id.to_string(), user_id.to_string());
        self.write(move |conn, config| registry(conn, config).remove_collaborator(&id, &user))
            .await
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    pub async fn append(&self, request: AppendRequest) -> Result<ChangeRecord, EngineError> {
        if request.author_id.trim().is_empty() {
            return Err(EngineError::invalid("change author must not be empty"));
        }
        self.write(move |conn, config| {
            let store = VersionStore::new(conn, config.max_branch_depth);
            let before =
                store.current_state(request.entity_type, &request.entity_id, &request.branch_id)?;
            match (request.change_type, &before) {
                (ChangeType::Create, Some(_)) => {
                    return Err(EngineError::invalid(format!(
                        "{} {} already exists",
                        request.entity_type, request.entity_id
                    )));
                }
                (ChangeType::Update | ChangeType::Delete, None) => {
                    return Err(EngineError::not_found(
                        request.entity_type.as_str(),
                        &request.entity_id,
                    ));
                }
                (ChangeType::Merge | ChangeType::Rollback, _) => {
                    return Err(EngineError::invalid(format!(
                        "{} records are written by merges and rollbacks only",
                        request.change_type
                    )));
                }
                _ => {}
            }
            let after = match request.change_type {
                ChangeType::Delete => None,
                _ => request.after_data,
            };
            store.append(
                NewChange::new(
                    request.entity_type,
                    request.entity_id,
                    request.branch_id,
                    request.change_type,
                    before,
                    after,
                    request.author_id,
                )
                .message(request.message),
            )
        })
        .await
    }

    pub async fn current_state(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        branch_id: &str,
    ) -> Result<Option<Record>, EngineError> {
        let (id, branch) = (entity_id.to_string(), branch_id.to_string());
        self.read(move |conn, config| {
            VersionStore::new(conn, config.max_branch_depth).current_state(entity_type, &id, &branch)
        })
        .await
    }

    pub async fn history(&self, query: HistoryQuery) -> Result<Vec<ChangeRecordView>, EngineError> {
        self.read(move |conn, config| {
            ChangeHistoryService::new(conn, config.max_branch_depth, config.history_default_limit)
                .history(&query)
        })
        .await
    }

    /// Server side of a batch flush; idempotent per `batchId`.
    pub async fn commit_batch(
        &self,
        request: CommitBatchRequest,
    ) -> Result<CommitBatchResponse, EngineError> {
        self.write(move |conn, config| {
            BatchWriter::new(conn, config.max_branch_depth).commit(&request)
        })
        .await
    }

    pub async fn register_author(&self, author_id: &str, display_name: &str) -> Result<(), EngineError> {
        if author_id.trim().is_empty() || display_name.trim().is_empty() {
            return Err(EngineError::invalid("author id and display name are required"));
        }
        let (id, name) = (author_id.to_string(), display_name.to_string());
        self.write(move |conn, _| Ok(queries::upsert_author(conn, &id, &name)?))
            .await
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    pub async fn merge_preview(
        &self,
        source_branch_id: &str,
        target_branch_id: &str,
    ) -> Result<MergePreview, EngineError> {
        let (source, target) = (source_branch_id.to_string(), target_branch_id.to_string());
        self.read(move |conn, config| {
            MergePlanner::new(conn, config.max_branch_depth).preview(&source, &target)
        })
        .await
    }

    /// Merge under the target branch's lock; the plan is recomputed once the
    /// lock is held so a queued merge sees the previous one's records.
    pub async fn merge(&self, request: MergeRequest) -> Result<MergeEvent, EngineError> {
        let target = request.target_branch_id.clone();
        self.locked(&target, move |conn, config, cancel| {
            MergeExecutor::new(conn, config.max_branch_depth, cancel).merge(&request)
        })
        .await
    }

    pub async fn merge_event(&self, merge_event_id: &str) -> Result<MergeEvent, EngineError> {
        let id = merge_event_id.to_string();
        self.read(move |conn, _| {
            queries::get_merge_event(conn, &id)?
                .ok_or_else(|| EngineError::not_found("merge event", &id))
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Rollback
    // -----------------------------------------------------------------------

    pub async fn rollback_candidates(
        &self,
        branch_id: &str,
        limit: u32,
    ) -> Result<Vec<RollbackCandidate>, EngineError> {
        let id = branch_id.to_string();
        self.read(move |conn, config| {
            RollbackPlanner::new(conn, config.max_branch_depth).rollbackable(&id, limit)
        })
        .await
    }

    /// Additive rollback (`CREATE_REVERT_COMMIT`, `SELECTIVE_REVERT`,
    /// `RESTORE_TO_POINT`).
    pub async fn rollback(&self, request: RollbackRequest) -> Result<RollbackResult, EngineError> {
        let target = self.merge_event(&request.merge_event_id).await?.target_branch_id;
        self.locked(&target, move |conn, config, cancel| {
            RollbackExecutor::new(conn, config.max_branch_depth, cancel).rollback(&request)
        })
        .await
    }

    /// Destructive rollback; see [`DirectRollback`].
    pub async fn direct_rollback(
        &self,
        request: DirectRollback,
    ) -> Result<RollbackResult, EngineError> {
        let target = self.merge_event(&request.merge_event_id).await?.target_branch_id;
        self.locked(&target, move |conn, config, cancel| {
            RollbackExecutor::new(conn, config.max_branch_depth, cancel).direct_rollback(&request)
        })
        .await
    }

    /// Single-entity point rollback.
    pub async fn restore_version(
        &self,
        request: PointRollbackRequest,
    ) -> Result<RollbackResult, EngineError> {
        let branch = request.branch_id.clone();
        self.locked(&branch, move |conn, config, cancel| {
            RollbackExecutor::new(conn, config.max_branch_depth, cancel).restore_version(&request)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Execution helpers
    // -----------------------------------------------------------------------

    fn branch_lock(&self, branch_id: &str) -> BranchLock {
        let mut locks = self.branch_locks.lock().unwrap_or_else(|poisoned| {
            warn!("branch lock table was poisoned, recovering");
            poisoned.into_inner()
        });
        Arc::clone(locks.entry(branch_id.to_string()).or_default())
    }

    async fn read<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection, &EngineConfig) -> Result<T, EngineError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || db.read(|conn| f(conn, &config)))
            .await
            .map_err(join_error)?
    }

    async fn write<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection, &EngineConfig) -> Result<T, EngineError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || db.transaction(|conn| f(conn, &config)))
            .await
            .map_err(join_error)?
    }

    /// Run `f` in one transaction while holding `branch_id`'s mutation lock.
    async fn locked<T, F>(&self, branch_id: &str, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection, &EngineConfig, CancellationToken) -> Result<T, EngineError>
            + Send
            + 'static,
        T: Send + 'static,
    {
        let wait = self.config.merge_lock_timeout();
        let guard = match tokio::time::timeout(wait, self.branch_lock(branch_id).lock_owned()).await
        {
            Ok(guard) => guard,
            Err(_) => {
                warn!(branch_id, waited_ms = self.config.merge_lock_timeout_ms, "branch lock contended");
                return Err(EngineError::ConcurrentMerge {
                    branch_id: branch_id.to_string(),
                    waited_ms: self.config.merge_lock_timeout_ms,
                });
            }
        };

        let cancel = CancellationToken::new();
        // Dropping this future cancels the blocking task at its next checkpoint.
        let on_drop = cancel.clone().drop_guard();
        let db = Arc::clone(&self.db);
        let config = self.config.clone();
        let token = cancel.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            db.transaction(|conn| f(conn, &config, token))
        });

        let result = match tokio::time::timeout(self.config.operation_timeout(), &mut task).await {
            Ok(joined) => joined.map_err(join_error)?,
            Err(_) => {
                cancel.cancel();
                match task.await.map_err(join_error)? {
                    Err(EngineError::Cancelled) => {
                        warn!(branch_id, timeout_ms = self.config.operation_timeout_ms, "operation timed out");
                        Err(EngineError::TimedOut(self.config.operation_timeout_ms))
                    }
                    other => other,
                }
            }
        };
        let _ = on_drop.disarm();
        result
    }
}

impl BatchSink for Engine {
    async fn commit_batch(
        &self,
        request: CommitBatchRequest,
    ) -> Result<CommitBatchResponse, EngineError> {
        Engine::commit_batch(self, request).await
    }
}

fn registry<'c>(conn: &'c Connection, config: &EngineConfig) -> BranchRegistry<'c> {
    BranchRegistry::new(conn, config.max_branch_depth)
}

fn bootstrap(conn: &Connection, config: &EngineConfig, tenant: &str) -> Result<Branch, EngineError> {
    registry(conn, config).ensure_default(tenant, &config.default_branch_name, "system")
}

fn join_error(e: tokio::task::JoinError) -> EngineError {
    EngineError::Persistence(DatabaseError::IoError(std::io::Error::other(format!(
        "engine task failed: {e}"
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::Checkpoint;
    use std::time::Duration;

    fn engine(lock_ms: u64, op_ms: u64) -> Engine {
        let db = Database::open_in_memory_initialized().unwrap();
        Engine::new(
            Arc::new(db),
            EngineConfig {
                merge_lock_timeout_ms: lock_ms,
                operation_timeout_ms: op_ms,
                ..EngineConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_contended_branch_lock() {
        let engine = engine(20, 5_000);
        let _held = engine.branch_lock("main").lock_owned().await;

        let result = engine.locked("main", |_, _, _| Ok(())).await;
        match result {
            Err(EngineError::ConcurrentMerge { branch_id, waited_ms }) => {
                assert_eq!(branch_id, "main");
                assert_eq!(waited_ms, 20);
            }
            other => panic!("expected ConcurrentMerge, got {other:?}"),
        }

        // Other branches are unaffected.
        engine.locked("dev", |_, _, _| Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn test_operation_timeout_cancels_and_rolls_back() {
        let engine = engine(1_000, 50);
        let result: Result<(), EngineError> = engine
            .locked("main", |conn, _, cancel| {
                queries::upsert_author(conn, "ghost", "Ghost")?;
                loop {
                    cancel.checkpoint()?;
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
            .await;
        assert!(matches!(result, Err(EngineError::TimedOut(50))));

        let name = engine.db().read(|conn| queries::author_name(conn, "ghost")).unwrap();
        assert_eq!(name, None);

        // The lock was released with the task.
        engine.locked("main", |_, _, _| Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn test_append_resolves_before_from_current_state() {
        let engine = engine(1_000, 5_000);
        let main = engine.ensure_tenant(None).await.unwrap();
        assert!(main.is_default);
        assert_eq!(main.tenant_id, "default");

        let create = AppendRequest {
            entity_type: EntityType::Workflow,
            entity_id: "W1".into(),
            branch_id: main.id.clone(),
            change_type: ChangeType::Create,
            after_data: serde_json::json!({"name": "Onboard"}).as_object().cloned(),
            author_id: "alice".into(),
            message: None,
        };
        engine.append(create.clone()).await.unwrap();
        assert!(matches!(
            engine.append(create.clone()).await,
            Err(EngineError::Validation(_))
        ));

        let update = AppendRequest {
            change_type: ChangeType::Update,
            after_data: serde_json::json!({"name": "Onboarding"}).as_object().cloned(),
            ..create.clone()
        };
        let record = engine.append(update).await.unwrap();
        assert_eq!(record.before_data, serde_json::json!({"name": "Onboard"}).as_object().cloned());

        let missing = AppendRequest {
            entity_id: "W2".into(),
            change_type: ChangeType::Delete,
            ..create
        };
        assert!(matches!(
            engine.append(missing).await,
            Err(EngineError::NotFound { .. })
        ));
    }
}
