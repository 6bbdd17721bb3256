//! Branch metadata: hierarchy, lock state, collaborators and activity.
//!
//! Branches form a per-tenant forest rooted at the tenant's single default
//! branch. Creating a branch copies nothing; readers resolve inherited state
//! by walking [`BranchRegistry::ancestry`]. Every mutation re-checks the
//! forest invariants inside the caller's transaction so a violation rolls the
//! whole mutation back.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::queries;
use crate::errors::EngineError;
use crate::models::{Branch, BranchContext};

/// Input for [`BranchRegistry::create`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBranch {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Parent to fork from; defaults to the tenant's default branch.
    #[serde(default)]
    pub parent_branch_id: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub collaborator_ids: Vec<String>,
}

/// Lowest common ancestor of two branches and the paths leading to it.
#[derive(Debug, Clone)]
pub struct CommonAncestry {
    pub ancestor: Branch,
    /// From the first branch up to, but excluding, the ancestor.
    pub left_path: Vec<Branch>,
    /// From the second branch up to, but excluding, the ancestor.
    pub right_path: Vec<Branch>,
}

pub struct BranchRegistry<'c> {
    conn: &'c Connection,
    max_depth: usize,
}

impl<'c> BranchRegistry<'c> {
    pub fn new(conn: &'c Connection, max_depth: usize) -> Self {
        Self { conn, max_depth }
    }

    pub fn get(&self, branch_id: &str) -> Result<Branch, EngineError> {
        queries::get_branch(self.conn, branch_id)?
            .ok_or_else(|| EngineError::not_found("branch", branch_id))
    }

    pub fn list(&self, tenant_id: &str) -> Result<Vec<Branch>, EngineError> {
        Ok(queries::list_branches(self.conn, tenant_id)?)
    }

    pub fn default_branch(&self, tenant_id: &str) -> Result<Option<Branch>, EngineError> {
        Ok(queries::default_branch(self.conn, tenant_id)?)
    }

    /// Return the tenant's default branch, creating it on first use.
    pub fn ensure_default(
        &self,
        tenant_id: &str,
        name: &str,
        created_by: &str,
    ) -> Result<Branch, EngineError> {
        if let Some(branch) = self.default_branch(tenant_id)? {
            return Ok(branch);
        }
        info!(tenant_id, name, "bootstrapping default branch");
        self.create(
            tenant_id,
            created_by,
            NewBranch {
                name: name.to_string(),
                description: Some("Default branch".into()),
                is_default: true,
                ..NewBranch::default()
            },
        )
    }

    /// Create a branch forked from the current state of its parent.
    pub fn create(
        &self,
        tenant_id: &str,
        created_by: &str,
        new: NewBranch,
    ) -> Result<Branch, EngineError> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(EngineError::invalid("branch name must not be empty"));
        }
        if queries::get_branch_by_name(self.conn, tenant_id, name)?.is_some() {
            return Err(EngineError::invalid(format!(
                "branch '{name}' already exists"
            )));
        }

        let parent = if new.is_default {
            if new.parent_branch_id.is_some() {
                return Err(EngineError::invalid(
                    "the default branch cannot have a parent",
                ));
            }
            if self.default_branch(tenant_id)?.is_some() {
                return Err(EngineError::invalid(format!(
                    "tenant '{tenant_id}' already has a default branch"
                )));
            }
            None
        } else {
            let parent = match new.parent_branch_id.as_deref() {
                Some(parent_id) => self.get(parent_id)?,
                None => self.default_branch(tenant_id)?.ok_or_else(|| {
                    EngineError::invalid(format!(
                        "tenant '{tenant_id}' has no default branch to fork from"
                    ))
                })?,
            };
            if parent.tenant_id != tenant_id {
                return Err(EngineError::invalid(format!(
                    "parent branch '{}' belongs to another tenant",
                    parent.id
                )));
            }
            if self.ancestry(&parent.id)?.len() >= self.max_depth {
                return Err(EngineError::invalid(format!(
                    "branch nesting deeper than {} levels",
                    self.max_depth
                )));
            }
            Some(parent)
        };

        let mut collaborator_ids = vec![created_by.to_string()];
        for id in new.collaborator_ids {
            if !collaborator_ids.contains(&id) {
                collaborator_ids.push(id);
            }
        }

        let branch = Branch {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            description: new.description,
            parent_branch_id: parent.map(|p| p.id),
            is_default: new.is_default,
            is_locked: new.is_locked,
            collaborator_ids,
            change_count: 0,
            last_activity_at: None,
            created_at: Utc::now(),
            created_by: created_by.to_string(),
            base_seq: queries::current_seq(self.conn)?,
        };
        queries::insert_branch(self.conn, &branch)?;
        self.check_invariants(tenant_id)?;

        info!(
            branch_id = %branch.id,
            name = %branch.name,
            parent = ?branch.parent_branch_id,
            base_seq = branch.base_seq,
            "created branch"
        );
        Ok(branch)
    }

    pub fn lock(&self, branch_id: &str) -> Result<Branch, EngineError> {
        self.set_locked(branch_id, true)
    }

    pub fn unlock(&self, branch_id: &str) -> Result<Branch, EngineError> {
        self.set_locked(branch_id, false)
    }

    fn set_locked(&self, branch_id: &str, locked: bool) -> Result<Branch, EngineError> {
        let branch = self.get(branch_id)?;
        queries::set_branch_locked(self.conn, branch_id, locked)?;
        self.check_invariants(&branch.tenant_id)?;
        info!(branch_id, locked, "branch lock changed");
        self.get(branch_id)
    }

    /// Point a session at a branch. Nothing is stored; the returned context
    /// is passed into later engine calls.
    pub fn switch(&self, user_id: &str, branch_id: &str) -> Result<BranchContext, EngineError> {
        let branch = self.get(branch_id)?;
        if branch.is_locked {
            return Err(EngineError::invalid(format!(
                "branch '{}' is locked",
                branch.name
            )));
        }
        debug!(user_id, branch_id, "switched branch");
        Ok(BranchContext {
            user_id: user_id.to_string(),
            tenant_id: branch.tenant_id,
            branch_id: branch.id,
            branch_name: branch.name,
        })
    }

    /// Delete a branch that holds no unmerged edits.
    pub fn delete(&self, branch_id: &str) -> Result<(), EngineError> {
        let branch = self.get(branch_id)?;
        if branch.is_default {
            return Err(EngineError::invalid("the default branch cannot be deleted"));
        }
        if branch.is_locked {
            return Err(EngineError::invalid(format!(
                "branch '{}' is locked",
                branch.name
            )));
        }
        if queries::count_children(self.conn, branch_id)? > 0 {
            return Err(EngineError::invalid(format!(
                "branch '{}' has child branches",
                branch.name
            )));
        }
        let unmerged = queries::count_unmerged_records(self.conn, branch_id, branch.base_seq, None)?;
        if unmerged > 0 {
            return Err(EngineError::invalid(format!(
                "branch '{}' has {unmerged} unmerged change(s)",
                branch.name
            )));
        }

        let removed = queries::delete_branch(self.conn, branch_id)?;
        self.check_invariants(&branch.tenant_id)?;
        info!(branch_id, name = %branch.name, removed, "deleted branch");
        Ok(())
    }

    pub fn add_collaborator(&self, branch_id: &str, user_id: &str) -> Result<Branch, EngineError> {
        self.get(branch_id)?;
        queries::add_collaborator(self.conn, branch_id, user_id)?;
        self.get(branch_id)
    }

    pub fn remove_collaborator(
        &self,
        branch_id: &str,
        user_id: &str,
    ) -> Result<Branch, EngineError> {
        self.get(branch_id)?;
        if !queries::remove_collaborator(self.conn, branch_id, user_id)? {
            return Err(EngineError::not_found("collaborator", user_id));
        }
        self.get(branch_id)
    }

    /// The branch itself followed by each ancestor up to the root.
    pub fn ancestry(&self, branch_id: &str) -> Result<Vec<Branch>, EngineError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(branch_id.to_string());

        while let Some(id) = next {
            if !seen.insert(id.clone()) {
                return Err(EngineError::invalid(format!(
                    "branch ancestry of '{branch_id}' contains a cycle at '{id}'"
                )));
            }
            if chain.len() >= self.max_depth {
                return Err(EngineError::invalid(format!(
                    "branch ancestry of '{branch_id}' exceeds {} levels",
                    self.max_depth
                )));
            }
            let branch = self.get(&id)?;
            next = branch.parent_branch_id.clone();
            chain.push(branch);
        }
        Ok(chain)
    }

    /// Find where two branches' ancestries meet.
    pub fn common_ancestry(&self, left: &str, right: &str) -> Result<CommonAncestry, EngineError> {
        let left_chain = self.ancestry(left)?;
        let right_chain = self.ancestry(right)?;

        let right_pos: HashMap<&str, usize> = right_chain
            .iter()
            .enumerate()
            .map(|(i, b)| (b.id.as_str(), i))
            .collect();

        let (li, ri) = left_chain
            .iter()
            .enumerate()
            .find_map(|(i, b)| right_pos.get(b.id.as_str()).map(|&j| (i, j)))
            .ok_or_else(|| {
                EngineError::invalid(format!(
                    "branches '{left}' and '{right}' share no common ancestor"
                ))
            })?;

        let mut left_path = left_chain;
        let ancestor = left_path.remove(li);
        left_path.truncate(li);
        let mut right_path = right_chain;
        right_path.truncate(ri);

        Ok(CommonAncestry {
            ancestor,
            left_path,
            right_path,
        })
    }

    /// At most one default branch, which has no parent, and no cycles.
    fn check_invariants(&self, tenant_id: &str) -> Result<(), EngineError> {
        let links = queries::branch_links(self.conn, tenant_id)?;

        let defaults: Vec<_> = links.iter().filter(|(_, _, d)| *d).collect();
        if defaults.len() > 1 {
            return Err(EngineError::invalid(format!(
                "tenant '{tenant_id}' would have {} default branches",
                defaults.len()
            )));
        }
        if let Some((id, Some(_), _)) = defaults.first() {
            return Err(EngineError::invalid(format!(
                "default branch '{id}' must not have a parent"
            )));
        }

        let parents: HashMap<&str, Option<&str>> = links
            .iter()
            .map(|(id, parent, _)| (id.as_str(), parent.as_deref()))
            .collect();
        for (start, _) in &parents {
            let mut steps = 0;
            let mut cursor = parents.get(start).copied().flatten();
            while let Some(id) = cursor {
                steps += 1;
                if id == *start || steps > parents.len() {
                    return Err(EngineError::invalid(format!(
                        "branch '{start}' would be its own ancestor"
                    )));
                }
                cursor = parents.get(id).copied().flatten();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn named(name: &str) -> NewBranch {
        NewBranch {
            name: name.into(),
            ..NewBranch::default()
        }
    }

    #[test]
    fn test_bootstrap_and_fork() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let reg = BranchRegistry::new(&conn, 8);

        let main = reg.ensure_default("t1", "main", "alice").unwrap();
        assert!(main.is_default);
        assert_eq!(reg.ensure_default("t1", "main", "bob").unwrap().id, main.id);

        let dev = reg.create("t1", "bob", named("dev")).unwrap();
        assert_eq!(dev.parent_branch_id.as_deref(), Some(main.id.as_str()));
        assert_eq!(dev.collaborator_ids, vec!["bob".to_string()]);
        assert_eq!(reg.list("t1").unwrap().len(), 2);
    }

    #[test]
    fn test_create_rejects_duplicates_and_second_default() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let reg = BranchRegistry::new(&conn, 8);
        reg.ensure_default("t1", "main", "alice").unwrap();

        assert!(matches!(
            reg.create("t1", "alice", named("main")),
            Err(EngineError::Validation(_))
        ));
        let second_default = NewBranch {
            name: "other".into(),
            is_default: true,
            ..NewBranch::default()
        };
        assert!(matches!(
            reg.create("t1", "alice", second_default),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            reg.create("t1", "alice", named("   ")),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_create_without_default_fails() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let reg = BranchRegistry::new(&conn, 8);
        assert!(matches!(
            reg.create("t1", "alice", named("dev")),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_depth_limit() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let reg = BranchRegistry::new(&conn, 2);
        let main = reg.ensure_default("t1", "main", "alice").unwrap();
        let dev = reg.create("t1", "alice", named("dev")).unwrap();
        assert_eq!(reg.ancestry(&dev.id).unwrap().len(), 2);

        let deeper = NewBranch {
            name: "feature".into(),
            parent_branch_id: Some(dev.id.clone()),
            ..NewBranch::default()
        };
        assert!(matches!(
            reg.create("t1", "alice", deeper),
            Err(EngineError::Validation(_))
        ));
        assert_eq!(reg.ancestry(&main.id).unwrap().len(), 1);
    }

    #[test]
    fn test_switch_refuses_locked_branch() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let reg = BranchRegistry::new(&conn, 8);
        reg.ensure_default("t1", "main", "alice").unwrap();
        let dev = reg.create("t1", "alice", named("dev")).unwrap();

        let ctx = reg.switch("bob", &dev.id).unwrap();
        assert_eq!(ctx.branch_name, "dev");
        assert_eq!(ctx.tenant_id, "t1");

        assert!(reg.lock(&dev.id).unwrap().is_locked);
        assert!(matches!(
            reg.switch("bob", &dev.id),
            Err(EngineError::Validation(_))
        ));
        assert!(!reg.unlock(&dev.id).unwrap().is_locked);
    }

    #[test]
    fn test_delete_rules() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let reg = BranchRegistry::new(&conn, 8);
        let main = reg.ensure_default("t1", "main", "alice").unwrap();
        let dev = reg.create("t1", "alice", named("dev")).unwrap();
        let feature = reg
            .create(
                "t1",
                "alice",
                NewBranch {
                    name: "feature".into(),
                    parent_branch_id: Some(dev.id.clone()),
                    ..NewBranch::default()
                },
            )
            .unwrap();

        assert!(matches!(reg.delete(&main.id), Err(EngineError::Validation(_))));
        assert!(matches!(reg.delete(&dev.id), Err(EngineError::Validation(_))));
        reg.delete(&feature.id).unwrap();
        reg.delete(&dev.id).unwrap();
        assert!(matches!(reg.get(&dev.id), Err(EngineError::NotFound { .. })));
    }

    #[test]
    fn test_collaborators() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let reg = BranchRegistry::new(&conn, 8);
        let main = reg.ensure_default("t1", "main", "alice").unwrap();

        let branch = reg.add_collaborator(&main.id, "bob").unwrap();
        assert!(branch.collaborator_ids.contains(&"bob".to_string()));
        let branch = reg.remove_collaborator(&main.id, "bob").unwrap();
        assert!(!branch.collaborator_ids.contains(&"bob".to_string()));
        assert!(matches!(
            reg.remove_collaborator(&main.id, "bob"),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_common_ancestry() {
        let db = Database::open_in_memory_initialized().unwrap();
        let conn = db.conn();
        let reg = BranchRegistry::new(&conn, 8);
        let main = reg.ensure_default("t1", "main", "alice").unwrap();
        let a = reg.create("t1", "alice", named("a")).unwrap();
        let b = reg.create("t1", "alice", named("b")).unwrap();

        let cousins = reg.common_ancestry(&a.id, &b.id).unwrap();
        assert_eq!(cousins.ancestor.id, main.id);
        assert_eq!(cousins.left_path.len(), 1);
        assert_eq!(cousins.right_path[0].id, b.id);

        let parent_child = reg.common_ancestry(&main.id, &a.id).unwrap();
        assert_eq!(parent_child.ancestor.id, main.id);
        assert!(parent_child.left_path.is_empty());
        assert_eq!(parent_child.right_path.len(), 1);

        let other_root = reg.ensure_default("t2", "main", "zed").unwrap();
        assert!(matches!(
            reg.common_ancestry(&a.id, &other_root.id),
            Err(EngineError::Validation(_))
        ));
    }
}
