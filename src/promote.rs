//! Promoter (§4.6): ships a stabilized buffer (or an explicit tag) onto
//! the repository's release branch with a fast-forward-only merge.

use crate::activity::ActivityLog;
use crate::db::models::{Promotion, TriggeredBy};
use crate::db::Database;
use crate::error::{GitSwarmError, Result};
use crate::git::GitAdapter;
use crate::policy::{Action, PolicyEngine};
use crate::sync::EventQueue;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

pub struct PromoteReport {
    pub from_commit: String,
    pub to_commit: String,
    pub target_branch: String,
}

pub struct Promoter {
    repo_id: String,
    db: Database,
    policy: Arc<PolicyEngine>,
    git: Arc<dyn GitAdapter>,
    activity: ActivityLog,
    queue: EventQueue,
}

impl Promoter {
    pub fn new(repo_id: impl Into<String>, db: Database, policy: Arc<PolicyEngine>, git: Arc<dyn GitAdapter>) -> Self {
        Self {
            activity: ActivityLog::new(db.clone()),
            queue: EventQueue::new(db.clone()),
            repo_id: repo_id.into(),
            db,
            policy,
            git,
        }
    }

    /// `promote({tag?})`. Manual invocations require maintainer level;
    /// auto-promotion from a green tag is service-invoked and passes
    /// `agent_id = None`.
    pub fn promote(&self, tag: Option<&str>, agent_id: Option<&str>) -> Result<PromoteReport> {
        if let Some(agent_id) = agent_id {
            if !self.policy.can_perform(agent_id, &self.repo_id, Action::Merge)? {
                return Err(GitSwarmError::InsufficientPermissions);
            }
        }

        let repo = self.policy.repo(&self.repo_id)?;
        let source = tag.map(str::to_string).unwrap_or_else(|| repo.buffer_branch.clone());

        let from_commit = self
            .git
            .rev_parse(&repo.promote_target)
            .unwrap_or_else(|_| "unknown".to_string());

        let result = (|| -> Result<String> {
            self.git.checkout(&repo.promote_target)?;
            self.git.merge_ff_only(&source)
        })();

        let to_commit = match result {
            Ok(commit) => commit,
            Err(e) => {
                // Restore the working copy to the buffer branch so a
                // failed promotion doesn't leave the repo checked out on
                // the release branch.
                let _ = self.git.checkout(&repo.buffer_branch);
                return Err(GitSwarmError::PromoteFailed(e.to_string()));
            }
        };

        let _ = self.git.checkout(&repo.buffer_branch);

        let triggered_by = if agent_id.is_some() { TriggeredBy::Manual } else { TriggeredBy::Auto };
        let record = Promotion {
            repo_id: self.repo_id.clone(),
            from_branch: source,
            to_branch: repo.promote_target.clone(),
            from_commit: from_commit.clone(),
            to_commit: to_commit.clone(),
            triggered_by,
            agent_id: agent_id.map(str::to_string),
            at: Utc::now().to_rfc3339(),
        };
        self.persist(&record)?;

        self.activity.record(
            &self.repo_id,
            "promote",
            json!({ "from_commit": from_commit, "to_commit": to_commit, "to_branch": record.to_branch }),
        )?;
        self.queue.enqueue(
            "syncPromotion",
            json!({ "repo_id": self.repo_id, "from_commit": from_commit, "to_commit": to_commit }),
        )?;

        Ok(PromoteReport {
            from_commit,
            to_commit,
            target_branch: record.to_branch,
        })
    }

    fn persist(&self, p: &Promotion) -> Result<()> {
        let table = self.db.table_name("promotions");
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (repo_id, from_branch, to_branch, from_commit, to_commit, triggered_by, agent_id, at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                rusqlite::params![
                    p.repo_id,
                    p.from_branch,
                    p.to_branch,
                    p.from_commit,
                    p.to_commit,
                    p.triggered_by.as_str(),
                    p.agent_id,
                    p.at,
                ],
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    struct FakeGit {
        fail_merge: bool,
    }

    impl GitAdapter for FakeGit {
        fn capabilities(&self) -> crate::git::AdapterCapabilities {
            Default::default()
        }
        fn create_stream(&self, _req: crate::git::CreateStreamRequest) -> Result<String> {
            unimplemented!()
        }
        fn fork_stream(&self, _p: &str, _a: &str, _n: &str) -> Result<String> {
            unimplemented!()
        }
        fn get_stream_branch_name(&self, _s: &str) -> Result<String> {
            unimplemented!()
        }
        fn get_stream(&self, _s: &str) -> Result<crate::git::StreamRecord> {
            unimplemented!()
        }
        fn list_streams(&self) -> Result<Vec<crate::git::StreamRecord>> {
            unimplemented!()
        }
        fn update_stream(&self, _s: &str, _p: Option<String>) -> Result<()> {
            unimplemented!()
        }
        fn abandon_stream(&self, _s: &str) -> Result<()> {
            unimplemented!()
        }
        fn create_worktree(&self, _s: &str, _a: &str) -> Result<crate::git::WorktreeRecord> {
            unimplemented!()
        }
        fn get_worktree(&self, _a: &str) -> Result<Option<crate::git::WorktreeRecord>> {
            unimplemented!()
        }
        fn update_worktree_stream(&self, _a: &str, _s: &str) -> Result<crate::git::WorktreeRecord> {
            unimplemented!()
        }
        fn deallocate_worktree(&self, _a: &str) -> Result<()> {
            unimplemented!()
        }
        fn list_worktrees(&self) -> Result<Vec<crate::git::WorktreeRecord>> {
            unimplemented!()
        }
        fn commit_changes(&self, _s: &str, _a: &str, _w: &std::path::Path, _m: &str) -> Result<crate::git::CommitOutcome> {
            unimplemented!()
        }
        fn get_changes_for_stream(&self, _s: &str) -> Result<Vec<crate::git::OperationRecord>> {
            unimplemented!()
        }
        fn get_operations(&self, _s: &str) -> Result<Vec<crate::git::OperationRecord>> {
            unimplemented!()
        }
        fn get_dependencies(&self, _s: &str) -> Result<Vec<String>> {
            unimplemented!()
        }
        fn get_child_streams(&self, _s: &str) -> Result<Vec<String>> {
            unimplemented!()
        }
        fn rollback_to_operation(&self, _s: &str, _o: &str) -> Result<()> {
            unimplemented!()
        }
        fn checkout(&self, _branch: &str) -> Result<()> {
            Ok(())
        }
        fn merge_no_ff(&self, _s: &str, _m: &str) -> Result<crate::git::MergeOutcome> {
            unimplemented!()
        }
        fn merge_abort(&self) -> Result<()> {
            Ok(())
        }
        fn merge_ff_only(&self, _source_ref: &str) -> Result<String> {
            if self.fail_merge {
                Err(GitSwarmError::MergeConflict)
            } else {
                Ok("promoted-commit".to_string())
            }
        }
        fn rev_parse(&self, _rev: &str) -> Result<String> {
            Ok("base-commit".to_string())
        }
        fn tag(&self, _name: &str, _commit_ish: &str) -> Result<()> {
            Ok(())
        }
        fn diff(&self, _from: &str, _to: &str) -> Result<String> {
            Ok(String::new())
        }
        fn branch_exists(&self, _name: &str) -> Result<bool> {
            Ok(true)
        }
        fn create_branch(&self, _name: &str, _from: &str) -> Result<()> {
            Ok(())
        }
        fn revert_commit(&self, _commit_ish: &str) -> Result<String> {
            unimplemented!()
        }
    }

    fn promoter(fail_merge: bool) -> Promoter {
        let db = Database::open_in_memory(false).unwrap();
        let table = db.table_name("repos");
        db.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO {table} (id, display_name, access_mode, buffer_branch, promote_target) VALUES ('repo-1', 'r', 'public', 'buffer', 'main')"),
                [],
            )
        })
        .unwrap();
        let policy = Arc::new(PolicyEngine::new(db.clone()));
        let git: Arc<dyn GitAdapter> = Arc::new(FakeGit { fail_merge });
        Promoter::new("repo-1", db, policy, git)
    }

    #[test]
    fn successful_promotion_is_recorded() {
        let promoter = promoter(false);
        let report = promoter.promote(None, None).unwrap();
        assert_eq!(report.to_commit, "promoted-commit");
        assert_eq!(report.target_branch, "main");
    }

    #[test]
    fn failed_promotion_surfaces_promote_failed() {
        let promoter = promoter(true);
        let err = promoter.promote(None, None).unwrap_err();
        assert!(matches!(err, GitSwarmError::PromoteFailed(_)));
    }
}
