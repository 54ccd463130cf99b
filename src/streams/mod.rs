//! Stream Registry (§4.2): the stream state machine, dual-write to the git
//! driver and the policy tables, and parent/child dependency bookkeeping.

pub mod review;

pub use review::ReviewBook;

use crate::db::models::{Stream, StreamSource, StreamStatus};
use crate::db::Database;
use crate::error::{GitSwarmError, Result};
use crate::git::{CommitOutcome, CreateStreamRequest, GitAdapter};
use crate::log_debug;
use crate::policy::{Action, PolicyEngine};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

pub struct CreateWorkspaceRequest {
    pub agent_id: String,
    pub task: Option<String>,
    pub depends_on: Option<String>,
    pub name: Option<String>,
}

pub struct Workspace {
    pub stream_id: String,
    pub worktree_path: std::path::PathBuf,
}

/// Streams move only forward: `active -> in_review <-> active`, either
/// `active` or `in_review` -> `abandoned`, `in_review -> merged`. Merged,
/// abandoned and reverted are terminal (P9).
fn validate_transition(from: StreamStatus, to: StreamStatus) -> Result<()> {
    use StreamStatus::{Abandoned, Active, InReview, Merged, Reverted};
    let ok = matches!(
        (from, to),
        (Active, InReview) | (InReview, Active) | (Active, Abandoned) | (InReview, Abandoned) | (InReview, Merged)
    );
    if ok {
        Ok(())
    } else {
        Err(GitSwarmError::InvalidTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}

pub struct StreamRegistry {
    repo_id: String,
    db: Database,
    policy: Arc<PolicyEngine>,
    git: Arc<dyn GitAdapter>,
}

impl StreamRegistry {
    pub fn new(repo_id: impl Into<String>, db: Database, policy: Arc<PolicyEngine>, git: Arc<dyn GitAdapter>) -> Self {
        Self {
            repo_id: repo_id.into(),
            db,
            policy,
            git,
        }
    }

    fn table(&self) -> String {
        self.db.table_name("streams")
    }

    /// §4.2 `createWorkspace`.
    pub fn create_workspace(&self, req: CreateWorkspaceRequest) -> Result<Workspace> {
        if !self.policy.can_perform(&req.agent_id, &self.repo_id, Action::Write)? {
            return Err(GitSwarmError::InsufficientPermissions);
        }

        let repo = self.policy.repo(&self.repo_id)?;
        let name = req
            .name
            .clone()
            .unwrap_or_else(|| format!("stream/{}/{}", req.agent_id, &Uuid::new_v4().to_string()[..8]));

        let (git_stream_id, base_branch, parent_stream_id) = if let Some(parent_id) = &req.depends_on {
            let parent = self.require(parent_id)?;
            let git_stream_id = self.git.fork_stream(parent_id, &req.agent_id, &name)?;
            (git_stream_id, parent.branch.clone(), Some(parent_id.clone()))
        } else {
            let git_stream_id = self.git.create_stream(CreateStreamRequest {
                name: name.clone(),
                agent_id: req.agent_id.clone(),
                base: Some(repo.buffer_branch.clone()),
                existing_branch: None,
                create_branch: true,
            })?;
            (git_stream_id, repo.buffer_branch.clone(), None)
        };

        let worktree = self.git.create_worktree(&git_stream_id, &req.agent_id)?;

        let now = Utc::now().to_rfc3339();
        let stream = Stream {
            id: git_stream_id.clone(),
            repo_id: self.repo_id.clone(),
            owner_agent_id: req.agent_id.clone(),
            branch: name,
            base_branch,
            parent_stream_id,
            task: req.task,
            source: StreamSource::Cli,
            status: StreamStatus::Active,
            review_status: crate::db::models::ReviewStatus::None,
            created_at: now.clone(),
            updated_at: now,
        };

        // Dual-write (§4.2): git is authoritative for the branch; the
        // policy-level row is best-effort visibility for the rest of the
        // core. A failure here is logged, not rolled back.
        if let Err(e) = self.upsert_row(&stream) {
            log_debug!("stream policy row write failed for {}: {}", stream.id, e);
        }

        Ok(Workspace {
            stream_id: stream.id,
            worktree_path: worktree.path,
        })
    }

    fn upsert_row(&self, s: &Stream) -> Result<()> {
        let table = self.table();
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (id, repo_id, owner_agent_id, branch, base_branch, parent_stream_id, task, source, status, review_status, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                     ON CONFLICT(id) DO UPDATE SET status = excluded.status, review_status = excluded.review_status, \
                     parent_stream_id = excluded.parent_stream_id, updated_at = excluded.updated_at"
                ),
                rusqlite::params![
                    s.id,
                    s.repo_id,
                    s.owner_agent_id,
                    s.branch,
                    s.base_branch,
                    s.parent_stream_id,
                    s.task,
                    s.source.as_str(),
                    s.status.as_str(),
                    s.review_status.as_str(),
                    s.created_at,
                    s.updated_at,
                ],
            )
        })?;
        Ok(())
    }

    pub fn find(&self, stream_id: &str) -> Result<Option<Stream>> {
        let table = self.table();
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT id, repo_id, owner_agent_id, branch, base_branch, parent_stream_id, task, source, status, review_status, created_at, updated_at \
                     FROM {table} WHERE id = ?1"
                ),
                [stream_id],
                row_to_stream,
            )
            .map(Some)
            .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })
        })
    }

    pub fn require(&self, stream_id: &str) -> Result<Stream> {
        self.find(stream_id)?.ok_or(GitSwarmError::StreamNotFound)
    }

    fn set_status(&self, stream_id: &str, status: StreamStatus, review_status: crate::db::models::ReviewStatus) -> Result<()> {
        let table = self.table();
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE {table} SET status = ?1, review_status = ?2, updated_at = ?3 WHERE id = ?4"),
                rusqlite::params![status.as_str(), review_status.as_str(), Utc::now().to_rfc3339(), stream_id],
            )
        })?;
        Ok(())
    }

    /// Owner-initiated transition `active -> in_review`, making the stream
    /// eligible for non-swarm merges (§4.4 step 3).
    pub fn submit_for_review(&self, stream_id: &str, agent_id: &str) -> Result<()> {
        let stream = self.require(stream_id)?;
        if stream.owner_agent_id != agent_id {
            return Err(GitSwarmError::InsufficientPermissions);
        }
        validate_transition(stream.status, StreamStatus::InReview)?;
        self.set_status(stream_id, StreamStatus::InReview, crate::db::models::ReviewStatus::InReview)
    }

    /// Called by [`ReviewBook`] when a `request_changes` verdict lands
    /// against an `in_review` stream, reopening it for more commits.
    pub fn reopen_for_changes(&self, stream_id: &str) -> Result<()> {
        let stream = self.require(stream_id)?;
        if stream.status != StreamStatus::InReview {
            return Ok(());
        }
        validate_transition(stream.status, StreamStatus::Active)?;
        self.set_status(stream_id, StreamStatus::Active, crate::db::models::ReviewStatus::ChangesRequested)
    }

    /// §4.2 commit contract: records the commit itself. Swarm-mode
    /// auto-merge-on-commit is orchestrated by the caller,
    /// [`crate::context::FederationContext::commit`], not here — this
    /// method has no merge orchestrator to call into.
    pub fn commit(&self, stream_id: &str, agent_id: &str, message: &str) -> Result<CommitOutcome> {
        let stream = self.require(stream_id)?;
        if stream.status != StreamStatus::Active {
            return Err(GitSwarmError::CannotCommitNonActive);
        }
        let worktree = self
            .git
            .get_worktree(agent_id)?
            .ok_or(GitSwarmError::StreamNotFound)?;
        let outcome = self.git.commit_changes(stream_id, agent_id, &worktree.path, message)?;

        let table = self.db.table_name("stream_commits");
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (stream_id, agent_id, commit_hash, change_id, message, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                rusqlite::params![
                    stream_id,
                    agent_id,
                    outcome.commit,
                    outcome.change_id,
                    message,
                    Utc::now().to_rfc3339(),
                ],
            )
        })?;

        Ok(outcome)
    }

    /// Owner or any maintainer may abandon an active or in_review stream;
    /// terminal streams may not be abandoned.
    pub fn abandon(&self, stream_id: &str, agent_id: &str) -> Result<()> {
        let stream = self.require(stream_id)?;
        let is_owner = stream.owner_agent_id == agent_id;
        let is_maintainer = self
            .policy
            .can_perform(agent_id, &self.repo_id, Action::Merge)?;
        if !is_owner && !is_maintainer {
            return Err(GitSwarmError::InsufficientPermissions);
        }
        validate_transition(stream.status, StreamStatus::Abandoned)?;
        self.git.abandon_stream(stream_id)?;
        self.set_status(stream_id, StreamStatus::Abandoned, stream.review_status)
    }

    /// Sets a stream to `merged`/`reverted` from within the merge or
    /// stabilize pipelines. Not exposed directly to agents.
    pub(crate) fn force_status(&self, stream_id: &str, status: StreamStatus) -> Result<()> {
        let stream = self.require(stream_id)?;
        self.set_status(stream_id, status, stream.review_status)
    }

    pub(crate) fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub(crate) fn git(&self) -> &Arc<dyn GitAdapter> {
        &self.git
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    pub(crate) fn repo_id(&self) -> &str {
        &self.repo_id
    }
}

fn row_to_stream(row: &rusqlite::Row<'_>) -> rusqlite::Result<Stream> {
    Ok(Stream {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        owner_agent_id: row.get(2)?,
        branch: row.get(3)?,
        base_branch: row.get(4)?,
        parent_stream_id: row.get(5)?,
        task: row.get(6)?,
        source: row.get::<_, String>(7)?.parse().unwrap_or(StreamSource::Cli),
        status: row.get::<_, String>(8)?.parse().unwrap_or(StreamStatus::Active),
        review_status: row.get::<_, String>(9)?.parse().unwrap_or(crate::db::models::ReviewStatus::None),
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

/// An in-memory fake [`GitAdapter`], shared by this module's tests and by
/// the merge orchestrator's tests, so exercising the stream/merge state
/// machines doesn't require a real git repository.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::git::{AdapterCapabilities, MergeOutcome, OperationRecord, StreamRecord, WorktreeRecord};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;

    pub(crate) struct FakeGit {
        streams: StdMutex<HashMap<String, StreamRecord>>,
        worktrees: StdMutex<HashMap<String, WorktreeRecord>>,
    }

    impl FakeGit {
        pub(crate) fn new() -> Self {
            Self {
                streams: StdMutex::new(HashMap::new()),
                worktrees: StdMutex::new(HashMap::new()),
            }
        }
    }

    impl GitAdapter for FakeGit {
        fn capabilities(&self) -> AdapterCapabilities {
            AdapterCapabilities::default()
        }
        fn create_stream(&self, req: CreateStreamRequest) -> Result<String> {
            let id = Uuid::new_v4().to_string();
            self.streams.lock().unwrap().insert(
                id.clone(),
                StreamRecord {
                    stream_id: id.clone(),
                    branch: req.name,
                    base: req.base.unwrap_or_default(),
                    agent_id: req.agent_id,
                    parent_stream_id: None,
                    abandoned: false,
                },
            );
            Ok(id)
        }
        fn fork_stream(&self, parent_stream_id: &str, agent_id: &str, name: &str) -> Result<String> {
            let id = Uuid::new_v4().to_string();
            self.streams.lock().unwrap().insert(
                id.clone(),
                StreamRecord {
                    stream_id: id.clone(),
                    branch: name.to_string(),
                    base: String::new(),
                    agent_id: agent_id.to_string(),
                    parent_stream_id: Some(parent_stream_id.to_string()),
                    abandoned: false,
                },
            );
            Ok(id)
        }
        fn get_stream_branch_name(&self, stream_id: &str) -> Result<String> {
            Ok(self.streams.lock().unwrap()[stream_id].branch.clone())
        }
        fn get_stream(&self, stream_id: &str) -> Result<StreamRecord> {
            self.streams
                .lock()
                .unwrap()
                .get(stream_id)
                .cloned()
                .ok_or(GitSwarmError::StreamNotFound)
        }
        fn list_streams(&self) -> Result<Vec<StreamRecord>> {
            Ok(self.streams.lock().unwrap().values().cloned().collect())
        }
        fn update_stream(&self, _stream_id: &str, _parent_stream_id: Option<String>) -> Result<()> {
            Ok(())
        }
        fn abandon_stream(&self, stream_id: &str) -> Result<()> {
            if let Some(s) = self.streams.lock().unwrap().get_mut(stream_id) {
                s.abandoned = true;
            }
            Ok(())
        }
        fn create_worktree(&self, stream_id: &str, agent_id: &str) -> Result<WorktreeRecord> {
            let record = WorktreeRecord {
                agent_id: agent_id.to_string(),
                stream_id: stream_id.to_string(),
                path: PathBuf::from(format!("/tmp/{agent_id}")),
            };
            self.worktrees.lock().unwrap().insert(agent_id.to_string(), record.clone());
            Ok(record)
        }
        fn get_worktree(&self, agent_id: &str) -> Result<Option<WorktreeRecord>> {
            Ok(self.worktrees.lock().unwrap().get(agent_id).cloned())
        }
        fn update_worktree_stream(&self, agent_id: &str, stream_id: &str) -> Result<WorktreeRecord> {
            self.create_worktree(stream_id, agent_id)
        }
        fn deallocate_worktree(&self, agent_id: &str) -> Result<()> {
            self.worktrees.lock().unwrap().remove(agent_id);
            Ok(())
        }
        fn list_worktrees(&self) -> Result<Vec<WorktreeRecord>> {
            Ok(self.worktrees.lock().unwrap().values().cloned().collect())
        }
        fn commit_changes(&self, _stream_id: &str, _agent_id: &str, _worktree: &Path, _message: &str) -> Result<CommitOutcome> {
            Ok(CommitOutcome {
                commit: "deadbeef".to_string(),
                change_id: Uuid::new_v4().to_string(),
            })
        }
        fn get_changes_for_stream(&self, _stream_id: &str) -> Result<Vec<OperationRecord>> {
            Ok(Vec::new())
        }
        fn get_operations(&self, _stream_id: &str) -> Result<Vec<OperationRecord>> {
            Ok(Vec::new())
        }
        fn get_dependencies(&self, _stream_id: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn get_child_streams(&self, _stream_id: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn rollback_to_operation(&self, _stream_id: &str, _operation_id: &str) -> Result<()> {
            Ok(())
        }
        fn checkout(&self, _branch: &str) -> Result<()> {
            Ok(())
        }
        fn merge_no_ff(&self, _source_branch: &str, _message: &str) -> Result<MergeOutcome> {
            Ok(MergeOutcome {
                merge_commit: "merged".to_string(),
                conflicted: false,
            })
        }
        fn merge_abort(&self) -> Result<()> {
            Ok(())
        }
        fn merge_ff_only(&self, _source_ref: &str) -> Result<String> {
            Ok("ff".to_string())
        }
        fn rev_parse(&self, _rev: &str) -> Result<String> {
            Ok("rev".to_string())
        }
        fn tag(&self, _name: &str, _commit_ish: &str) -> Result<()> {
            Ok(())
        }
        fn diff(&self, _from: &str, _to: &str) -> Result<String> {
            Ok(String::new())
        }
        fn branch_exists(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }
        fn create_branch(&self, _name: &str, _from: &str) -> Result<()> {
            Ok(())
        }
        fn revert_commit(&self, _commit_ish: &str) -> Result<String> {
            Ok("reverted".to_string())
        }
    }

    /// Builds a [`StreamRegistry`] wired to an in-memory database and a
    /// fresh [`FakeGit`], with a single `repo-1` row already inserted using
    /// `repo_insert_sql` (everything after `INSERT INTO {table}`).
    pub(crate) fn registry_with(
        repo_insert_sql: &str,
    ) -> (StreamRegistry, Database, std::sync::Arc<PolicyEngine>, std::sync::Arc<dyn GitAdapter>) {
        let db = Database::open_in_memory(false).unwrap();
        let repos_table = db.table_name("repos");
        db.with_conn(|conn| conn.execute(&format!("INSERT INTO {repos_table} {repo_insert_sql}"), []))
            .unwrap();
        let policy = std::sync::Arc::new(PolicyEngine::new(db.clone()));
        let git: std::sync::Arc<dyn GitAdapter> = std::sync::Arc::new(FakeGit::new());
        let registry = StreamRegistry::new("repo-1", db.clone(), policy.clone(), git.clone());
        (registry, db, policy, git)
    }

    pub(crate) fn default_repo_sql() -> &'static str {
        "(id, display_name, access_mode) VALUES ('repo-1', 'r', 'public')"
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{default_repo_sql, registry_with};
    use super::*;

    fn registry() -> StreamRegistry {
        registry_with(default_repo_sql()).0
    }

    #[test]
    fn create_workspace_starts_active() {
        let registry = registry();
        let ws = registry
            .create_workspace(CreateWorkspaceRequest {
                agent_id: "alice".into(),
                task: None,
                depends_on: None,
                name: None,
            })
            .unwrap();
        let stream = registry.require(&ws.stream_id).unwrap();
        assert_eq!(stream.status, StreamStatus::Active);
        assert!(stream.parent_stream_id.is_none());
    }

    #[test]
    fn commit_rejected_when_not_active() {
        let registry = registry();
        let ws = registry
            .create_workspace(CreateWorkspaceRequest {
                agent_id: "alice".into(),
                task: None,
                depends_on: None,
                name: None,
            })
            .unwrap();
        registry.submit_for_review(&ws.stream_id, "alice").unwrap();
        let err = registry.commit(&ws.stream_id, "alice", "msg").unwrap_err();
        assert!(matches!(err, GitSwarmError::CannotCommitNonActive));
    }

    /// P9: once merged, a stream can never transition again.
    #[test]
    fn terminal_status_rejects_further_transitions() {
        let registry = registry();
        let ws = registry
            .create_workspace(CreateWorkspaceRequest {
                agent_id: "alice".into(),
                task: None,
                depends_on: None,
                name: None,
            })
            .unwrap();
        registry.force_status(&ws.stream_id, StreamStatus::Merged).unwrap();
        let err = registry.abandon(&ws.stream_id, "alice").unwrap_err();
        assert!(matches!(err, GitSwarmError::InvalidTransition { .. }));
    }

    #[test]
    fn fork_stream_records_parent() {
        let registry = registry();
        let parent = registry
            .create_workspace(CreateWorkspaceRequest {
                agent_id: "alice".into(),
                task: None,
                depends_on: None,
                name: None,
            })
            .unwrap();
        registry.submit_for_review(&parent.stream_id, "alice").unwrap();
        registry.force_status(&parent.stream_id, StreamStatus::Merged).unwrap();

        let child = registry
            .create_workspace(CreateWorkspaceRequest {
                agent_id: "bob".into(),
                task: None,
                depends_on: Some(parent.stream_id.clone()),
                name: Some("child".into()),
            })
            .unwrap();
        let stream = registry.require(&child.stream_id).unwrap();
        assert_eq!(stream.parent_stream_id.as_deref(), Some(parent.stream_id.as_str()));
    }
}
