//! `git2` + raw-`git`-subprocess implementation of [`GitAdapter`].
//!
//! Per-stream and per-worktree bookkeeping that the driver itself owns
//! (§4.2: "dual-write to git driver + policy tables") is kept in a small
//! sidecar JSON file separate from the policy database the rest of the
//! core uses — git stays authoritative for branches even if the
//! policy-level write later fails.

use crate::error::{GitSwarmError, Result};
use crate::git::adapter::{
    AdapterCapabilities, CommitOutcome, CreateStreamRequest, GitAdapter, MergeOutcome,
    OperationRecord, StreamRecord, WorktreeRecord,
};
use crate::log_debug;
use git2::Repository;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Default, Serialize, Deserialize)]
struct AdapterState {
    streams: HashMap<String, StreamRecord>,
    worktrees: HashMap<String, WorktreeRecord>,
    operations: HashMap<String, Vec<OperationRecord>>,
}

pub struct LibGitAdapter {
    repo_path: PathBuf,
    state_path: PathBuf,
    worktrees_dir: PathBuf,
    state: Mutex<AdapterState>,
}

impl LibGitAdapter {
    /// Opens the repository at `repo_path`, using `data_dir` (the
    /// `.gitswarm` directory) for sidecar bookkeeping and worktrees.
    pub fn open(repo_path: &Path, data_dir: &Path) -> Result<Self> {
        Repository::open(repo_path)?;
        let worktrees_dir = data_dir.join("worktrees");
        fs::create_dir_all(&worktrees_dir)?;
        let state_path = data_dir.join("git-adapter-state.json");
        let state = if state_path.exists() {
            let content = fs::read_to_string(&state_path)?;
            serde_json::from_str(&content).unwrap_or_default()
        } else {
            AdapterState::default()
        };
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            state_path,
            worktrees_dir,
            state: Mutex::new(state),
        })
    }

    fn open_repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    fn persist(&self, state: &AdapterState) -> Result<()> {
        let json = serde_json::to_string_pretty(state).unwrap_or_default();
        fs::write(&self.state_path, json)?;
        Ok(())
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        run_git_in(&self.repo_path, args)
    }
}

/// Runs `git` with `args` in `dir`, returning stdout trimmed. Used for the
/// handful of operations `git2` doesn't expose cleanly (worktree
/// add/remove, merge with conflict handling, revert).
fn run_git_in(dir: &Path, args: &[&str]) -> Result<String> {
    let output = std::process::Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()?;
    if !output.status.success() {
        return Err(GitSwarmError::Io(std::io::Error::other(format!(
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ))));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

impl GitAdapter for LibGitAdapter {
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_stacking: true,
        }
    }

    fn create_stream(&self, req: CreateStreamRequest) -> Result<String> {
        let base = req
            .base
            .clone()
            .or_else(|| req.existing_branch.clone())
            .unwrap_or_else(|| "buffer".to_string());
        let branch = req.existing_branch.clone().unwrap_or_else(|| req.name.clone());

        if req.create_branch && !self.branch_exists(&branch)? {
            self.create_branch(&branch, &base)?;
        }

        let stream_id = Uuid::new_v4().to_string();
        let record = StreamRecord {
            stream_id: stream_id.clone(),
            branch,
            base,
            agent_id: req.agent_id,
            parent_stream_id: None,
            abandoned: false,
        };

        let mut state = self.state.lock();
        state.streams.insert(stream_id.clone(), record);
        self.persist(&state)?;
        Ok(stream_id)
    }

    fn fork_stream(&self, parent_stream_id: &str, agent_id: &str, name: &str) -> Result<String> {
        let parent_branch = self.get_stream_branch_name(parent_stream_id)?;
        let branch = name.to_string();
        if !self.branch_exists(&branch)? {
            self.create_branch(&branch, &parent_branch)?;
        }
        let stream_id = Uuid::new_v4().to_string();
        let record = StreamRecord {
            stream_id: stream_id.clone(),
            branch,
            base: parent_branch,
            agent_id: agent_id.to_string(),
            parent_stream_id: Some(parent_stream_id.to_string()),
            abandoned: false,
        };
        let mut state = self.state.lock();
        state.streams.insert(stream_id.clone(), record);
        self.persist(&state)?;
        Ok(stream_id)
    }

    fn get_stream_branch_name(&self, stream_id: &str) -> Result<String> {
        let state = self.state.lock();
        state
            .streams
            .get(stream_id)
            .map(|s| s.branch.clone())
            .ok_or(GitSwarmError::StreamNotFound)
    }

    fn get_stream(&self, stream_id: &str) -> Result<StreamRecord> {
        self.state
            .lock()
            .streams
            .get(stream_id)
            .cloned()
            .ok_or(GitSwarmError::StreamNotFound)
    }

    fn list_streams(&self) -> Result<Vec<StreamRecord>> {
        Ok(self.state.lock().streams.values().cloned().collect())
    }

    fn update_stream(&self, stream_id: &str, parent_stream_id: Option<String>) -> Result<()> {
        let mut state = self.state.lock();
        let record = state
            .streams
            .get_mut(stream_id)
            .ok_or(GitSwarmError::StreamNotFound)?;
        record.parent_stream_id = parent_stream_id;
        self.persist(&state)
    }

    fn abandon_stream(&self, stream_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let record = state
            .streams
            .get_mut(stream_id)
            .ok_or(GitSwarmError::StreamNotFound)?;
        record.abandoned = true;
        self.persist(&state)
    }

    fn create_worktree(&self, stream_id: &str, agent_id: &str) -> Result<WorktreeRecord> {
        let branch = self.get_stream_branch_name(stream_id)?;
        let path = self.worktrees_dir.join(agent_id);
        if path.exists() {
            self.git(&["worktree", "remove", "--force", &path.to_string_lossy()])
                .ok();
        }
        self.git(&["worktree", "add", &path.to_string_lossy(), &branch])?;
        let record = WorktreeRecord {
            agent_id: agent_id.to_string(),
            stream_id: stream_id.to_string(),
            path,
        };
        let mut state = self.state.lock();
        state.worktrees.insert(agent_id.to_string(), record.clone());
        self.persist(&state)?;
        Ok(record)
    }

    fn get_worktree(&self, agent_id: &str) -> Result<Option<WorktreeRecord>> {
        Ok(self.state.lock().worktrees.get(agent_id).cloned())
    }

    fn update_worktree_stream(&self, agent_id: &str, stream_id: &str) -> Result<WorktreeRecord> {
        let branch = self.get_stream_branch_name(stream_id)?;
        let path = {
            let state = self.state.lock();
            state
                .worktrees
                .get(agent_id)
                .map(|w| w.path.clone())
                .ok_or(GitSwarmError::StreamNotFound)?
        };
        run_git_in(&path, &["checkout", &branch])?;
        let record = WorktreeRecord {
            agent_id: agent_id.to_string(),
            stream_id: stream_id.to_string(),
            path,
        };
        let mut state = self.state.lock();
        state.worktrees.insert(agent_id.to_string(), record.clone());
        self.persist(&state)?;
        Ok(record)
    }

    fn deallocate_worktree(&self, agent_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(record) = state.worktrees.remove(agent_id) {
            self.git(&["worktree", "remove", "--force", &record.path.to_string_lossy()])
                .ok();
        }
        self.persist(&state)
    }

    fn list_worktrees(&self) -> Result<Vec<WorktreeRecord>> {
        Ok(self.state.lock().worktrees.values().cloned().collect())
    }

    fn commit_changes(
        &self,
        stream_id: &str,
        agent_id: &str,
        worktree: &Path,
        message: &str,
    ) -> Result<CommitOutcome> {
        run_git_in(worktree, &["add", "-A"])?;
        run_git_in(worktree, &["commit", "-m", message, "--allow-empty"])?;
        let commit = run_git_in(worktree, &["rev-parse", "HEAD"])?;
        let change_id = Uuid::new_v4().to_string();

        let record = OperationRecord {
            operation_id: Uuid::new_v4().to_string(),
            stream_id: stream_id.to_string(),
            commit: commit.clone(),
            message: message.to_string(),
        };
        let mut state = self.state.lock();
        state
            .operations
            .entry(stream_id.to_string())
            .or_default()
            .push(record);
        self.persist(&state)?;
        log_debug!("agent {} committed {} on stream {}", agent_id, commit, stream_id);
        Ok(CommitOutcome { commit, change_id })
    }

    fn get_changes_for_stream(&self, stream_id: &str) -> Result<Vec<OperationRecord>> {
        self.get_operations(stream_id)
    }

    fn get_operations(&self, stream_id: &str) -> Result<Vec<OperationRecord>> {
        Ok(self
            .state
            .lock()
            .operations
            .get(stream_id)
            .cloned()
            .unwrap_or_default())
    }

    fn get_dependencies(&self, stream_id: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut chain = Vec::new();
        let mut current = state.streams.get(stream_id).and_then(|s| s.parent_stream_id.clone());
        while let Some(parent) = current {
            chain.push(parent.clone());
            current = state
                .streams
                .get(&parent)
                .and_then(|s| s.parent_stream_id.clone());
        }
        Ok(chain)
    }

    fn get_child_streams(&self, stream_id: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .streams
            .values()
            .filter(|s| s.parent_stream_id.as_deref() == Some(stream_id))
            .map(|s| s.stream_id.clone())
            .collect())
    }

    fn rollback_to_operation(&self, stream_id: &str, operation_id: &str) -> Result<()> {
        let commit = {
            let state = self.state.lock();
            state
                .operations
                .get(stream_id)
                .and_then(|ops| ops.iter().find(|o| o.operation_id == operation_id))
                .map(|o| o.commit.clone())
                .ok_or(GitSwarmError::StreamNotFound)?
        };
        let branch = self.get_stream_branch_name(stream_id)?;
        self.checkout(&branch)?;
        self.git(&["reset", "--hard", &commit])?;
        Ok(())
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        self.git(&["checkout", branch])?;
        Ok(())
    }

    fn merge_no_ff(&self, source_branch: &str, message: &str) -> Result<MergeOutcome> {
        match self.git(&["merge", "--no-ff", source_branch, "-m", message]) {
            Ok(_) => {
                let merge_commit = self.git(&["rev-parse", "HEAD"])?;
                Ok(MergeOutcome {
                    merge_commit,
                    conflicted: false,
                })
            }
            Err(_) => {
                self.merge_abort()?;
                Ok(MergeOutcome {
                    merge_commit: String::new(),
                    conflicted: true,
                })
            }
        }
    }

    fn merge_abort(&self) -> Result<()> {
        self.git(&["merge", "--abort"]).ok();
        Ok(())
    }

    fn merge_ff_only(&self, source_ref: &str) -> Result<String> {
        self.git(&["merge", "--ff-only", source_ref])?;
        self.git(&["rev-parse", "HEAD"])
    }

    fn rev_parse(&self, rev: &str) -> Result<String> {
        self.git(&["rev-parse", rev])
    }

    fn tag(&self, name: &str, commit_ish: &str) -> Result<()> {
        self.git(&["tag", name, commit_ish])?;
        Ok(())
    }

    fn diff(&self, from: &str, to: &str) -> Result<String> {
        self.git(&["diff", &format!("{from}..{to}")])
    }

    fn branch_exists(&self, name: &str) -> Result<bool> {
        let repo = self.open_repo()?;
        Ok(repo.find_branch(name, git2::BranchType::Local).is_ok())
    }

    fn create_branch(&self, name: &str, from: &str) -> Result<()> {
        if run_git_in(&self.repo_path, &["rev-parse", "--verify", from]).is_err() {
            // `from` doesn't resolve yet (bootstrapping the buffer branch
            // off the repository's current HEAD) — materialize it too, so
            // later checkouts of it (merge, stabilize) don't fail.
            self.git(&["branch", from])?;
            self.git(&["branch", name])?;
            return Ok(());
        }
        self.git(&["branch", name, from])?;
        Ok(())
    }

    fn revert_commit(&self, commit_ish: &str) -> Result<String> {
        self.git(&["revert", "--no-edit", commit_ish])?;
        self.git(&["rev-parse", "HEAD"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn init_repo() -> (TempDir, TempDir) {
        let repo_dir = TempDir::new().unwrap();
        let data_dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            Command::new("git")
                .current_dir(repo_dir.path())
                .args(args)
                .status()
                .unwrap();
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "a@example.com"]);
        run(&["config", "user.name", "a"]);
        run(&["commit", "--allow-empty", "-q", "-m", "root"]);
        (repo_dir, data_dir)
    }

    #[test]
    fn create_stream_creates_branch_and_record() {
        let (repo_dir, data_dir) = init_repo();
        let adapter = LibGitAdapter::open(repo_dir.path(), data_dir.path()).unwrap();
        let stream_id = adapter
            .create_stream(CreateStreamRequest {
                name: "feature-x".into(),
                agent_id: "agent-1".into(),
                base: None,
                existing_branch: None,
                create_branch: true,
            })
            .unwrap();
        assert!(adapter.branch_exists("feature-x").unwrap());
        let record = adapter.get_stream(&stream_id).unwrap();
        assert_eq!(record.branch, "feature-x");
    }

    #[test]
    fn state_persists_across_reopen() {
        let (repo_dir, data_dir) = init_repo();
        let stream_id = {
            let adapter = LibGitAdapter::open(repo_dir.path(), data_dir.path()).unwrap();
            adapter
                .create_stream(CreateStreamRequest {
                    name: "persisted".into(),
                    agent_id: "agent-1".into(),
                    base: None,
                    existing_branch: None,
                    create_branch: true,
                })
                .unwrap()
        };
        let reopened = LibGitAdapter::open(repo_dir.path(), data_dir.path()).unwrap();
        assert!(reopened.get_stream(&stream_id).is_ok());
    }
}
