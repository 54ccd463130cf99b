//! The Git Adapter contract (§6): the boundary between the GitSwarm core
//! and whatever actually executes worktree, branch, merge, tag, and diff
//! operations. The core only talks to this trait — see Design Note
//! "Cross-component back-references" — so a future adapter (a stacked-diff
//! backend, a remote git service) can be swapped in without touching
//! streams/merge/stabilize/promote.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct CreateStreamRequest {
    pub name: String,
    pub agent_id: String,
    pub base: Option<String>,
    pub existing_branch: Option<String>,
    pub create_branch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub stream_id: String,
    pub branch: String,
    pub base: String,
    pub agent_id: String,
    pub parent_stream_id: Option<String>,
    pub abandoned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub agent_id: String,
    pub stream_id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub commit: String,
    pub change_id: String,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub merge_commit: String,
    pub conflicted: bool,
}

#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub operation_id: String,
    pub stream_id: String,
    pub commit: String,
    pub message: String,
}

/// Declares which of the optional, capability-gated operations an
/// implementation supports, so callers can probe instead of relying on
/// exceptions-for-control-flow (Design Note "Exception-for-control-flow
/// around missing features").
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterCapabilities {
    pub supports_stacking: bool,
}

pub trait GitAdapter: Send + Sync {
    fn capabilities(&self) -> AdapterCapabilities;

    fn create_stream(&self, req: CreateStreamRequest) -> Result<String>;
    fn fork_stream(&self, parent_stream_id: &str, agent_id: &str, name: &str) -> Result<String>;
    fn get_stream_branch_name(&self, stream_id: &str) -> Result<String>;
    fn get_stream(&self, stream_id: &str) -> Result<StreamRecord>;
    fn list_streams(&self) -> Result<Vec<StreamRecord>>;
    fn update_stream(&self, stream_id: &str, parent_stream_id: Option<String>) -> Result<()>;
    fn abandon_stream(&self, stream_id: &str) -> Result<()>;

    fn create_worktree(&self, stream_id: &str, agent_id: &str) -> Result<WorktreeRecord>;
    fn get_worktree(&self, agent_id: &str) -> Result<Option<WorktreeRecord>>;
    fn update_worktree_stream(&self, agent_id: &str, stream_id: &str) -> Result<WorktreeRecord>;
    fn deallocate_worktree(&self, agent_id: &str) -> Result<()>;
    fn list_worktrees(&self) -> Result<Vec<WorktreeRecord>>;

    fn commit_changes(
        &self,
        stream_id: &str,
        agent_id: &str,
        worktree: &std::path::Path,
        message: &str,
    ) -> Result<CommitOutcome>;
    fn get_changes_for_stream(&self, stream_id: &str) -> Result<Vec<OperationRecord>>;
    fn get_operations(&self, stream_id: &str) -> Result<Vec<OperationRecord>>;
    fn get_dependencies(&self, stream_id: &str) -> Result<Vec<String>>;
    fn get_child_streams(&self, stream_id: &str) -> Result<Vec<String>>;
    fn rollback_to_operation(&self, stream_id: &str, operation_id: &str) -> Result<()>;

    // Raw fallbacks used directly by the merge orchestrator / promoter /
    // stabilizer; the same operations the teacher shells out to `git` for
    // when `git2` doesn't expose something cleanly.
    fn checkout(&self, branch: &str) -> Result<()>;
    fn merge_no_ff(&self, source_branch: &str, message: &str) -> Result<MergeOutcome>;
    fn merge_abort(&self) -> Result<()>;
    fn merge_ff_only(&self, source_ref: &str) -> Result<String>;
    fn rev_parse(&self, rev: &str) -> Result<String>;
    fn tag(&self, name: &str, commit_ish: &str) -> Result<()>;
    fn diff(&self, from: &str, to: &str) -> Result<String>;
    fn branch_exists(&self, name: &str) -> Result<bool>;
    fn create_branch(&self, name: &str, from: &str) -> Result<()>;
    fn revert_commit(&self, commit_ish: &str) -> Result<String>;
}
