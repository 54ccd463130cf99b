//! Git integration: the adapter contract (§6) and its `git2`-backed
//! implementation.

pub mod adapter;
mod repository;
mod utils;

pub use adapter::{
    AdapterCapabilities, CommitOutcome, CreateStreamRequest, GitAdapter, MergeOutcome,
    OperationRecord, StreamRecord, WorktreeRecord,
};
pub use repository::LibGitAdapter;
pub use utils::{get_repo_root, is_inside_work_tree, run_git_command};
