//! Stable, caller-observable error taxonomy for the GitSwarm core.
//!
//! Library code returns `Result<T, GitSwarmError>`. The command layer wraps
//! these in `anyhow::Error` for context-chaining and uses [`exit_code_for`]
//! to map the innermost `GitSwarmError` to a process exit code.

use thiserror::Error;

/// Broad category a [`GitSwarmError`] belongs to, matching the taxonomy
/// table in the specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    StateError,
    ConsensusError,
    Validation,
    Concurrency,
    Network,
    GitError,
    Policy,
}

#[derive(Debug, Error)]
pub enum GitSwarmError {
    #[error("repository not found")]
    RepoNotFound,
    #[error("stream not found")]
    StreamNotFound,
    #[error("agent not found")]
    AgentNotFound,

    #[error("insufficient permissions")]
    InsufficientPermissions,
    #[error("branch is protected")]
    BranchProtected,
    #[error("only maintainers may perform this action")]
    MaintainersOnly,
    #[error("gated mode requires maintainer approval or a remote coordinator")]
    GatedMode,

    #[error("stream is not active")]
    CannotCommitNonActive,
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("parent stream is not merged")]
    ParentNotMerged,
    #[error("stream was concurrently modified")]
    ConcurrentMerge,
    #[error("stream is already merged")]
    AlreadyMerged,

    #[error("not enough reviews have been submitted")]
    InsufficientReviews,
    #[error("consensus is below the required threshold")]
    BelowThreshold,
    #[error("awaiting owner approval")]
    AwaitingOwner,
    #[error("no maintainer reviews yet")]
    NoMaintainerReviews,
    #[error("no reviews yet")]
    NoReviews,

    #[error("invalid verdict")]
    InvalidVerdict,
    #[error("invalid stage")]
    InvalidStage,
    #[error("invalid configuration: {0}")]
    BadConfig(String),

    #[error("lock is currently held by another agent")]
    LockHeld,
    #[error("lock acquisition timed out")]
    LockTimeout,

    #[error("remote coordinator is unavailable")]
    ServerUnavailable,
    #[error("remote coordinator is unavailable for gated mode")]
    ServerUnavailableForGated,
    #[error("review events have not finished syncing")]
    ReviewSyncIncomplete,

    #[error("merge conflict")]
    MergeConflict,
    #[error("promotion failed: {0}")]
    PromoteFailed(String),
    #[error("failed to create tag: {0}")]
    TagFailed(String),

    #[error("rate limited")]
    RateLimited,
    #[error("plugin budget exhausted")]
    BudgetExhausted,

    #[error(transparent)]
    Git(#[from] git2::Error),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GitSwarmError {
    /// Stable, snake_case reason string as listed in the specification's
    /// error taxonomy. Safe to match on without parsing `Display` output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RepoNotFound => "repo_not_found",
            Self::StreamNotFound => "stream_not_found",
            Self::AgentNotFound => "agent_not_found",
            Self::InsufficientPermissions => "insufficient_permissions",
            Self::BranchProtected => "branch_protected",
            Self::MaintainersOnly => "maintainers_only",
            Self::GatedMode => "gated_mode",
            Self::CannotCommitNonActive => "cannot_commit_non_active",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ParentNotMerged => "parent_not_merged",
            Self::ConcurrentMerge => "concurrent_merge",
            Self::AlreadyMerged => "already_merged",
            Self::InsufficientReviews => "insufficient_reviews",
            Self::BelowThreshold => "below_threshold",
            Self::AwaitingOwner => "awaiting_owner",
            Self::NoMaintainerReviews => "no_maintainer_reviews",
            Self::NoReviews => "no_reviews",
            Self::InvalidVerdict => "invalid_verdict",
            Self::InvalidStage => "invalid_stage",
            Self::BadConfig(_) => "bad_config",
            Self::LockHeld => "lock_held",
            Self::LockTimeout => "lock_timeout",
            Self::ServerUnavailable => "server_unavailable",
            Self::ServerUnavailableForGated => "server_unavailable_for_gated",
            Self::ReviewSyncIncomplete => "review_sync_incomplete",
            Self::MergeConflict => "merge_conflict",
            Self::PromoteFailed(_) => "promote_failed",
            Self::TagFailed(_) => "tag_failed",
            Self::RateLimited => "rate_limited",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Git(_) => "git_error",
            Self::Db(_) => "storage_error",
            Self::Io(_) => "io_error",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RepoNotFound | Self::StreamNotFound | Self::AgentNotFound => ErrorKind::NotFound,
            Self::InsufficientPermissions
            | Self::BranchProtected
            | Self::MaintainersOnly
            | Self::GatedMode => ErrorKind::PermissionDenied,
            Self::CannotCommitNonActive
            | Self::InvalidTransition { .. }
            | Self::ParentNotMerged
            | Self::ConcurrentMerge
            | Self::AlreadyMerged => ErrorKind::StateError,
            Self::InsufficientReviews
            | Self::BelowThreshold
            | Self::AwaitingOwner
            | Self::NoMaintainerReviews
            | Self::NoReviews => ErrorKind::ConsensusError,
            Self::InvalidVerdict | Self::InvalidStage | Self::BadConfig(_) => ErrorKind::Validation,
            Self::LockHeld | Self::LockTimeout => ErrorKind::Concurrency,
            Self::ServerUnavailable
            | Self::ServerUnavailableForGated
            | Self::ReviewSyncIncomplete => ErrorKind::Network,
            Self::MergeConflict | Self::PromoteFailed(_) | Self::TagFailed(_) => ErrorKind::GitError,
            Self::RateLimited | Self::BudgetExhausted => ErrorKind::Policy,
            Self::Git(_) => ErrorKind::GitError,
            Self::Db(_) | Self::Io(_) => ErrorKind::StateError,
        }
    }
}

pub type Result<T> = std::result::Result<T, GitSwarmError>;

/// Maps an error produced anywhere in the command layer to the process exit
/// code table from the specification's CLI surface section. Walks the
/// `anyhow` chain looking for a `GitSwarmError`.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(gs) = cause.downcast_ref::<GitSwarmError>() {
            return match gs.kind() {
                ErrorKind::PermissionDenied => 2,
                ErrorKind::ConsensusError => 3,
                ErrorKind::GitError => {
                    if matches!(gs, GitSwarmError::MergeConflict) {
                        4
                    } else {
                        5
                    }
                }
                ErrorKind::Network => 5,
                ErrorKind::Concurrency => 6,
                ErrorKind::NotFound | ErrorKind::Validation => 1,
                ErrorKind::StateError | ErrorKind::Policy => 1,
            };
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_snake_case() {
        assert_eq!(GitSwarmError::RepoNotFound.code(), "repo_not_found");
        assert_eq!(GitSwarmError::MergeConflict.code(), "merge_conflict");
        assert_eq!(
            GitSwarmError::InvalidTransition {
                from: "merged".into(),
                to: "active".into()
            }
            .code(),
            "invalid_transition"
        );
    }

    #[test]
    fn exit_codes_match_spec_table() {
        let err = anyhow::Error::new(GitSwarmError::MergeConflict);
        assert_eq!(exit_code_for(&err), 4);
        let err = anyhow::Error::new(GitSwarmError::LockHeld);
        assert_eq!(exit_code_for(&err), 6);
        let err = anyhow::Error::new(GitSwarmError::ServerUnavailable);
        assert_eq!(exit_code_for(&err), 5);
        let err = anyhow::Error::new(GitSwarmError::InsufficientPermissions);
        assert_eq!(exit_code_for(&err), 2);
        let err = anyhow::Error::new(GitSwarmError::BelowThreshold);
        assert_eq!(exit_code_for(&err), 3);
    }
}
