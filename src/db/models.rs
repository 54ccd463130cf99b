//! Tagged product types for every table in the policy schema (§3 of the
//! specification). Nullable columns are promoted to `Option<T>`; closed
//! sets are enums implementing `FromStr`/`Display` the way the teacher's
//! `Provider` does in `src/providers.rs`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! simple_enum {
    ($name:ident { $($variant:ident => $str:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $str),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = crate::error::GitSwarmError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($str => Ok(Self::$variant)),+,
                    _ => Err(crate::error::GitSwarmError::BadConfig(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        s
                    ))),
                }
            }
        }
    };
}

simple_enum!(OwnershipModel { Solo => "solo", Guild => "guild", Open => "open" });
simple_enum!(MergeMode { Swarm => "swarm", Review => "review", Gated => "gated" });
simple_enum!(ConsensusAuthority { Local => "local", Server => "server" });
simple_enum!(AccessMode { Public => "public", KarmaThreshold => "karma_threshold", Allowlist => "allowlist", Private => "private" });
simple_enum!(AccessLevel { None => "none", Read => "read", Write => "write", Maintain => "maintain", Admin => "admin" });
simple_enum!(MaintainerRole { Owner => "owner", Maintainer => "maintainer" });
simple_enum!(DirectPush { None => "none", Maintainers => "maintainers", All => "all" });
simple_enum!(StreamStatus { Active => "active", InReview => "in_review", Merged => "merged", Abandoned => "abandoned", Reverted => "reverted" });
simple_enum!(ReviewStatus { None => "none", InReview => "in_review", Approved => "approved", ChangesRequested => "changes_requested" });
simple_enum!(StreamSource { Cli => "cli", Api => "api", GithubPr => "github_pr" });
simple_enum!(Verdict { Approve => "approve", RequestChanges => "request_changes", Comment => "comment" });
simple_enum!(StabilizationResult { Green => "green", Red => "red" });
simple_enum!(TriggeredBy { Auto => "auto", Manual => "manual", Council => "council" });
simple_enum!(Stage { Seed => "seed", Growth => "growth", Established => "established", Mature => "mature" });

impl AccessLevel {
    /// Ordering used by [`crate::policy::canPerform`]'s minimum-level checks.
    pub const fn rank(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Read => 1,
            Self::Write => 2,
            Self::Maintain => 3,
            Self::Admin => 4,
        }
    }
}

impl Stage {
    pub const ORDER: [Stage; 4] = [Stage::Seed, Stage::Growth, Stage::Established, Stage::Mature];

    pub fn rank(&self) -> usize {
        Self::ORDER.iter().position(|s| s == self).unwrap_or(0)
    }
}

impl PartialOrd for Stage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Stage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub secret_hash: String,
    pub karma: i64,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub display_name: String,
    pub ownership_model: OwnershipModel,
    pub merge_mode: MergeMode,
    pub consensus_threshold: f64,
    pub min_reviews: i64,
    pub human_review_weight: f64,
    pub buffer_branch: String,
    pub promote_target: String,
    pub stabilize_command: Option<String>,
    pub auto_promote_on_green: bool,
    pub auto_revert_on_red: bool,
    pub consensus_authority: ConsensusAuthority,
    pub access_mode: AccessMode,
    pub min_karma: i64,
    pub stage: Stage,
    pub contributor_count: i64,
    pub patch_count: i64,
}

#[derive(Debug, Clone)]
pub struct Maintainer {
    pub repo_id: String,
    pub agent_id: String,
    pub role: MaintainerRole,
}

#[derive(Debug, Clone)]
pub struct ExplicitGrant {
    pub repo_id: String,
    pub agent_id: String,
    pub access_level: AccessLevel,
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BranchRule {
    pub id: String,
    pub repo_id: String,
    pub branch_pattern: String,
    pub priority: i64,
    pub direct_push: DirectPush,
    pub required_approvals: i64,
    pub require_tests_pass: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: String,
    pub repo_id: String,
    pub owner_agent_id: String,
    pub branch: String,
    pub base_branch: String,
    pub parent_stream_id: Option<String>,
    pub task: Option<String>,
    pub source: StreamSource,
    pub status: StreamStatus,
    pub review_status: ReviewStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct StreamCommit {
    pub stream_id: String,
    pub agent_id: String,
    pub commit_hash: String,
    pub change_id: Option<String>,
    pub message: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct Review {
    pub stream_id: String,
    pub reviewer_agent_id: String,
    pub verdict: Verdict,
    pub feedback: String,
    pub is_human: bool,
    pub tested: bool,
    pub reviewed_at: String,
}

#[derive(Debug, Clone)]
pub struct MergeRecord {
    pub repo_id: String,
    pub stream_id: String,
    pub agent_id: String,
    pub merge_commit: String,
    pub target_branch: String,
    pub merged_at: String,
}

#[derive(Debug, Clone)]
pub struct Stabilization {
    pub repo_id: String,
    pub result: StabilizationResult,
    pub tag: Option<String>,
    pub buffer_commit: String,
    pub breaking_stream_id: Option<String>,
    pub details: String,
    pub at: String,
}

#[derive(Debug, Clone)]
pub struct Promotion {
    pub repo_id: String,
    pub from_branch: String,
    pub to_branch: String,
    pub from_commit: String,
    pub to_commit: String,
    pub triggered_by: TriggeredBy,
    pub agent_id: Option<String>,
    pub at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub seq: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginExecutionStatus {
    Executed,
    Skipped,
    RateLimited,
    Blocked,
    Error,
}

impl fmt::Display for PluginExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Executed => "executed",
            Self::Skipped => "skipped",
            Self::RateLimited => "rate_limited",
            Self::Blocked => "blocked",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct PluginExecutionRecord {
    pub repo_id: String,
    pub trigger: String,
    pub plugin: String,
    pub status: PluginExecutionStatus,
    pub at: String,
    pub safe_outputs: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips_through_str() {
        assert_eq!(OwnershipModel::from_str("guild").unwrap(), OwnershipModel::Guild);
        assert_eq!(OwnershipModel::Guild.as_str(), "guild");
        assert!(OwnershipModel::from_str("bogus").is_err());
    }

    #[test]
    fn access_level_rank_orders_correctly() {
        assert!(AccessLevel::Admin.rank() > AccessLevel::Maintain.rank());
        assert!(AccessLevel::Maintain.rank() > AccessLevel::Write.rank());
        assert!(AccessLevel::Write.rank() > AccessLevel::Read.rank());
        assert!(AccessLevel::Read.rank() > AccessLevel::None.rank());
    }

    #[test]
    fn stage_ordering_is_monotonic() {
        assert!(Stage::Seed < Stage::Growth);
        assert!(Stage::Growth < Stage::Established);
        assert!(Stage::Established < Stage::Mature);
    }
}
