//! Policy Engine (§4.1): permission resolution, branch-rule matching, and
//! consensus evaluation.

pub mod pattern;

use crate::db::models::{
    AccessLevel, AccessMode, BranchRule, DirectPush, MaintainerRole, OwnershipModel, Repository,
    Verdict,
};
use crate::db::Database;
use crate::error::{GitSwarmError, Result};
use chrono::Utc;

pub struct PolicyEngine {
    db: Database,
}

/// Action a caller wants to perform, mapped to a minimum [`AccessLevel`] by
/// [`PolicyEngine::can_perform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
    Merge,
    Settings,
    Delete,
}

impl Action {
    fn minimum_level(self) -> AccessLevel {
        match self {
            Self::Read => AccessLevel::Read,
            Self::Write => AccessLevel::Write,
            Self::Merge => AccessLevel::Maintain,
            Self::Settings | Self::Delete => AccessLevel::Admin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionSource {
    ExplicitGrant,
    Maintainer,
    AccessMode,
}

#[derive(Debug, Clone)]
pub struct PermissionResolution {
    pub level: AccessLevel,
    pub source: PermissionSource,
    pub diagnostics: String,
}

#[derive(Debug, Clone)]
pub struct ConsensusResult {
    pub reached: bool,
    pub reason: &'static str,
    pub metrics: ConsensusMetrics,
}

#[derive(Debug, Clone, Default)]
pub struct ConsensusMetrics {
    pub approval_weight: f64,
    pub rejection_weight: f64,
    pub review_count: usize,
}

impl PolicyEngine {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Loads a repository row, for components outside the policy engine
    /// that need repo-level config (merge mode, buffer branch, ...).
    pub fn repo(&self, repo_id: &str) -> Result<Repository> {
        self.load_repo(repo_id)
    }

    fn load_repo(&self, repo_id: &str) -> Result<Repository> {
        let table = self.db.table_name("repos");
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    &format!(
                        "SELECT id, display_name, ownership_model, merge_mode, consensus_threshold, \
                         min_reviews, human_review_weight, buffer_branch, promote_target, \
                         stabilize_command, auto_promote_on_green, auto_revert_on_red, \
                         consensus_authority, access_mode, min_karma, stage, contributor_count, patch_count \
                         FROM {table} WHERE id = ?1"
                    ),
                    [repo_id],
                    crate::db::row_to_repository,
                )
                .map(Some)
                .or_else(|e| {
                    if e == rusqlite::Error::QueryReturnedNoRows {
                        Ok(None)
                    } else {
                        Err(e)
                    }
                })
            })?
            .ok_or(GitSwarmError::RepoNotFound)
    }

    fn lazily_expire_and_load_grant(
        &self,
        repo_id: &str,
        agent_id: &str,
    ) -> Result<Option<AccessLevel>> {
        let table = self.db.table_name("repo_access");
        let row: Option<(String, Option<String>)> = self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT access_level, expires_at FROM {table} WHERE repo_id = ?1 AND agent_id = ?2"),
                rusqlite::params![repo_id, agent_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .map(Some)
            .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })
        })?;

        let Some((level_str, expires_at)) = row else {
            return Ok(None);
        };

        if let Some(expiry) = &expires_at {
            if let Ok(expiry) = chrono::DateTime::parse_from_rfc3339(expiry) {
                if expiry < Utc::now() {
                    self.db.with_conn(|conn| {
                        conn.execute(
                            &format!("DELETE FROM {table} WHERE repo_id = ?1 AND agent_id = ?2"),
                            rusqlite::params![repo_id, agent_id],
                        )
                    })?;
                    return Ok(None);
                }
            }
        }

        Ok(Some(level_str.parse().unwrap_or(AccessLevel::None)))
    }

    fn maintainer_role(&self, repo_id: &str, agent_id: &str) -> Result<Option<MaintainerRole>> {
        let table = self.db.table_name("maintainers");
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT role FROM {table} WHERE repo_id = ?1 AND agent_id = ?2"),
                rusqlite::params![repo_id, agent_id],
                |row| row.get::<_, String>(0),
            )
            .map(|s| s.parse().ok())
            .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })
        })
    }

    /// §4.1 `resolvePermissions`.
    pub fn resolve_permissions(
        &self,
        agent_id: &str,
        repo_id: &str,
    ) -> Result<PermissionResolution> {
        let repo = self.load_repo(repo_id)?;

        if let Some(level) = self.lazily_expire_and_load_grant(repo_id, agent_id)? {
            return Ok(PermissionResolution {
                level,
                source: PermissionSource::ExplicitGrant,
                diagnostics: "explicit grant".to_string(),
            });
        }

        if let Some(role) = self.maintainer_role(repo_id, agent_id)? {
            let level = match role {
                MaintainerRole::Owner => AccessLevel::Admin,
                MaintainerRole::Maintainer => AccessLevel::Maintain,
            };
            return Ok(PermissionResolution {
                level,
                source: PermissionSource::Maintainer,
                diagnostics: format!("maintainer role: {role}"),
            });
        }

        let private = repo.access_mode == AccessMode::Private;
        let level = match repo.access_mode {
            AccessMode::Public => AccessLevel::Write,
            AccessMode::KarmaThreshold => {
                let karma = self.agent_karma(agent_id)?;
                if karma >= repo.min_karma {
                    AccessLevel::Write
                } else if private {
                    AccessLevel::None
                } else {
                    AccessLevel::Read
                }
            }
            AccessMode::Allowlist => AccessLevel::None,
            AccessMode::Private => AccessLevel::None,
        };

        Ok(PermissionResolution {
            level,
            source: PermissionSource::AccessMode,
            diagnostics: format!("access mode: {}", repo.access_mode),
        })
    }

    fn agent_karma(&self, agent_id: &str) -> Result<i64> {
        let table = self.db.table_name("agents");
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    &format!("SELECT karma FROM {table} WHERE id = ?1"),
                    [agent_id],
                    |row| row.get::<_, i64>(0),
                )
                .map(Some)
                .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })
            })?
            .ok_or(GitSwarmError::AgentNotFound)
    }

    /// §4.1 `canPerform`.
    pub fn can_perform(&self, agent_id: &str, repo_id: &str, action: Action) -> Result<bool> {
        let resolution = self.resolve_permissions(agent_id, repo_id)?;
        Ok(resolution.level.rank() >= action.minimum_level().rank())
    }

    /// §4.1 `canPushToBranch`.
    pub fn can_push_to_branch(&self, agent_id: &str, repo_id: &str, branch: &str) -> Result<bool> {
        let rules = self.branch_rules(repo_id)?;
        let resolution = self.resolve_permissions(agent_id, repo_id)?;

        let rule = rules
            .iter()
            .find(|r| pattern::matches_branch_pattern(branch, &r.branch_pattern));

        let Some(rule) = rule else {
            // No rule matches: fall back to a plain write check.
            return Ok(resolution.level.rank() >= AccessLevel::Write.rank());
        };

        Ok(match rule.direct_push {
            DirectPush::None => false,
            DirectPush::Maintainers => resolution.level.rank() >= AccessLevel::Maintain.rank(),
            DirectPush::All => resolution.level.rank() >= AccessLevel::Write.rank(),
        })
    }

    fn branch_rules(&self, repo_id: &str) -> Result<Vec<BranchRule>> {
        let table = self.db.table_name("branch_rules");
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, repo_id, branch_pattern, priority, direct_push, required_approvals, require_tests_pass \
                 FROM {table} WHERE repo_id = ?1 ORDER BY priority DESC"
            ))?;
            let rows = stmt
                .query_map([repo_id], |row| {
                    Ok(BranchRule {
                        id: row.get(0)?,
                        repo_id: row.get(1)?,
                        branch_pattern: row.get(2)?,
                        priority: row.get(3)?,
                        direct_push: row.get::<_, String>(4)?.parse().unwrap_or(DirectPush::Maintainers),
                        required_approvals: row.get(5)?,
                        require_tests_pass: row.get::<_, i64>(6)? != 0,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// §4.1 `checkConsensus`. `reviews` is `(is_maintainer, is_human, karma, verdict)`
    /// for every review currently recorded against the stream.
    pub fn check_consensus(
        &self,
        repo_id: &str,
        reviews: &[(bool, bool, i64, Verdict)],
    ) -> Result<ConsensusResult> {
        let repo = self.load_repo(repo_id)?;

        if repo.merge_mode == crate::db::models::MergeMode::Swarm {
            return Ok(ConsensusResult {
                reached: true,
                reason: "swarm_mode",
                metrics: ConsensusMetrics::default(),
            });
        }

        if (reviews.len() as i64) < repo.min_reviews {
            return Ok(ConsensusResult {
                reached: false,
                reason: "insufficient_reviews",
                metrics: ConsensusMetrics {
                    review_count: reviews.len(),
                    ..Default::default()
                },
            });
        }

        match repo.ownership_model {
            OwnershipModel::Solo => {
                let reached = reviews
                    .iter()
                    .any(|(is_maint, _, _, v)| *is_maint && *v == Verdict::Approve);
                Ok(ConsensusResult {
                    reached,
                    reason: if reached { "owner_approved" } else { "awaiting_owner" },
                    metrics: ConsensusMetrics {
                        review_count: reviews.len(),
                        ..Default::default()
                    },
                })
            }
            OwnershipModel::Guild => {
                let (mut approvals, mut rejections) = (0u32, 0u32);
                for (is_maint, _, _, verdict) in reviews.iter().filter(|(m, ..)| *m) {
                    match verdict {
                        Verdict::Approve => approvals += 1,
                        Verdict::RequestChanges => rejections += 1,
                        Verdict::Comment => {}
                    }
                }
                let total = approvals + rejections;
                if total == 0 {
                    return Ok(ConsensusResult {
                        reached: false,
                        reason: "no_maintainer_reviews",
                        metrics: ConsensusMetrics {
                            review_count: reviews.len(),
                            ..Default::default()
                        },
                    });
                }
                let ratio = f64::from(approvals) / f64::from(total);
                let reached = ratio >= repo.consensus_threshold;
                Ok(ConsensusResult {
                    reached,
                    reason: if reached { "quorum_reached" } else { "below_threshold" },
                    metrics: ConsensusMetrics {
                        approval_weight: f64::from(approvals),
                        rejection_weight: f64::from(rejections),
                        review_count: reviews.len(),
                    },
                })
            }
            OwnershipModel::Open => {
                let mut approval_w = 0.0;
                let mut rejection_w = 0.0;
                for (_, is_human, karma, verdict) in reviews {
                    let weight = if *is_human {
                        repo.human_review_weight
                    } else {
                        f64::from(*karma as i32 + 1).sqrt()
                    };
                    match verdict {
                        Verdict::Approve => approval_w += weight,
                        Verdict::RequestChanges => rejection_w += weight,
                        Verdict::Comment => {}
                    }
                }
                let total = approval_w + rejection_w;
                if total <= f64::EPSILON {
                    return Ok(ConsensusResult {
                        reached: false,
                        reason: "no_reviews",
                        metrics: ConsensusMetrics {
                            review_count: reviews.len(),
                            ..Default::default()
                        },
                    });
                }
                let ratio = approval_w / total;
                let reached = ratio >= repo.consensus_threshold;
                Ok(ConsensusResult {
                    reached,
                    reason: if reached { "quorum_reached" } else { "below_threshold" },
                    metrics: ConsensusMetrics {
                        approval_weight: approval_w,
                        rejection_weight: rejection_w,
                        review_count: reviews.len(),
                    },
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::MergeMode;

    fn engine_with_repo(ownership: OwnershipModel, threshold: f64, min_reviews: i64) -> (PolicyEngine, String) {
        let db = Database::open_in_memory(false).unwrap();
        let repo_id = "repo-1".to_string();
        let table = db.table_name("repos");
        db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (id, display_name, ownership_model, merge_mode, consensus_threshold, min_reviews, human_review_weight, buffer_branch, promote_target, access_mode, min_karma) \
                     VALUES (?1, 'r', ?2, ?3, ?4, ?5, 1.5, 'buffer', 'main', 'private', 0)"
                ),
                rusqlite::params![repo_id, ownership.as_str(), MergeMode::Review.as_str(), threshold, min_reviews],
            )
        })
        .unwrap();
        (PolicyEngine::new(db), repo_id)
    }

    /// P1: in a solo repo, a non-maintainer approval never flips `reached`.
    #[test]
    fn p1_solo_non_maintainer_approval_never_reaches() {
        let (engine, repo) = engine_with_repo(OwnershipModel::Solo, 0.6, 1);
        let reviews = vec![(false, false, 0, Verdict::Approve)];
        let result = engine.check_consensus(&repo, &reviews).unwrap();
        assert!(!result.reached);
        assert_eq!(result.reason, "awaiting_owner");
    }

    #[test]
    fn solo_maintainer_approval_reaches() {
        let (engine, repo) = engine_with_repo(OwnershipModel::Solo, 0.6, 1);
        let reviews = vec![(true, false, 0, Verdict::Approve)];
        let result = engine.check_consensus(&repo, &reviews).unwrap();
        assert!(result.reached);
    }

    /// P2 / S2: open-mode karma weighting, matching the scenario numbers
    /// in the specification almost exactly.
    #[test]
    fn s2_open_mode_karma_weighted_consensus() {
        let (engine, repo) = engine_with_repo(OwnershipModel::Open, 0.66, 2);
        let reviews = vec![
            (false, false, 49, Verdict::Approve),
            (false, false, 0, Verdict::RequestChanges),
            (false, true, 0, Verdict::Approve),
        ];
        let result = engine.check_consensus(&repo, &reviews).unwrap();
        assert!(result.reached);
        assert!((result.metrics.approval_weight - (50f64.sqrt() + 1.5)).abs() < 1e-9);

        let without_human = vec![
            (false, false, 49, Verdict::Approve),
            (false, false, 0, Verdict::RequestChanges),
        ];
        let result2 = engine.check_consensus(&repo, &without_human).unwrap();
        assert!(result2.reached);
    }

    #[test]
    fn p2_weight_is_monotonic_in_karma() {
        let lo = f64::from(0 + 1).sqrt();
        let hi = f64::from(100 + 1).sqrt();
        assert!(hi > lo);
    }

    #[test]
    fn guild_quorum_among_maintainers_only() {
        let (engine, repo) = engine_with_repo(OwnershipModel::Guild, 0.5, 1);
        let reviews = vec![
            (true, false, 0, Verdict::Approve),
            (false, false, 999, Verdict::RequestChanges),
        ];
        let result = engine.check_consensus(&repo, &reviews).unwrap();
        assert!(result.reached);
    }

    #[test]
    fn swarm_mode_always_reaches() {
        let db = Database::open_in_memory(false).unwrap();
        let table = db.table_name("repos");
        db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (id, display_name, ownership_model, merge_mode, access_mode) VALUES ('r', 'r', 'open', 'swarm', 'private')"
                ),
                [],
            )
        })
        .unwrap();
        let engine = PolicyEngine::new(db);
        let result = engine.check_consensus("r", &[]).unwrap();
        assert!(result.reached);
        assert_eq!(result.reason, "swarm_mode");
    }
}
