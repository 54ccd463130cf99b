//! Merge Orchestration (§4.4): `mergeToBuffer(stream, agent)`, the single
//! path by which a stream's commits land on the buffer branch.

use super::serializer::BufferMergeSerializer;
use crate::activity::ActivityLog;
use crate::db::models::{ConsensusAuthority, MergeMode, MergeRecord, StreamStatus};
use crate::db::Database;
use crate::error::{GitSwarmError, Result};
use crate::git::GitAdapter;
use crate::policy::{Action, PolicyEngine};
use crate::streams::{ReviewBook, StreamRegistry};
use crate::sync::{EventQueue, SyncClient};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

pub struct MergeReport {
    pub merge_commit: String,
    pub target_branch: String,
}

pub struct MergeOrchestrator {
    repo_id: String,
    db: Database,
    policy: Arc<PolicyEngine>,
    registry: Arc<StreamRegistry>,
    reviews: ReviewBook,
    git: Arc<dyn GitAdapter>,
    serializer: BufferMergeSerializer,
    queue: EventQueue,
    sync_client: Option<Arc<dyn SyncClient>>,
    activity: ActivityLog,
}

impl MergeOrchestrator {
    pub fn new(
        repo_id: impl Into<String>,
        db: Database,
        policy: Arc<PolicyEngine>,
        registry: Arc<StreamRegistry>,
        git: Arc<dyn GitAdapter>,
        worker_id: impl Into<String>,
        sync_client: Option<Arc<dyn SyncClient>>,
    ) -> Self {
        let repo_id = repo_id.into();
        Self {
            reviews: ReviewBook::new(db.clone()),
            serializer: BufferMergeSerializer::new(db.clone(), worker_id),
            queue: EventQueue::new(db.clone()),
            activity: ActivityLog::new(db.clone()),
            repo_id,
            db,
            policy,
            registry,
            git,
            sync_client,
        }
    }

    /// Rebinds the remote coordinator client, e.g. after `connect` or when
    /// a context is reopened with a server already configured. Without
    /// this the orchestrator never sees a live client and silently falls
    /// back to local authorization even when `consensus_authority` says
    /// the server is the one that should be answering.
    pub fn set_sync_client(&mut self, sync_client: Option<Arc<dyn SyncClient>>) {
        self.sync_client = sync_client;
    }

    fn consensus_error(reason: &str) -> GitSwarmError {
        match reason {
            "insufficient_reviews" => GitSwarmError::InsufficientReviews,
            "awaiting_owner" => GitSwarmError::AwaitingOwner,
            "no_maintainer_reviews" => GitSwarmError::NoMaintainerReviews,
            "no_reviews" => GitSwarmError::NoReviews,
            _ => GitSwarmError::BelowThreshold,
        }
    }

    /// §4.4. `agent_id` is the agent requesting the merge (used for
    /// permission checks under gated mode without a remote).
    pub async fn merge_to_buffer(&self, stream_id: &str, agent_id: &str) -> Result<MergeReport> {
        let repo = self.policy.repo(&self.repo_id)?;
        let stream = self.registry.require(stream_id)?;

        if let Some(parent_id) = &stream.parent_stream_id {
            let parent = self.registry.require(parent_id)?;
            if parent.status != StreamStatus::Merged {
                return Err(GitSwarmError::ParentNotMerged);
            }
        }

        let swarm = repo.merge_mode == MergeMode::Swarm;
        let status_ok = stream.status == StreamStatus::InReview || (swarm && stream.status == StreamStatus::Active);
        if !status_ok {
            return Err(GitSwarmError::CannotCommitNonActive);
        }

        match repo.merge_mode {
            MergeMode::Gated => self.authorize_gated(stream_id, agent_id).await?,
            MergeMode::Review | MergeMode::Swarm => self.authorize_by_consensus(stream_id).await?,
        }

        let lock = self.serializer.acquire(&self.repo_id, agent_id)?;
        let stream_id_owned = stream.id.clone();
        let stream_branch = stream.branch.clone();
        let buffer_branch = repo.buffer_branch.clone();
        let agent_id_owned = agent_id.to_string();
        let registry = self.registry.clone();
        let git = self.git.clone();
        let db = self.db.clone();
        let repo_id = self.repo_id.clone();

        // The merge itself shells out to git; run it off the async
        // executor thread so a slow merge doesn't stall other tasks.
        let outcome = tokio::task::spawn_blocking(move || {
            execute_merge(&registry, &git, &db, &repo_id, &stream_id_owned, &stream_branch, &buffer_branch, &agent_id_owned)
        })
        .await
        .map_err(|e| GitSwarmError::Io(std::io::Error::other(e.to_string())))?;
        lock.release();
        let (merge_commit, target_branch) = outcome?;

        self.update_counters()?;
        self.activity.record(
            &self.repo_id,
            "stream_merged",
            json!({ "stream_id": stream_id, "merge_commit": merge_commit, "agent_id": agent_id }),
        )?;
        self.report_merge(stream_id, agent_id, &merge_commit)?;

        Ok(MergeReport {
            merge_commit,
            target_branch,
        })
    }

    async fn authorize_gated(&self, stream_id: &str, agent_id: &str) -> Result<()> {
        if let Some(sync) = &self.sync_client {
            match sync.request_merge(&self.repo_id, stream_id).await {
                Ok(resp) if resp.approved => Ok(()),
                Ok(_) => Err(GitSwarmError::BelowThreshold),
                Err(_) => {
                    self.queue.enqueue(
                        "merge_requested",
                        json!({ "repo_id": self.repo_id, "stream_id": stream_id }),
                    )?;
                    Err(GitSwarmError::ServerUnavailableForGated)
                }
            }
        } else if self.policy.can_perform(agent_id, &self.repo_id, Action::Merge)? {
            Ok(())
        } else {
            Err(GitSwarmError::InsufficientPermissions)
        }
    }

    async fn authorize_by_consensus(&self, stream_id: &str) -> Result<()> {
        let repo = self.policy.repo(&self.repo_id)?;

        if repo.consensus_authority == ConsensusAuthority::Server {
            if let Some(sync) = &self.sync_client {
                let flush = sync.flush_queue(&self.queue).await?;
                if flush.review_critical_pending() {
                    return Err(GitSwarmError::ReviewSyncIncomplete);
                }
                return match sync.check_consensus(&self.repo_id, stream_id).await {
                    Ok(resp) if resp.reached => Ok(()),
                    Ok(resp) => Err(Self::consensus_error(&resp.reason)),
                    Err(_) => {
                        self.queue.enqueue(
                            "merge_requested",
                            json!({ "repo_id": self.repo_id, "stream_id": stream_id }),
                        )?;
                        Err(GitSwarmError::ServerUnavailable)
                    }
                };
            }
        }

        let reviews = self.reviews.reviews_for_consensus(&self.repo_id, stream_id)?;
        let result = self.policy.check_consensus(&self.repo_id, &reviews)?;
        if result.reached {
            Ok(())
        } else {
            Err(Self::consensus_error(result.reason))
        }
    }

    /// repo.contributor_count = distinct merged-stream owners;
    /// repo.patch_count = total merged streams (§4.4 step 8).
    fn update_counters(&self) -> Result<()> {
        let streams_table = self.db.table_name("streams");
        let repos_table = self.db.table_name("repos");
        self.db.with_conn(|conn| {
            let (contributors, patches): (i64, i64) = conn.query_row(
                &format!(
                    "SELECT COUNT(DISTINCT owner_agent_id), COUNT(*) FROM {streams_table} \
                     WHERE repo_id = ?1 AND status = 'merged'"
                ),
                [&self.repo_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            conn.execute(
                &format!("UPDATE {repos_table} SET contributor_count = ?1, patch_count = ?2 WHERE id = ?3"),
                rusqlite::params![contributors, patches, self.repo_id],
            )
        })?;
        Ok(())
    }

    fn report_merge(&self, stream_id: &str, agent_id: &str, merge_commit: &str) -> Result<()> {
        self.queue.enqueue(
            "syncMergeCompleted",
            json!({
                "repo_id": self.repo_id,
                "stream_id": stream_id,
                "agent_id": agent_id,
                "merge_commit": merge_commit,
            }),
        )
    }
}

/// Step 7: re-read the stream under the serializer lock (the optimistic
/// guard against a second merge racing this one), then perform the git
/// merge and persist the Merge Record. A free function so it can run
/// inside `spawn_blocking` without borrowing the orchestrator across the
/// blocking boundary.
fn execute_merge(
    registry: &StreamRegistry,
    git: &Arc<dyn GitAdapter>,
    db: &Database,
    repo_id: &str,
    stream_id: &str,
    stream_branch: &str,
    buffer_branch: &str,
    agent_id: &str,
) -> Result<(String, String)> {
    let fresh = registry.require(stream_id)?;
    if fresh.status != StreamStatus::InReview && fresh.status != StreamStatus::Active {
        return Err(GitSwarmError::ConcurrentMerge);
    }

    git.checkout(buffer_branch)?;
    let message = format!("Merge stream {stream_branch} into {buffer_branch}");
    let merge = git.merge_no_ff(stream_branch, &message)?;
    if merge.conflicted {
        git.merge_abort()?;
        return Err(GitSwarmError::MergeConflict);
    }

    registry.force_status(stream_id, StreamStatus::Merged)?;

    let table = db.table_name("merges");
    let record = MergeRecord {
        repo_id: repo_id.to_string(),
        stream_id: stream_id.to_string(),
        agent_id: agent_id.to_string(),
        merge_commit: merge.merge_commit.clone(),
        target_branch: buffer_branch.to_string(),
        merged_at: Utc::now().to_rfc3339(),
    };
    db.with_conn(|conn| {
        conn.execute(
            &format!(
                "INSERT INTO {table} (repo_id, stream_id, agent_id, merge_commit, target_branch, merged_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            rusqlite::params![
                record.repo_id,
                record.stream_id,
                record.agent_id,
                record.merge_commit,
                record.target_branch,
                record.merged_at,
            ],
        )
    })?;

    Ok((merge.merge_commit, buffer_branch.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Verdict;
    use crate::streams::test_support::registry_with;
    use crate::streams::CreateWorkspaceRequest;

    fn orchestrator(repo_insert_sql: &str) -> (MergeOrchestrator, Arc<StreamRegistry>, Database) {
        let (registry, db, policy, git) = registry_with(repo_insert_sql);
        let registry = Arc::new(registry);
        let orchestrator = MergeOrchestrator::new("repo-1", db.clone(), policy, registry.clone(), git, "worker-1", None);
        (orchestrator, registry, db)
    }

    /// P6: a child stream cannot merge while its parent is unmerged.
    #[tokio::test]
    async fn parent_not_merged_blocks_merge() {
        let (orchestrator, registry, _db) = orchestrator(
            "(id, display_name, access_mode, merge_mode, buffer_branch, min_reviews) \
             VALUES ('repo-1', 'r', 'public', 'swarm', 'buffer', 0)",
        );
        let parent = registry
            .create_workspace(CreateWorkspaceRequest {
                agent_id: "alice".into(),
                task: None,
                depends_on: None,
                name: None,
            })
            .unwrap();
        let child = registry
            .create_workspace(CreateWorkspaceRequest {
                agent_id: "bob".into(),
                task: None,
                depends_on: Some(parent.stream_id.clone()),
                name: Some("child".into()),
            })
            .unwrap();

        let err = orchestrator.merge_to_buffer(&child.stream_id, "bob").await.unwrap_err();
        assert!(matches!(err, GitSwarmError::ParentNotMerged));
    }

    #[tokio::test]
    async fn swarm_mode_merges_an_active_stream() {
        let (orchestrator, registry, db) = orchestrator(
            "(id, display_name, access_mode, merge_mode, buffer_branch, min_reviews) \
             VALUES ('repo-1', 'r', 'public', 'swarm', 'buffer', 0)",
        );
        let ws = registry
            .create_workspace(CreateWorkspaceRequest {
                agent_id: "alice".into(),
                task: None,
                depends_on: None,
                name: None,
            })
            .unwrap();

        let report = orchestrator.merge_to_buffer(&ws.stream_id, "alice").await.unwrap();
        assert_eq!(report.target_branch, "buffer");

        let stream = registry.require(&ws.stream_id).unwrap();
        assert_eq!(stream.status, StreamStatus::Merged);

        let repos_table = db.table_name("repos");
        let patch_count: i64 = db
            .with_conn(|conn| conn.query_row(&format!("SELECT patch_count FROM {repos_table} WHERE id = 'repo-1'"), [], |r| r.get(0)))
            .unwrap();
        assert_eq!(patch_count, 1);
    }

    /// Review mode with no reviews yet refuses to merge.
    #[tokio::test]
    async fn review_mode_without_reviews_is_rejected() {
        let (orchestrator, registry, _db) = orchestrator(
            "(id, display_name, access_mode, merge_mode, buffer_branch, ownership_model, min_reviews) \
             VALUES ('repo-1', 'r', 'public', 'review', 'buffer', 'guild', 1)",
        );
        let ws = registry
            .create_workspace(CreateWorkspaceRequest {
                agent_id: "alice".into(),
                task: None,
                depends_on: None,
                name: None,
            })
            .unwrap();
        registry.submit_for_review(&ws.stream_id, "alice").unwrap();

        let err = orchestrator.merge_to_buffer(&ws.stream_id, "alice").await.unwrap_err();
        assert!(matches!(err, GitSwarmError::InsufficientReviews));
    }

    /// P1-adjacent: a maintainer approval under solo ownership lets the
    /// merge through.
    #[tokio::test]
    async fn review_mode_with_maintainer_approval_merges() {
        let (orchestrator, registry, db) = orchestrator(
            "(id, display_name, access_mode, merge_mode, buffer_branch, ownership_model, min_reviews) \
             VALUES ('repo-1', 'r', 'public', 'review', 'buffer', 'solo', 1)",
        );
        let maintainers = db.table_name("maintainers");
        db.with_conn(|conn| {
            conn.execute(&format!("INSERT INTO {maintainers} (repo_id, agent_id, role) VALUES ('repo-1', 'bob', 'maintainer')"), [])
        })
        .unwrap();

        let ws = registry
            .create_workspace(CreateWorkspaceRequest {
                agent_id: "alice".into(),
                task: None,
                depends_on: None,
                name: None,
            })
            .unwrap();
        registry.submit_for_review(&ws.stream_id, "alice").unwrap();

        let reviews = crate::streams::review::ReviewBook::new(db.clone());
        reviews
            .submit(&ws.stream_id, "alice", "bob", Verdict::Approve, "lgtm", false, true)
            .unwrap();

        let report = orchestrator.merge_to_buffer(&ws.stream_id, "alice").await.unwrap();
        assert_eq!(report.merge_commit, "merged");
    }
}
