//! Stabilizer (§4.5): runs the repository's configured test command
//! against the integration buffer and records green/red outcomes.

use crate::activity::ActivityLog;
use crate::db::models::{Stabilization, StabilizationResult};
use crate::db::Database;
use crate::error::{GitSwarmError, Result};
use crate::git::GitAdapter;
use crate::policy::PolicyEngine;
use crate::streams::StreamRegistry;
use crate::sync::EventQueue;
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

const STABILIZE_TIMEOUT: Duration = Duration::from_secs(300);
const OUTPUT_CAP: usize = 2000;

pub struct StabilizeReport {
    pub result: StabilizationResult,
    pub buffer_commit: String,
    pub tag: Option<String>,
    pub breaking_stream_id: Option<String>,
}

pub struct Stabilizer {
    repo_id: String,
    db: Database,
    policy: Arc<PolicyEngine>,
    git: Arc<dyn GitAdapter>,
    registry: Arc<StreamRegistry>,
    activity: ActivityLog,
    queue: EventQueue,
}

impl Stabilizer {
    pub fn new(
        repo_id: impl Into<String>,
        db: Database,
        policy: Arc<PolicyEngine>,
        git: Arc<dyn GitAdapter>,
        registry: Arc<StreamRegistry>,
    ) -> Self {
        Self {
            activity: ActivityLog::new(db.clone()),
            queue: EventQueue::new(db.clone()),
            repo_id: repo_id.into(),
            db,
            policy,
            git,
            registry,
        }
    }

    pub async fn stabilize(&self) -> Result<StabilizeReport> {
        let repo = self.policy.repo(&self.repo_id)?;
        let command = repo
            .stabilize_command
            .clone()
            .ok_or_else(|| GitSwarmError::BadConfig("stabilize_command is not configured".into()))?;

        let buffer_commit = self.git.rev_parse(&repo.buffer_branch)?;

        let run = tokio::time::timeout(STABILIZE_TIMEOUT, run_command(&command, &repo.buffer_branch)).await;
        let (passed, details) = match run {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => (false, truncate(&e.to_string())),
            Err(_) => (false, "stabilize_command timed out after 300s".to_string()),
        };

        if passed {
            self.record_green(&buffer_commit, &details).await
        } else {
            self.record_red(&repo.auto_revert_on_red, &buffer_commit, &details)
        }
    }

    async fn record_green(&self, buffer_commit: &str, details: &str) -> Result<StabilizeReport> {
        let tag = format!("green/{}", safe_timestamp());
        self.git.tag(&tag, buffer_commit)?;

        let record = Stabilization {
            repo_id: self.repo_id.clone(),
            result: StabilizationResult::Green,
            tag: Some(tag.clone()),
            buffer_commit: buffer_commit.to_string(),
            breaking_stream_id: None,
            details: details.to_string(),
            at: Utc::now().to_rfc3339(),
        };
        self.persist(&record)?;

        self.activity.record(
            &self.repo_id,
            "stabilization_passed",
            json!({ "buffer_commit": buffer_commit, "tag": tag }),
        )?;
        self.queue.enqueue(
            "syncStabilization",
            json!({ "repo_id": self.repo_id, "result": "green", "buffer_commit": buffer_commit, "tag": tag }),
        )?;

        Ok(StabilizeReport {
            result: StabilizationResult::Green,
            buffer_commit: buffer_commit.to_string(),
            tag: Some(tag),
            breaking_stream_id: None,
        })
    }

    fn record_red(&self, auto_revert: &bool, buffer_commit: &str, details: &str) -> Result<StabilizeReport> {
        let mut breaking_stream_id = None;
        let mut full_details = details.to_string();

        if *auto_revert {
            match self.most_recent_merge()? {
                Some((stream_id, merge_commit)) => match self.git.revert_commit(&merge_commit) {
                    Ok(_) => {
                        breaking_stream_id = Some(stream_id.clone());
                        self.registry.force_status(&stream_id, crate::db::models::StreamStatus::Reverted)?;
                        self.activity.record(
                            &self.repo_id,
                            "critical_task_created",
                            json!({
                                "title": format!("Fix breaking merge from stream {stream_id}"),
                                "stream_id": stream_id,
                                "merge_commit": merge_commit,
                            }),
                        )?;
                    }
                    Err(e) => {
                        full_details = format!("{details}\nrevert_error: {e}");
                    }
                },
                None => {
                    full_details = format!("{details}\nrevert_error: no merge record to roll back");
                }
            }
        }

        let record = Stabilization {
            repo_id: self.repo_id.clone(),
            result: StabilizationResult::Red,
            tag: None,
            buffer_commit: buffer_commit.to_string(),
            breaking_stream_id: breaking_stream_id.clone(),
            details: full_details.clone(),
            at: Utc::now().to_rfc3339(),
        };
        self.persist(&record)?;

        self.activity.record(
            &self.repo_id,
            "stabilization_failed",
            json!({ "buffer_commit": buffer_commit, "breaking_stream_id": breaking_stream_id }),
        )?;
        self.queue.enqueue(
            "syncStabilization",
            json!({
                "repo_id": self.repo_id,
                "result": "red",
                "buffer_commit": buffer_commit,
                "breaking_stream_id": breaking_stream_id,
            }),
        )?;

        Ok(StabilizeReport {
            result: StabilizationResult::Red,
            buffer_commit: buffer_commit.to_string(),
            tag: None,
            breaking_stream_id,
        })
    }

    /// Returns `(stream_id, merge_commit)` for the most recent merge onto
    /// this repo's buffer, newest first. This is the heuristic rollback
    /// target: not a bisection, just "undo the last thing that landed".
    fn most_recent_merge(&self) -> Result<Option<(String, String)>> {
        let table = self.db.table_name("merges");
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT stream_id, merge_commit FROM {table} WHERE repo_id = ?1 ORDER BY id DESC LIMIT 1"),
                rusqlite::params![self.repo_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
        })
    }

    fn persist(&self, s: &Stabilization) -> Result<()> {
        let table = self.db.table_name("stabilizations");
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (repo_id, result, tag, buffer_commit, breaking_stream_id, details, at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                rusqlite::params![
                    s.repo_id,
                    s.result.as_str(),
                    s.tag,
                    s.buffer_commit,
                    s.breaking_stream_id,
                    s.details,
                    s.at,
                ],
            )
        })?;
        Ok(())
    }

    /// Accessor so the context layer can ask whether a just-abandoned
    /// stream was the one responsible for a prior red stabilization,
    /// without the stabilizer owning stream-status writes itself.
    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }
}

async fn run_command(command: &str, buffer_branch: &str) -> std::io::Result<(bool, String)> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .env("GIT_BRANCH", buffer_branch)
        .output()
        .await?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok((output.status.success(), truncate(&combined)))
}

fn truncate(s: &str) -> String {
    if s.len() > OUTPUT_CAP {
        let boundary = s
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= OUTPUT_CAP)
            .last()
            .unwrap_or(0);
        format!("{}... (truncated)", &s[..boundary])
    } else {
        s.to_string()
    }
}

fn safe_timestamp() -> String {
    Utc::now().to_rfc3339().replace([':', '+'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::test_support::registry_with;

    fn stabilizer(repo_insert_sql: &str) -> (Stabilizer, Arc<StreamRegistry>) {
        let (registry, db, policy, git) = registry_with(repo_insert_sql);
        let registry = Arc::new(registry);
        (Stabilizer::new("repo-1", db, policy, git, registry.clone()), registry)
    }

    #[test]
    fn output_is_truncated_to_cap() {
        let long = "x".repeat(OUTPUT_CAP + 500);
        let truncated = truncate(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.ends_with("(truncated)"));
    }

    #[tokio::test]
    async fn missing_stabilize_command_is_rejected() {
        let (stabilizer, _registry) = stabilizer(
            "(id, display_name, access_mode) VALUES ('repo-1', 'r', 'public')",
        );
        let err = stabilizer.stabilize().await.unwrap_err();
        assert!(matches!(err, GitSwarmError::BadConfig(_)));
    }

    #[tokio::test]
    async fn green_command_tags_the_buffer() {
        let (stabilizer, _registry) = stabilizer(
            "(id, display_name, access_mode, stabilize_command) VALUES ('repo-1', 'r', 'public', 'true')",
        );
        let report = stabilizer.stabilize().await.unwrap();
        assert_eq!(report.result, StabilizationResult::Green);
        assert!(report.tag.unwrap().starts_with("green/"));
    }

    #[tokio::test]
    async fn red_command_without_auto_revert_leaves_no_breaking_stream() {
        let (stabilizer, _registry) = stabilizer(
            "(id, display_name, access_mode, stabilize_command, auto_revert_on_red) VALUES ('repo-1', 'r', 'public', 'false', 0)",
        );
        let report = stabilizer.stabilize().await.unwrap();
        assert_eq!(report.result, StabilizationResult::Red);
        assert!(report.breaking_stream_id.is_none());
    }
}
