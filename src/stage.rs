//! Repo Stage Engine (§4.9): tracks a repository's maturity as
//! `seed < growth < established < mature` and advances it once the
//! activity thresholds for the next stage are met.

use crate::activity::ActivityLog;
use crate::db::models::Stage;
use crate::db::Database;
use crate::error::Result;
use chrono::Utc;
use serde_json::json;

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    contributors: i64,
    patches: i64,
    maintainers: i64,
}

const GROWTH: Thresholds = Thresholds { contributors: 2, patches: 3, maintainers: 1 };
const ESTABLISHED: Thresholds = Thresholds { contributors: 5, patches: 10, maintainers: 2 };
const MATURE: Thresholds = Thresholds { contributors: 10, patches: 25, maintainers: 3 };

#[derive(Debug, Clone)]
pub struct RepoMetrics {
    pub contributor_count: i64,
    pub patch_count: i64,
    pub maintainer_count: i64,
}

#[derive(Debug, Clone)]
pub struct EligibilityReport {
    pub eligible: bool,
    pub next_stage: Option<Stage>,
    pub unmet_requirements: Vec<String>,
}

pub struct StageEngine {
    db: Database,
    activity: ActivityLog,
}

impl StageEngine {
    pub fn new(db: Database) -> Self {
        Self { activity: ActivityLog::new(db.clone()), db }
    }

    pub fn metrics(&self, repo_id: &str) -> Result<RepoMetrics> {
        let merges_table = self.db.table_name("merges");
        let maintainers_table = self.db.table_name("maintainers");

        let (patch_count, contributor_count) = self.db.with_conn(|conn| {
            let patch_count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {merges_table} WHERE repo_id = ?1"),
                rusqlite::params![repo_id],
                |row| row.get(0),
            )?;
            let contributor_count: i64 = conn.query_row(
                &format!("SELECT COUNT(DISTINCT agent_id) FROM {merges_table} WHERE repo_id = ?1"),
                rusqlite::params![repo_id],
                |row| row.get(0),
            )?;
            Ok((patch_count, contributor_count))
        })?;

        let maintainer_count: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT COUNT(*) FROM {maintainers_table} WHERE repo_id = ?1"),
                rusqlite::params![repo_id],
                |row| row.get(0),
            )
        })?;

        Ok(RepoMetrics { contributor_count, patch_count, maintainer_count })
    }

    /// Safe coercion of possibly-absent counters, mirroring the
    /// spec's `Number(x ?? 0)` guard against null/undefined metrics.
    fn meets(metrics: &RepoMetrics, t: Thresholds) -> Vec<String> {
        let mut unmet = Vec::new();
        if metrics.contributor_count < t.contributors {
            unmet.push(format!("needs {} contributors, has {}", t.contributors, metrics.contributor_count));
        }
        if metrics.patch_count < t.patches {
            unmet.push(format!("needs {} merged patches, has {}", t.patches, metrics.patch_count));
        }
        if metrics.maintainer_count < t.maintainers {
            unmet.push(format!("needs {} maintainers, has {}", t.maintainers, metrics.maintainer_count));
        }
        unmet
    }

    pub fn check_advancement_eligibility(&self, repo_id: &str, current: Stage) -> Result<EligibilityReport> {
        let metrics = self.metrics(repo_id)?;
        let (next_stage, thresholds) = match current {
            Stage::Seed => (Stage::Growth, GROWTH),
            Stage::Growth => (Stage::Established, ESTABLISHED),
            Stage::Established => (Stage::Mature, MATURE),
            Stage::Mature => {
                return Ok(EligibilityReport { eligible: false, next_stage: None, unmet_requirements: vec![] });
            }
        };

        let unmet_requirements = Self::meets(&metrics, thresholds);
        Ok(EligibilityReport {
            eligible: unmet_requirements.is_empty(),
            next_stage: Some(next_stage),
            unmet_requirements,
        })
    }

    /// Advances a repo to the next stage if eligible, or with `force`
    /// regardless of thresholds.
    pub fn advance_stage(&self, repo_id: &str, current: Stage, force: bool) -> Result<Option<Stage>> {
        let report = self.check_advancement_eligibility(repo_id, current)?;
        let Some(next_stage) = report.next_stage else {
            return Ok(None);
        };
        if !report.eligible && !force {
            return Ok(None);
        }
        self.set_stage(repo_id, next_stage, Some("threshold met"))?;
        Ok(Some(next_stage))
    }

    pub fn set_stage(&self, repo_id: &str, stage: Stage, reason: Option<&str>) -> Result<()> {
        let repos_table = self.db.table_name("repos");
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE {repos_table} SET stage = ?1 WHERE id = ?2"),
                rusqlite::params![stage.as_str(), repo_id],
            )
        })?;

        let history_table = self.db.table_name("stage_history");
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO {history_table} (repo_id, stage, reason, at) VALUES (?1, ?2, ?3, ?4)"),
                rusqlite::params![repo_id, stage.as_str(), reason, Utc::now().to_rfc3339()],
            )
        })?;

        self.activity.record(repo_id, "stage_advanced", json!({ "stage": stage.as_str(), "reason": reason }))
    }

    /// Sweeps every non-mature repo and auto-advances the eligible ones.
    /// Returns the repo ids that moved.
    pub fn check_all_repos_for_advancement(&self) -> Result<Vec<String>> {
        let repos_table = self.db.table_name("repos");
        let rows: Vec<(String, Stage)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT id, stage FROM {repos_table} WHERE stage != 'mature'"))?;
            let rows = stmt
                .query_map([], |row| {
                    let stage_str: String = row.get(1)?;
                    Ok((row.get::<_, String>(0)?, stage_str))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows
                .into_iter()
                .filter_map(|(id, s)| parse_stage(&s).map(|stage| (id, stage)))
                .collect())
        })?;

        let mut advanced = Vec::new();
        for (repo_id, stage) in rows {
            if self.advance_stage(&repo_id, stage, false)?.is_some() {
                advanced.push(repo_id);
            }
        }
        Ok(advanced)
    }
}

fn parse_stage(s: &str) -> Option<Stage> {
    match s {
        "seed" => Some(Stage::Seed),
        "growth" => Some(Stage::Growth),
        "established" => Some(Stage::Established),
        "mature" => Some(Stage::Mature),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn engine_with_merges(merge_count: i64, contributors: i64, maintainers: i64) -> (StageEngine, Database) {
        let db = Database::open_in_memory(false).unwrap();
        let repos = db.table_name("repos");
        db.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO {repos} (id, display_name, access_mode) VALUES ('repo-1', 'r', 'public')"),
                [],
            )
        })
        .unwrap();

        let merges = db.table_name("merges");
        db.with_conn(|conn| {
            for i in 0..merge_count {
                let agent = i % contributors.max(1);
                conn.execute(
                    &format!(
                        "INSERT INTO {merges} (repo_id, stream_id, agent_id, merge_commit, target_branch, merged_at) \
                         VALUES ('repo-1', ?1, ?2, 'c', 'buffer', '2026-01-01T00:00:00Z')"
                    ),
                    rusqlite::params![format!("stream-{i}"), format!("agent-{agent}")],
                )
                .unwrap();
            }
            Ok(())
        })
        .unwrap();

        let maintainers_table = db.table_name("maintainers");
        db.with_conn(|conn| {
            for i in 0..maintainers {
                conn.execute(
                    &format!("INSERT INTO {maintainers_table} (repo_id, agent_id, role) VALUES ('repo-1', ?1, 'maintainer')"),
                    rusqlite::params![format!("maint-{i}")],
                )
                .unwrap();
            }
            Ok(())
        })
        .unwrap();

        (StageEngine::new(db.clone()), db)
    }

    #[test]
    fn seed_repo_below_growth_threshold_is_not_eligible() {
        let (engine, _db) = engine_with_merges(1, 1, 0);
        let report = engine.check_advancement_eligibility("repo-1", Stage::Seed).unwrap();
        assert!(!report.eligible);
        assert!(!report.unmet_requirements.is_empty());
    }

    #[test]
    fn seed_repo_meeting_growth_threshold_advances() {
        let (engine, _db) = engine_with_merges(3, 2, 1);
        let next = engine.advance_stage("repo-1", Stage::Seed, false).unwrap();
        assert_eq!(next, Some(Stage::Growth));
    }

    #[test]
    fn force_advances_regardless_of_thresholds() {
        let (engine, _db) = engine_with_merges(0, 0, 0);
        let next = engine.advance_stage("repo-1", Stage::Seed, true).unwrap();
        assert_eq!(next, Some(Stage::Growth));
    }

    #[test]
    fn mature_repo_has_no_next_stage() {
        let (engine, _db) = engine_with_merges(50, 20, 5);
        let report = engine.check_advancement_eligibility("repo-1", Stage::Mature).unwrap();
        assert!(report.next_stage.is_none());
    }
}
