//! Event Bus / Plugin Runner (§4.8).
//!
//! Plugins register against a fixed set of lifecycle triggers. This
//! runner executes the `automation` tier directly (deterministic, local,
//! no model calls); `ai` and `governance` tier plugins are recognized and
//! accounted for but dispatched to a remote coordinator, which this crate
//! does not implement — see [`Tier::requires_remote`].

use crate::activity::ActivityLog;
use crate::db::Database;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

/// Lifecycle points a plugin can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    StreamCreated,
    Commit,
    ReviewSubmitted,
    StreamMerged,
    StabilizationPassed,
    StabilizationFailed,
    ConsensusReached,
    ConsensusBlocked,
    Promote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Automation,
    Ai,
    Governance,
}

impl Tier {
    pub fn requires_remote(self) -> bool {
        matches!(self, Self::Ai | Self::Governance)
    }
}

/// Infers a plugin's tier the way the repo-embedded plugin file is read:
/// governance triggers/names win first, then an AI engine/model or
/// AI-sounding name, everything else defaults to automation.
pub fn infer_tier(name: &str, trigger_raw: &str, engine: Option<&str>, model: Option<&str>) -> Tier {
    let lname = name.to_lowercase();
    let ltrigger = trigger_raw.to_lowercase();

    if ltrigger.contains("gitswarm.consensus")
        || ltrigger.contains("gitswarm.council")
        || lname.contains("consensus")
        || lname.contains("karma-fast-track")
    {
        return Tier::Governance;
    }

    let ai_indicators = ["ai", "llm", "gpt", "claude", "model", "agentic"];
    if engine.is_some() || model.is_some() || ai_indicators.iter().any(|i| lname.contains(i)) {
        return Tier::Ai;
    }

    Tier::Automation
}

#[derive(Debug, Clone)]
pub struct SafeOutputBudget {
    pub kind: String,
    pub max: u32,
}

#[derive(Debug, Clone)]
pub struct PluginSpec {
    pub name: String,
    pub trigger: Trigger,
    pub tier: Tier,
    pub conditions: Option<Value>,
    pub safe_outputs: Vec<SafeOutputBudget>,
    pub rate_limit_per_hour: Option<u32>,
}

/// What an `automation`-tier plugin actually does. Handlers are pure,
/// deterministic functions of the event payload; they return the
/// safe-output kinds they want to emit so the runner can charge them
/// against budget before committing to a side effect.
pub trait AutomationHandler: Send + Sync {
    fn execute(&self, payload: &Value) -> Result<Vec<String>>;
}

pub struct PluginContext {
    pub repo_id: String,
    pub trigger: Trigger,
    pub payload: Value,
}

struct ExecutionRecord {
    at: DateTime<Utc>,
}

pub struct PluginRunner {
    db: Database,
    activity: ActivityLog,
    plugins: Vec<(PluginSpec, Option<Box<dyn AutomationHandler>>)>,
    // in-memory sliding-window counters; the durable record of fact is
    // `plugin_executions`, this is just a fast pre-check.
    recent_runs: Mutex<HashMap<String, Vec<ExecutionRecord>>>,
}

impl PluginRunner {
    pub fn new(db: Database) -> Self {
        Self {
            activity: ActivityLog::new(db.clone()),
            db,
            plugins: Vec::new(),
            recent_runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, spec: PluginSpec, handler: Option<Box<dyn AutomationHandler>>) {
        self.plugins.push((spec, handler));
    }

    /// Fires every plugin subscribed to `ctx.trigger`. Never propagates a
    /// plugin's own error into the caller: a broken plugin must not fail
    /// the host operation that triggered it.
    pub fn fire(&self, ctx: &PluginContext) -> Result<()> {
        if matches!(ctx.trigger, Trigger::ConsensusReached | Trigger::ConsensusBlocked)
            && self.consensus_event_already_fired(&ctx.repo_id, ctx.trigger)?
        {
            return Ok(());
        }

        for (spec, handler) in &self.plugins {
            if spec.trigger != ctx.trigger {
                continue;
            }

            if spec.tier.requires_remote() {
                self.record_execution(&ctx.repo_id, spec, "skipped_no_server")?;
                crate::log_debug!("plugins_skipped_no_server: {} ({:?})", spec.name, spec.tier);
                continue;
            }

            if !self.within_rate_limit(spec) {
                self.record_execution(&ctx.repo_id, spec, "rate_limited")?;
                self.activity.record(&ctx.repo_id, "plugin_blocked", json!({ "plugin": spec.name, "reason": "rate_limited" }))?;
                continue;
            }

            let Some(handler) = handler else {
                continue;
            };

            match handler.execute(&ctx.payload) {
                Ok(outputs) => {
                    if let Some(exceeded) = self.exceeds_budget(spec, &outputs) {
                        self.record_execution(&ctx.repo_id, spec, "budget_exhausted")?;
                        self.activity.record(
                            &ctx.repo_id,
                            "plugin_blocked",
                            json!({ "plugin": spec.name, "reason": "budget_exhausted", "kind": exceeded }),
                        )?;
                        continue;
                    }
                    self.record_execution(&ctx.repo_id, spec, "ok")?;
                    self.mark_executed(&spec.name);
                }
                Err(e) => {
                    self.record_execution(&ctx.repo_id, spec, "error")?;
                    self.activity.record(&ctx.repo_id, "plugin_error", json!({ "plugin": spec.name, "error": e.to_string() }))?;
                }
            }
        }

        if matches!(ctx.trigger, Trigger::ConsensusReached | Trigger::ConsensusBlocked) {
            self.mark_consensus_event(&ctx.repo_id, ctx.trigger)?;
        }

        Ok(())
    }

    fn exceeds_budget(&self, spec: &PluginSpec, outputs: &[String]) -> Option<String> {
        for budget in &spec.safe_outputs {
            let used = outputs.iter().filter(|o| **o == budget.kind).count() as u32;
            if used > budget.max {
                return Some(budget.kind.clone());
            }
        }
        None
    }

    fn within_rate_limit(&self, spec: &PluginSpec) -> bool {
        let Some(limit) = spec.rate_limit_per_hour else {
            return true;
        };
        let runs = self.recent_runs.lock().unwrap();
        let count = runs
            .get(&spec.name)
            .map(|v| v.iter().filter(|r| Utc::now().signed_duration_since(r.at).num_hours() < 1).count())
            .unwrap_or(0);
        (count as u32) < limit
    }

    fn mark_executed(&self, plugin_name: &str) {
        let mut runs = self.recent_runs.lock().unwrap();
        runs.entry(plugin_name.to_string()).or_default().push(ExecutionRecord { at: Utc::now() });
    }

    fn record_execution(&self, repo_id: &str, spec: &PluginSpec, status: &str) -> Result<()> {
        let table = self.db.table_name("plugin_executions");
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (repo_id, trigger, plugin, status, at, safe_outputs) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                rusqlite::params![
                    repo_id,
                    serde_json::to_string(&spec.trigger).unwrap_or_default(),
                    spec.name,
                    status,
                    Utc::now().to_rfc3339(),
                    "{}",
                ],
            )
        })?;
        Ok(())
    }

    /// `consensus_reached`/`consensus_blocked` must fire at most once per
    /// stream per hour; approximated here per-repo since the trigger
    /// context does not always carry a stream id.
    fn consensus_event_already_fired(&self, repo_id: &str, trigger: Trigger) -> Result<bool> {
        let table = self.db.table_name("activity_log");
        let kind = match trigger {
            Trigger::ConsensusReached => "consensus_reached",
            Trigger::ConsensusBlocked => "consensus_blocked",
            _ => return Ok(false),
        };
        let cutoff = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE repo_id = ?1 AND kind = ?2 AND at > ?3"),
                rusqlite::params![repo_id, kind, cutoff],
                |row| row.get(0),
            )
        })?;
        Ok(count > 0)
    }

    fn mark_consensus_event(&self, repo_id: &str, trigger: Trigger) -> Result<()> {
        let kind = match trigger {
            Trigger::ConsensusReached => "consensus_reached",
            Trigger::ConsensusBlocked => "consensus_blocked",
            _ => return Ok(()),
        };
        self.activity.record(repo_id, kind, json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysOk;
    impl AutomationHandler for AlwaysOk {
        fn execute(&self, _payload: &Value) -> Result<Vec<String>> {
            Ok(vec!["create-comment".to_string()])
        }
    }

    struct OverBudget;
    impl AutomationHandler for OverBudget {
        fn execute(&self, _payload: &Value) -> Result<Vec<String>> {
            Ok(vec!["create-comment".to_string(), "create-comment".to_string()])
        }
    }

    fn spec(trigger: Trigger) -> PluginSpec {
        PluginSpec {
            name: "notify".to_string(),
            trigger,
            tier: Tier::Automation,
            conditions: None,
            safe_outputs: vec![SafeOutputBudget { kind: "create-comment".to_string(), max: 1 }],
            rate_limit_per_hour: None,
        }
    }

    #[test]
    fn governance_tier_inferred_from_trigger_name() {
        let tier = infer_tier("autopromote", "gitswarm.consensus.reached", None, None);
        assert_eq!(tier, Tier::Governance);
    }

    #[test]
    fn ai_tier_inferred_from_engine() {
        let tier = infer_tier("summarize", "commit", Some("claude"), None);
        assert_eq!(tier, Tier::Ai);
    }

    #[test]
    fn automation_is_the_default() {
        let tier = infer_tier("format-on-merge", "stream_merged", None, None);
        assert_eq!(tier, Tier::Automation);
    }

    #[test]
    fn remote_tier_plugins_are_skipped_not_failed() {
        let db = Database::open_in_memory(false).unwrap();
        let mut runner = PluginRunner::new(db);
        let mut governance_spec = spec(Trigger::Commit);
        governance_spec.tier = Tier::Governance;
        runner.register(governance_spec, Some(Box::new(AlwaysOk)));

        let ctx = PluginContext { repo_id: "repo-1".to_string(), trigger: Trigger::Commit, payload: json!({}) };
        runner.fire(&ctx).unwrap();
    }

    #[test]
    fn budget_exhaustion_is_recorded_as_plugin_blocked() {
        let db = Database::open_in_memory(false).unwrap();
        let mut runner = PluginRunner::new(db);
        runner.register(spec(Trigger::Commit), Some(Box::new(OverBudget)));

        let ctx = PluginContext { repo_id: "repo-1".to_string(), trigger: Trigger::Commit, payload: json!({}) };
        runner.fire(&ctx).unwrap();
        let recent = runner.activity.recent("repo-1", 5).unwrap();
        assert!(recent.iter().any(|(kind, _, _)| kind == "plugin_blocked"));
    }
}
