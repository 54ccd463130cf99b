//! Configuration (§6 "Configuration"): a small local state file tracking
//! the remote coordinator connection, and two repo-embedded YAML files
//! (`.gitswarm/config.yml`, `.gitswarm/plugins.yml`) that seed the policy
//! tables on [`crate::context::FederationContext::open`].

use crate::log_debug;
use crate::plugins::{infer_tier, Tier, Trigger};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use std::fs;
use std::path::{Path, PathBuf};

pub const LOCAL_CONFIG_FILENAME: &str = "config.json";
pub const REPO_CONFIG_FILENAME: &str = "gitswarm.yml";
pub const PLUGINS_FILENAME: &str = "gitswarm-plugins.yml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConnection {
    pub url: String,
    #[serde(rename = "agentId")]
    pub agent_id: String,
}

/// Process-wide local state: which coordinator (if any) this checkout is
/// connected to, and the last successful sync/poll timestamps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default)]
    pub server: Option<ServerConnection>,
    #[serde(rename = "_lastSync", default)]
    pub last_sync: Option<String>,
    #[serde(rename = "_lastPoll", default)]
    pub last_poll: Option<String>,
}

impl LocalConfig {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(LOCAL_CONFIG_FILENAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&content).with_context(|| format!("Invalid {LOCAL_CONFIG_FILENAME} format"))?;
        Ok(config)
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join(LOCAL_CONFIG_FILENAME);
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)?;
        log_debug!("Local configuration saved to {}", path.display());
        Ok(())
    }
}

/// Repo-embedded settings, loaded from `.gitswarm/gitswarm.yml` at the
/// repository root and applied onto the policy tables idempotently.
/// Loose coercion: booleans and numbers may arrive as strings from a
/// hand-edited YAML file.
#[derive(Debug, Clone, Default)]
pub struct RepoConfig {
    pub merge_mode: Option<String>,
    pub consensus_threshold: Option<f64>,
    pub min_reviews: Option<i64>,
    pub human_review_weight: Option<f64>,
    pub buffer_branch: Option<String>,
    pub promote_target: Option<String>,
    pub auto_promote_on_green: Option<bool>,
    pub auto_revert_on_red: Option<bool>,
    pub stabilize_command: Option<String>,
    pub plugins_enabled: Option<bool>,
}

impl RepoConfig {
    pub fn load(repo_root: &Path) -> Result<Option<Self>> {
        let path = repo_root.join(".gitswarm").join(REPO_CONFIG_FILENAME);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let raw: YamlValue = serde_yaml::from_str(&content).with_context(|| format!("Invalid YAML in {}", path.display()))?;
        Ok(Some(Self::from_yaml(&raw)))
    }

    fn from_yaml(raw: &YamlValue) -> Self {
        Self {
            merge_mode: field_str(raw, "merge_mode"),
            consensus_threshold: field_f64(raw, "consensus_threshold"),
            min_reviews: field_i64(raw, "min_reviews"),
            human_review_weight: field_f64(raw, "human_review_weight"),
            buffer_branch: field_str(raw, "buffer_branch"),
            promote_target: field_str(raw, "promote_target"),
            auto_promote_on_green: field_bool(raw, "auto_promote_on_green"),
            auto_revert_on_red: field_bool(raw, "auto_revert_on_red"),
            stabilize_command: field_str(raw, "stabilize_command"),
            plugins_enabled: field_bool(raw, "plugins_enabled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PluginFileEntry {
    pub name: String,
    pub enabled: bool,
    pub trigger: Trigger,
    pub tier: Tier,
    pub conditions: Option<YamlValue>,
    pub actions: Vec<String>,
    pub safe_outputs: Vec<(String, u32)>,
    pub engine: Option<String>,
    pub model: Option<String>,
}

pub fn load_plugin_file(repo_root: &Path) -> Result<Vec<PluginFileEntry>> {
    let path = repo_root.join(".gitswarm").join(PLUGINS_FILENAME);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let raw: YamlValue = serde_yaml::from_str(&content).with_context(|| format!("Invalid YAML in {}", path.display()))?;

    let YamlValue::Mapping(top) = raw else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::new();
    for (key, value) in top {
        let YamlValue::String(name) = key else { continue };
        let trigger_raw = field_str(&value, "trigger").unwrap_or_default();
        let Some(trigger) = parse_trigger(&trigger_raw) else {
            log_debug!("plugin {name} has unrecognized trigger {trigger_raw}, skipping");
            continue;
        };
        let engine = field_str(&value, "engine");
        let model = field_str(&value, "model");
        let tier = infer_tier(&name, &trigger_raw, engine.as_deref(), model.as_deref());

        let actions = value
            .get("actions")
            .and_then(YamlValue::as_sequence)
            .map(|seq| seq.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let safe_outputs = value
            .get("safe_outputs")
            .and_then(YamlValue::as_mapping)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| {
                        let kind = k.as_str()?.to_string();
                        let max = v.get("max").and_then(YamlValue::as_u64).unwrap_or(1) as u32;
                        Some((kind, max))
                    })
                    .collect()
            })
            .unwrap_or_default();

        entries.push(PluginFileEntry {
            name,
            enabled: field_bool(&value, "enabled").unwrap_or(true),
            trigger,
            tier,
            conditions: value.get("conditions").cloned(),
            actions,
            safe_outputs,
            engine,
            model,
        });
    }
    Ok(entries)
}

fn parse_trigger(raw: &str) -> Option<Trigger> {
    match raw {
        "stream_created" => Some(Trigger::StreamCreated),
        "commit" => Some(Trigger::Commit),
        "review_submitted" => Some(Trigger::ReviewSubmitted),
        "stream_merged" => Some(Trigger::StreamMerged),
        "stabilization_passed" => Some(Trigger::StabilizationPassed),
        "stabilization_failed" => Some(Trigger::StabilizationFailed),
        "consensus_reached" => Some(Trigger::ConsensusReached),
        "consensus_blocked" => Some(Trigger::ConsensusBlocked),
        "promote" => Some(Trigger::Promote),
        other if other.starts_with("gitswarm.") => parse_trigger(other.trim_start_matches("gitswarm.")),
        _ => None,
    }
}

fn field_str(raw: &YamlValue, key: &str) -> Option<String> {
    match raw.get(key)? {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn field_bool(raw: &YamlValue, key: &str) -> Option<bool> {
    match raw.get(key)? {
        YamlValue::Bool(b) => Some(*b),
        YamlValue::String(s) => match s.to_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        YamlValue::Number(n) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}

fn field_f64(raw: &YamlValue, key: &str) -> Option<f64> {
    match raw.get(key)? {
        YamlValue::Number(n) => n.as_f64(),
        YamlValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn field_i64(raw: &YamlValue, key: &str) -> Option<i64> {
    match raw.get(key)? {
        YamlValue::Number(n) => n.as_i64(),
        YamlValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Default data-directory layout root, `<repo>/.gitswarm`.
pub fn data_dir_for(repo_root: &Path) -> PathBuf {
    repo_root.join(".gitswarm")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_config_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = LocalConfig {
            server: Some(ServerConnection { url: "https://example.test".into(), agent_id: "agent-1".into() }),
            last_sync: Some("2026-01-01T00:00:00Z".into()),
            last_poll: None,
        };
        config.save(dir.path()).unwrap();
        let loaded = LocalConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.server.unwrap().agent_id, "agent-1");
    }

    #[test]
    fn repo_config_coerces_string_booleans() {
        let raw: YamlValue = serde_yaml::from_str("auto_promote_on_green: \"true\"\nmin_reviews: \"2\"").unwrap();
        let config = RepoConfig::from_yaml(&raw);
        assert_eq!(config.auto_promote_on_green, Some(true));
        assert_eq!(config.min_reviews, Some(2));
    }

    #[test]
    fn plugin_file_infers_governance_tier() {
        let dir = tempfile::tempdir().unwrap();
        let gitswarm_dir = dir.path().join(".gitswarm");
        fs::create_dir_all(&gitswarm_dir).unwrap();
        fs::write(
            gitswarm_dir.join(PLUGINS_FILENAME),
            "karma-fast-track:\n  trigger: stream_merged\n  actions: [\"adjust-karma\"]\n",
        )
        .unwrap();
        let entries = load_plugin_file(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tier, Tier::Governance);
    }
}
