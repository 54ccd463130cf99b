//! Command handlers: one function per [`crate::cli::Commands`] variant,
//! each opening or building a [`FederationContext`] and reporting the
//! outcome through [`crate::common`]'s print helpers.

use crate::common::{print_error, print_info, print_success, print_warning};
use crate::context::{ConnectOptions, FederationContext, InitOptions};
use crate::db::models::Verdict;
use crate::error::GitSwarmError;
use crate::git::get_repo_root;
use anyhow::Context;
use serde_json::json;
use std::str::FromStr;

fn here() -> anyhow::Result<std::path::PathBuf> {
    std::env::current_dir().context("could not determine the current directory")
}

pub fn handle_init(options: InitOptions) -> anyhow::Result<()> {
    let repo_root = get_repo_root().map_err(|e| GitSwarmError::BadConfig(e.to_string()))?;
    let (ctx, owner) = FederationContext::init(&repo_root, options)?;
    print_success(&format!("initialized gitswarm in {}", ctx.data_dir.display()));
    print_info("repo id", &ctx.repo_id);
    print_info("owner agent id", &owner.agent.id);
    print_info("owner api key", &owner.api_key);
    print_warning("this key is shown once; store it now");
    Ok(())
}

pub fn handle_agent_register(name: &str) -> anyhow::Result<()> {
    let ctx = FederationContext::open(&here()?)?;
    let registration = ctx.identity.register(name)?;
    print_success(&format!("registered agent '{name}'"));
    print_info("agent id", &registration.agent.id);
    print_info("api key", &registration.api_key);
    print_warning("this key is shown once; store it now");
    Ok(())
}

pub fn handle_workspace_create(
    agent: &str,
    task: Option<String>,
    depends_on: Option<String>,
    name: Option<String>,
) -> anyhow::Result<()> {
    let ctx = FederationContext::open(&here()?)?;
    let workspace = ctx.registry.create_workspace(crate::streams::CreateWorkspaceRequest {
        agent_id: agent.to_string(),
        task,
        depends_on,
        name,
    })?;
    print_success("workspace created");
    print_info("stream id", &workspace.stream_id);
    print_info("worktree", &workspace.worktree_path.display().to_string());
    Ok(())
}

pub async fn handle_commit(stream: &str, agent: &str, message: &str) -> anyhow::Result<()> {
    let ctx = FederationContext::open(&here()?)?;
    let report = ctx.commit(stream, agent, message).await?;
    ctx.plugins.fire(&crate::plugins::PluginContext {
        repo_id: ctx.repo_id.clone(),
        trigger: crate::plugins::Trigger::Commit,
        payload: json!({ "stream": stream, "agent": agent, "commit": report.outcome.commit }),
    })?;
    print_success("commit recorded");
    print_info("commit", &report.outcome.commit);
    print_info("change id", &report.outcome.change_id);
    if let Some(merge_error) = &report.merge_error {
        print_warning(&format!("swarm auto-merge failed: {merge_error}"));
    }
    Ok(())
}

pub fn handle_review(
    stream: &str,
    agent: &str,
    verdict: &str,
    message: Option<String>,
    tested: bool,
) -> anyhow::Result<()> {
    let ctx = FederationContext::open(&here()?)?;
    let verdict = match verdict {
        "reject" => Verdict::RequestChanges,
        other => Verdict::from_str(other).map_err(|_| GitSwarmError::InvalidVerdict)?,
    };

    let stream_record = ctx.registry.require(stream)?;
    let reviews = crate::streams::ReviewBook::new(ctx.db.clone());
    reviews.submit(
        stream,
        &stream_record.owner_agent_id,
        agent,
        verdict,
        message.as_deref().unwrap_or(""),
        true,
        tested,
    )?;

    if verdict == Verdict::RequestChanges {
        ctx.registry.reopen_for_changes(stream)?;
    }

    ctx.plugins.fire(&crate::plugins::PluginContext {
        repo_id: ctx.repo_id.clone(),
        trigger: crate::plugins::Trigger::ReviewSubmitted,
        payload: json!({ "stream": stream, "agent": agent, "verdict": verdict.as_str() }),
    })?;

    print_success(&format!("review recorded: {}", verdict.as_str()));
    Ok(())
}

pub async fn handle_merge(stream: &str, agent: &str) -> anyhow::Result<()> {
    let ctx = FederationContext::open(&here()?)?;
    let report = ctx.merge_orchestrator.merge_to_buffer(stream, agent).await?;
    ctx.plugins.fire(&crate::plugins::PluginContext {
        repo_id: ctx.repo_id.clone(),
        trigger: crate::plugins::Trigger::StreamMerged,
        payload: json!({ "stream": stream, "agent": agent, "commit": report.merge_commit }),
    })?;
    print_success("stream merged into the buffer");
    print_info("merge commit", &report.merge_commit);
    print_info("target branch", &report.target_branch);
    Ok(())
}

pub async fn handle_stabilize() -> anyhow::Result<()> {
    let ctx = FederationContext::open(&here()?)?;
    let report = ctx.stabilizer.stabilize().await?;
    let trigger = if report.result == crate::db::models::StabilizationResult::Green {
        crate::plugins::Trigger::StabilizationPassed
    } else {
        crate::plugins::Trigger::StabilizationFailed
    };
    ctx.plugins.fire(&crate::plugins::PluginContext {
        repo_id: ctx.repo_id.clone(),
        trigger,
        payload: json!({ "result": report.result.as_str(), "buffer_commit": report.buffer_commit }),
    })?;

    match report.result {
        crate::db::models::StabilizationResult::Green => {
            print_success("buffer is green");
            if let Some(tag) = &report.tag {
                print_info("tag", tag);
            }
        }
        crate::db::models::StabilizationResult::Red => {
            print_error("buffer is red");
            if let Some(stream_id) = &report.breaking_stream_id {
                print_info("reverted stream", stream_id);
            }
        }
    }
    Ok(())
}

pub fn handle_promote(tag: Option<String>, agent: &str) -> anyhow::Result<()> {
    let ctx = FederationContext::open(&here()?)?;
    let report = ctx.promoter.promote(tag.as_deref(), Some(agent))?;
    ctx.plugins.fire(&crate::plugins::PluginContext {
        repo_id: ctx.repo_id.clone(),
        trigger: crate::plugins::Trigger::Promote,
        payload: json!({ "to_commit": report.to_commit, "target_branch": report.target_branch }),
    })?;
    print_success(&format!("promoted onto {}", report.target_branch));
    print_info("from", &report.from_commit);
    print_info("to", &report.to_commit);
    Ok(())
}

pub fn handle_stage_check(repo: &str) -> anyhow::Result<()> {
    let ctx = FederationContext::open(&here()?)?;
    let repository = ctx.policy.repo(repo)?;
    let report = ctx.stage_engine.check_advancement_eligibility(repo, repository.stage)?;
    print_info("current stage", repository.stage.as_str());
    if report.eligible {
        print_success(&format!("eligible to advance to {}", report.next_stage.map(|s| s.as_str()).unwrap_or("-")));
    } else if report.unmet_requirements.is_empty() {
        print_info("status", "already at the top stage");
    } else {
        print_warning("not yet eligible to advance");
        for requirement in &report.unmet_requirements {
            print_info("unmet", requirement);
        }
    }
    Ok(())
}

pub fn handle_stage_advance(repo: &str, force: bool) -> anyhow::Result<()> {
    let ctx = FederationContext::open(&here()?)?;
    let repository = ctx.policy.repo(repo)?;
    match ctx.stage_engine.advance_stage(repo, repository.stage, force)? {
        Some(next) => print_success(&format!("advanced to {}", next.as_str())),
        None => print_warning("stage unchanged"),
    }
    Ok(())
}

pub async fn handle_connect(server: &str, api_key: &str, agent_id: &str) -> anyhow::Result<()> {
    let mut ctx = FederationContext::open(&here()?)?;
    ctx.connect_server(ConnectOptions {
        url: server.to_string(),
        api_key: api_key.to_string(),
        agent_id: agent_id.to_string(),
    })
    .await?;
    print_success(&format!("connected to {server}"));
    Ok(())
}

pub async fn handle_sync_flush() -> anyhow::Result<()> {
    let ctx = FederationContext::open(&here()?)?;
    let Some(client) = &ctx.sync_client else {
        print_warning("no coordinator connected; nothing to flush against");
        return Ok(());
    };
    let result = client.flush_queue(&ctx.queue).await?;
    print_success(&format!("flushed {} event(s)", result.flushed.len()));
    if !result.failed_types.is_empty() {
        print_warning(&format!("{} event(s) still pending: {:?}", result.failed_types.len(), result.failed_types));
    }
    Ok(())
}

pub async fn handle_sync_poll() -> anyhow::Result<()> {
    let mut ctx = FederationContext::open(&here()?)?;
    let Some(client) = ctx.sync_client.clone() else {
        print_warning("no coordinator connected; nothing to poll");
        return Ok(());
    };
    let since = ctx.local_config.last_poll.clone();
    let updates = client.poll_updates(&ctx.repo_id, since.as_deref()).await?;
    print_success(&format!("received {} update(s)", updates.len()));
    for update in &updates {
        print_info("update", &update.to_string());
    }
    ctx.local_config.last_poll = Some(chrono::Utc::now().to_rfc3339());
    ctx.local_config.save(&ctx.data_dir).map_err(|e| GitSwarmError::BadConfig(e.to_string()))?;
    Ok(())
}
