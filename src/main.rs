use clap::Parser;
use gitswarm::cli::{AgentCommands, Cli, Commands, StageCommands, SyncCommands, WorkspaceCommands};
use gitswarm::context::InitOptions;
use gitswarm::error::exit_code_for;
use gitswarm::{commands, common, logger};

const LOG_FILE: &str = "gitswarm-debug.log";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.log {
        logger::enable_logging();
        if let Err(e) = logger::set_log_file(cli.log_file.as_deref().unwrap_or(LOG_FILE)) {
            eprintln!("failed to open log file: {e}");
        }
    } else {
        logger::disable_logging();
    }
    let _ = logger::init();

    if let Err(err) = run(cli.command).await {
        if !cli.quiet {
            common::print_error(&err.to_string());
        }
        std::process::exit(exit_code_for(&err));
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init { merge_mode, consensus_threshold, min_reviews, buffer_branch, promote_target, stabilize_command, owner_name } => {
            commands::handle_init(InitOptions { merge_mode, consensus_threshold, min_reviews, buffer_branch, promote_target, stabilize_command, owner_name })
        }
        Commands::Agent { action: AgentCommands::Register { name } } => commands::handle_agent_register(&name),
        Commands::Workspace { action: WorkspaceCommands::Create { agent, task, depends_on, name } } => {
            commands::handle_workspace_create(&agent, task, depends_on, name)
        }
        Commands::Commit { agent, message, stream } => commands::handle_commit(&stream, &agent, &message).await,
        Commands::Review { stream, agent, verdict, message, tested } => {
            commands::handle_review(&stream, &agent, &verdict, message, tested)
        }
        Commands::Merge { stream, agent } => commands::handle_merge(&stream, &agent).await,
        Commands::Stabilize => commands::handle_stabilize().await,
        Commands::Promote { tag, agent } => commands::handle_promote(tag, &agent),
        Commands::Stage { action: StageCommands::Check { repo } } => commands::handle_stage_check(&repo),
        Commands::Stage { action: StageCommands::Advance { repo, force } } => commands::handle_stage_advance(&repo, force),
        Commands::Connect { server, api_key, agent_id } => commands::handle_connect(&server, &api_key, &agent_id).await,
        Commands::Sync { action: SyncCommands::Flush } => commands::handle_sync_flush().await,
        Commands::Sync { action: SyncCommands::Poll } => commands::handle_sync_poll().await,
    }
}
