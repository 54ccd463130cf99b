//! Command-line surface (§6 "CLI Surface"): argument parsing only. Every
//! subcommand here is a thin shell around [`crate::commands`], which talks
//! to a [`crate::context::FederationContext`].

use clap::builder::{styling::AnsiColor, Styles};
use clap::{Parser, Subcommand};

/// GitSwarm: coordinates many autonomous agents collaborating on a single
/// git repository through isolated streams and a stabilize/promote
/// pipeline.
#[derive(Parser)]
#[command(author, version, about, long_about = None, styles = get_styles())]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log debug messages to a file
    #[arg(short = 'l', long = "log", global = true, help = "Log debug messages to a file")]
    pub log: bool,

    /// Specify a custom log file path
    #[arg(long = "log-file", global = true, help = "Specify a custom log file path")]
    pub log_file: Option<String>,

    /// Suppress non-essential output
    #[arg(short = 'q', long = "quiet", global = true, help = "Suppress non-essential output")]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a `.gitswarm` policy store in the current repository
    Init {
        /// Merge policy: review, swarm, or gated
        #[arg(long)]
        merge_mode: Option<String>,

        /// Fraction of weighted approvals required for swarm consensus
        #[arg(long)]
        consensus_threshold: Option<f64>,

        /// Minimum number of reviews required before a merge is eligible
        #[arg(long)]
        min_reviews: Option<i64>,

        /// Integration branch streams merge into
        #[arg(long)]
        buffer_branch: Option<String>,

        /// Branch promotions land on
        #[arg(long)]
        promote_target: Option<String>,

        /// Shell command run by `gitswarm stabilize` against the buffer
        #[arg(long)]
        stabilize_command: Option<String>,

        /// Display name for the bootstrap owner agent (defaults to "owner")
        #[arg(long)]
        owner_name: Option<String>,
    },

    /// Manage agent identities
    Agent {
        #[command(subcommand)]
        action: AgentCommands,
    },

    /// Manage isolated work streams
    Workspace {
        #[command(subcommand)]
        action: WorkspaceCommands,
    },

    /// Record a commit on a stream
    Commit {
        /// Agent committing the change
        #[arg(long)]
        agent: String,

        /// Commit message
        #[arg(short = 'm', long)]
        message: String,

        /// Stream to commit to
        #[arg(long)]
        stream: String,
    },

    /// Submit a review verdict for a stream
    Review {
        /// Stream under review
        #[arg(long)]
        stream: String,

        /// Reviewing agent
        #[arg(long)]
        agent: String,

        /// approve, request_changes (or reject), or comment
        #[arg(long)]
        verdict: String,

        /// Optional review feedback
        #[arg(short = 'm', long)]
        message: Option<String>,

        /// Mark that the reviewer actually ran the change
        #[arg(long)]
        tested: bool,
    },

    /// Merge a stream into the integration buffer
    Merge {
        /// Stream to merge
        #[arg(long)]
        stream: String,

        /// Agent requesting the merge
        #[arg(long)]
        agent: String,
    },

    /// Run the stabilize command against the buffer branch
    Stabilize,

    /// Promote the buffer (or a green tag) onto the release branch
    Promote {
        /// Promote a specific green tag instead of the current buffer tip
        #[arg(long)]
        tag: Option<String>,

        /// Maintainer agent requesting the promotion (required; manual
        /// promotion always requires maintainer-level access)
        #[arg(long)]
        agent: String,
    },

    /// Check or advance a repository's maturity stage
    Stage {
        #[command(subcommand)]
        action: StageCommands,
    },

    /// Connect this checkout to a remote coordinator
    Connect {
        /// Coordinator base URL
        #[arg(long)]
        server: String,

        /// API key issued by `gitswarm agent register`
        #[arg(long)]
        api_key: String,

        /// This checkout's agent id
        #[arg(long)]
        agent_id: String,
    },

    /// Offline queue operations against the remote coordinator
    Sync {
        #[command(subcommand)]
        action: SyncCommands,
    },
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Register a new agent identity and print its one-time API key
    Register {
        /// Display name for the agent
        name: String,
    },
}

#[derive(Subcommand)]
pub enum WorkspaceCommands {
    /// Create a new isolated stream and worktree
    Create {
        /// Owning agent
        #[arg(long)]
        agent: String,

        /// Freeform description of what this stream is for
        #[arg(long)]
        task: Option<String>,

        /// Parent stream this one forks from
        #[arg(long)]
        depends_on: Option<String>,

        /// Stream name (defaults to a generated one)
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum StageCommands {
    /// Report whether a repository is eligible to advance
    Check {
        /// Repository id
        #[arg(long)]
        repo: String,
    },

    /// Advance a repository's stage if it's eligible
    Advance {
        /// Repository id
        #[arg(long)]
        repo: String,

        /// Advance even if the thresholds aren't met
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Drain the offline event queue to the connected coordinator
    Flush,

    /// Poll the coordinator for updates since the last sync
    Poll,
}

fn get_styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Magenta.on_default().bold())
        .usage(AnsiColor::Cyan.on_default().bold())
        .literal(AnsiColor::Green.on_default().bold())
        .placeholder(AnsiColor::Yellow.on_default())
        .valid(AnsiColor::Blue.on_default().bold())
        .invalid(AnsiColor::Red.on_default().bold())
        .error(AnsiColor::Red.on_default().bold())
}

/// Parse the command-line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}
