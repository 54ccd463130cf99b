//! Embedded DDL for the GitSwarm policy schema.
//!
//! Applied idempotently with `CREATE TABLE IF NOT EXISTS` by
//! [`crate::context::FederationContext::open`] / `::init`. Table names here
//! are the *logical* names; [`super::table_name`] resolves them to their
//! physical, possibly `gitswarm_`-prefixed, equivalents at query time.

pub const LOGICAL_TABLES: &[&str] = &[
    "agents",
    "repos",
    "maintainers",
    "repo_access",
    "branch_rules",
    "streams",
    "stream_commits",
    "stream_reviews",
    "merges",
    "stabilizations",
    "promotions",
    "sync_queue",
    "stage_history",
    "activity_log",
    "plugin_executions",
    "merge_locks",
];

/// Renders the full schema against the physical names produced by
/// `resolver`.
pub fn render(resolver: impl Fn(&str) -> String) -> String {
    let t = resolver;
    format!(
        r"
CREATE TABLE IF NOT EXISTS {agents} (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    secret_hash TEXT NOT NULL,
    karma INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS {repos} (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    ownership_model TEXT NOT NULL DEFAULT 'solo',
    merge_mode TEXT NOT NULL DEFAULT 'review',
    consensus_threshold REAL NOT NULL DEFAULT 0.6,
    min_reviews INTEGER NOT NULL DEFAULT 1,
    human_review_weight REAL NOT NULL DEFAULT 1.5,
    buffer_branch TEXT NOT NULL DEFAULT 'buffer',
    promote_target TEXT NOT NULL DEFAULT 'main',
    stabilize_command TEXT,
    auto_promote_on_green INTEGER NOT NULL DEFAULT 0,
    auto_revert_on_red INTEGER NOT NULL DEFAULT 0,
    consensus_authority TEXT NOT NULL DEFAULT 'local',
    access_mode TEXT NOT NULL DEFAULT 'private',
    min_karma INTEGER NOT NULL DEFAULT 0,
    stage TEXT NOT NULL DEFAULT 'seed',
    contributor_count INTEGER NOT NULL DEFAULT 0,
    patch_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS {maintainers} (
    repo_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    role TEXT NOT NULL,
    PRIMARY KEY (repo_id, agent_id)
);

CREATE TABLE IF NOT EXISTS {repo_access} (
    repo_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    access_level TEXT NOT NULL,
    expires_at TEXT,
    PRIMARY KEY (repo_id, agent_id)
);

CREATE TABLE IF NOT EXISTS {branch_rules} (
    id TEXT PRIMARY KEY,
    repo_id TEXT NOT NULL,
    branch_pattern TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    direct_push TEXT NOT NULL DEFAULT 'maintainers',
    required_approvals INTEGER NOT NULL DEFAULT 0,
    require_tests_pass INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS {streams} (
    id TEXT PRIMARY KEY,
    repo_id TEXT NOT NULL,
    owner_agent_id TEXT NOT NULL,
    branch TEXT NOT NULL,
    base_branch TEXT NOT NULL,
    parent_stream_id TEXT,
    task TEXT,
    source TEXT NOT NULL DEFAULT 'cli',
    status TEXT NOT NULL DEFAULT 'active',
    review_status TEXT NOT NULL DEFAULT 'none',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS {stream_commits} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    commit_hash TEXT NOT NULL,
    change_id TEXT,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS {stream_reviews} (
    stream_id TEXT NOT NULL,
    reviewer_agent_id TEXT NOT NULL,
    verdict TEXT NOT NULL,
    feedback TEXT NOT NULL DEFAULT '',
    is_human INTEGER NOT NULL DEFAULT 0,
    tested INTEGER NOT NULL DEFAULT 0,
    reviewed_at TEXT NOT NULL,
    PRIMARY KEY (stream_id, reviewer_agent_id)
);

CREATE TABLE IF NOT EXISTS {merges} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id TEXT NOT NULL,
    stream_id TEXT NOT NULL UNIQUE,
    agent_id TEXT NOT NULL,
    merge_commit TEXT NOT NULL,
    target_branch TEXT NOT NULL,
    merged_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS {stabilizations} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id TEXT NOT NULL,
    result TEXT NOT NULL,
    tag TEXT,
    buffer_commit TEXT NOT NULL,
    breaking_stream_id TEXT,
    details TEXT NOT NULL DEFAULT '',
    at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS {promotions} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id TEXT NOT NULL,
    from_branch TEXT NOT NULL,
    to_branch TEXT NOT NULL,
    from_commit TEXT NOT NULL,
    to_commit TEXT NOT NULL,
    triggered_by TEXT NOT NULL,
    agent_id TEXT,
    at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS {sync_queue} (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS {stage_history} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    reason TEXT,
    at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS {activity_log} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{{}}',
    at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS {plugin_executions} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id TEXT NOT NULL,
    trigger TEXT NOT NULL,
    plugin TEXT NOT NULL,
    status TEXT NOT NULL,
    at TEXT NOT NULL,
    safe_outputs TEXT NOT NULL DEFAULT '{{}}'
);

CREATE TABLE IF NOT EXISTS {merge_locks} (
    repo_id TEXT PRIMARY KEY,
    holder_agent TEXT NOT NULL,
    worker_id TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);
",
        agents = t("agents"),
        repos = t("repos"),
        maintainers = t("maintainers"),
        repo_access = t("repo_access"),
        branch_rules = t("branch_rules"),
        streams = t("streams"),
        stream_commits = t("stream_commits"),
        stream_reviews = t("stream_reviews"),
        merges = t("merges"),
        stabilizations = t("stabilizations"),
        promotions = t("promotions"),
        sync_queue = t("sync_queue"),
        stage_history = t("stage_history"),
        activity_log = t("activity_log"),
        plugin_executions = t("plugin_executions"),
        merge_locks = t("merge_locks"),
    )
}
