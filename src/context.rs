//! Federation Context (§4.10): the process-lifetime bundle every command
//! handler operates through — storage, the git adapter, the policy
//! engine, the stream registry, the merge serializer/orchestrator, the
//! stabilizer, promoter, sync client, and the plugin runner.

use crate::config::{self, LocalConfig, RepoConfig};
use crate::db::Database;
use crate::error::{GitSwarmError, Result};
use crate::git::{get_repo_root, GitAdapter, LibGitAdapter};
use crate::identity::IdentityStore;
use crate::log_debug;
use crate::merge::{BufferMergeSerializer, MergeOrchestrator};
use crate::plugins::PluginRunner;
use crate::policy::PolicyEngine;
use crate::promote::Promoter;
use crate::stabilize::Stabilizer;
use crate::stage::StageEngine;
use crate::streams::StreamRegistry;
use crate::sync::{EventQueue, HttpSyncClient, SyncClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub const DATA_DIR_NAME: &str = ".gitswarm";
pub const DB_FILENAME: &str = "policy.sqlite3";

#[derive(Default)]
pub struct InitOptions {
    pub merge_mode: Option<String>,
    pub consensus_threshold: Option<f64>,
    pub min_reviews: Option<i64>,
    pub buffer_branch: Option<String>,
    pub promote_target: Option<String>,
    pub stabilize_command: Option<String>,
    /// Display name for the bootstrap owner agent registered during
    /// `init`; every freshly-created repo starts in `access_mode: private`
    /// with no maintainers, so without this nobody could ever become one.
    pub owner_name: Option<String>,
}

pub struct ConnectOptions {
    pub url: String,
    pub api_key: String,
    pub agent_id: String,
}

pub struct CommitReport {
    pub outcome: crate::git::CommitOutcome,
    /// Set when swarm mode's auto-merge-on-commit failed; the commit
    /// itself still stands.
    pub merge_error: Option<String>,
}

/// Bundles every component a command needs, wired against a single
/// repo's data directory.
pub struct FederationContext {
    pub repo_id: String,
    pub repo_root: PathBuf,
    pub data_dir: PathBuf,
    pub db: Database,
    pub git: Arc<dyn GitAdapter>,
    pub policy: Arc<PolicyEngine>,
    pub identity: IdentityStore,
    pub registry: Arc<StreamRegistry>,
    pub serializer: BufferMergeSerializer,
    pub merge_orchestrator: MergeOrchestrator,
    pub stabilizer: Stabilizer,
    pub promoter: Promoter,
    pub stage_engine: StageEngine,
    pub plugins: PluginRunner,
    pub queue: EventQueue,
    pub sync_client: Option<Arc<dyn SyncClient>>,
    pub local_config: LocalConfig,
}

impl FederationContext {
    /// Walks up from `start_path` to find a `.gitswarm` data directory and
    /// opens a context against it.
    pub fn open(start_path: &Path) -> Result<Self> {
        let repo_root = get_repo_root().map_err(|e| GitSwarmError::BadConfig(e.to_string()))?;
        let data_dir = config::data_dir_for(&repo_root);
        if !data_dir.exists() {
            return Err(GitSwarmError::BadConfig(format!(
                "{} is not a gitswarm-initialized repository (run `gitswarm init`)",
                start_path.display()
            )));
        }
        Self::open_at(&repo_root, &data_dir)
    }

    /// Initializes a brand-new `.gitswarm` data directory at `repo_root`,
    /// registers the repository row using `options`, and bootstraps an
    /// owner agent so the repository isn't born with nobody able to
    /// write to it. Returns the context alongside that agent's one-time
    /// API key.
    pub fn init(repo_root: &Path, options: InitOptions) -> Result<(Self, crate::identity::Registration)> {
        let data_dir = config::data_dir_for(repo_root);
        std::fs::create_dir_all(&data_dir)?;

        let db = Database::open(&data_dir.join(DB_FILENAME), false)?;
        let repo_id = Uuid::new_v4().to_string();
        let owner_name = options.owner_name.clone().unwrap_or_else(|| "owner".to_string());
        insert_repo_row(&db, &repo_id, repo_root, &options)?;

        let local_config = LocalConfig::default();
        local_config.save(&data_dir)?;

        let ctx = Self::assemble(repo_id.clone(), repo_root.to_path_buf(), data_dir, db, local_config)?;
        let registration = ctx.identity.register(&owner_name)?;
        insert_maintainer_row(&ctx.db, &repo_id, &registration.agent.id)?;

        Ok((ctx, registration))
    }

    fn open_at(repo_root: &Path, data_dir: &Path) -> Result<Self> {
        let db = Database::open(&data_dir.join(DB_FILENAME), false)?;
        let repo_id = repo_id_for(&db)?;
        let local_config = LocalConfig::load(data_dir).map_err(|e| GitSwarmError::BadConfig(e.to_string()))?;

        let mut ctx = Self::assemble(repo_id, repo_root.to_path_buf(), data_dir.to_path_buf(), db, local_config)?;
        ctx.apply_repo_embedded_config()?;
        ctx.restore_sync_client()?;
        ctx.warn_about_remote_plugins();
        Ok(ctx)
    }

    fn assemble(repo_id: String, repo_root: PathBuf, data_dir: PathBuf, db: Database, local_config: LocalConfig) -> Result<Self> {
        let git: Arc<dyn GitAdapter> = Arc::new(LibGitAdapter::open(&repo_root, &data_dir)?);
        let policy = Arc::new(PolicyEngine::new(db.clone()));
        let registry = Arc::new(StreamRegistry::new(&repo_id, db.clone(), policy.clone(), git.clone()));
        let worker_id = Uuid::new_v4().to_string();

        Ok(Self {
            identity: IdentityStore::new(db.clone()),
            serializer: BufferMergeSerializer::new(db.clone(), worker_id.clone()),
            merge_orchestrator: MergeOrchestrator::new(
                &repo_id,
                db.clone(),
                policy.clone(),
                registry.clone(),
                git.clone(),
                worker_id,
                None,
            ),
            stabilizer: Stabilizer::new(&repo_id, db.clone(), policy.clone(), git.clone(), registry.clone()),
            promoter: Promoter::new(&repo_id, db.clone(), policy.clone(), git.clone()),
            stage_engine: StageEngine::new(db.clone()),
            plugins: PluginRunner::new(db.clone()),
            queue: EventQueue::new(db.clone()),
            repo_id,
            repo_root,
            data_dir,
            db,
            git,
            policy,
            registry,
            sync_client: None,
            local_config,
        })
    }

    fn apply_repo_embedded_config(&self) -> Result<()> {
        let Some(repo_config) = RepoConfig::load(&self.repo_root).map_err(|e| GitSwarmError::BadConfig(e.to_string()))? else {
            return Ok(());
        };

        let repos_table = self.db.table_name("repos");
        self.db.with_conn(|conn| {
            if let Some(mode) = &repo_config.merge_mode {
                conn.execute(&format!("UPDATE {repos_table} SET merge_mode = ?1 WHERE id = ?2"), rusqlite::params![mode, self.repo_id])?;
            }
            if let Some(threshold) = repo_config.consensus_threshold {
                conn.execute(&format!("UPDATE {repos_table} SET consensus_threshold = ?1 WHERE id = ?2"), rusqlite::params![threshold, self.repo_id])?;
            }
            if let Some(min_reviews) = repo_config.min_reviews {
                conn.execute(&format!("UPDATE {repos_table} SET min_reviews = ?1 WHERE id = ?2"), rusqlite::params![min_reviews, self.repo_id])?;
            }
            if let Some(weight) = repo_config.human_review_weight {
                conn.execute(&format!("UPDATE {repos_table} SET human_review_weight = ?1 WHERE id = ?2"), rusqlite::params![weight, self.repo_id])?;
            }
            if let Some(branch) = &repo_config.buffer_branch {
                conn.execute(&format!("UPDATE {repos_table} SET buffer_branch = ?1 WHERE id = ?2"), rusqlite::params![branch, self.repo_id])?;
            }
            if let Some(target) = &repo_config.promote_target {
                conn.execute(&format!("UPDATE {repos_table} SET promote_target = ?1 WHERE id = ?2"), rusqlite::params![target, self.repo_id])?;
            }
            if let Some(auto_promote) = repo_config.auto_promote_on_green {
                conn.execute(&format!("UPDATE {repos_table} SET auto_promote_on_green = ?1 WHERE id = ?2"), rusqlite::params![auto_promote as i64, self.repo_id])?;
            }
            if let Some(auto_revert) = repo_config.auto_revert_on_red {
                conn.execute(&format!("UPDATE {repos_table} SET auto_revert_on_red = ?1 WHERE id = ?2"), rusqlite::params![auto_revert as i64, self.repo_id])?;
            }
            if let Some(command) = &repo_config.stabilize_command {
                conn.execute(&format!("UPDATE {repos_table} SET stabilize_command = ?1 WHERE id = ?2"), rusqlite::params![command, self.repo_id])?;
            }
            Ok(())
        })?;
        Ok(())
    }

    fn restore_sync_client(&mut self) -> Result<()> {
        let Some(server) = &self.local_config.server else {
            return Ok(());
        };
        let client: Arc<dyn SyncClient> = Arc::new(HttpSyncClient::new(server.url.clone(), server.agent_id.clone()));
        self.merge_orchestrator.set_sync_client(Some(client.clone()));
        self.sync_client = Some(client);
        Ok(())
    }

    fn warn_about_remote_plugins(&self) {
        let Ok(entries) = config::load_plugin_file(&self.repo_root) else {
            return;
        };
        let remote_only: Vec<_> = entries.iter().filter(|e| e.enabled && e.tier.requires_remote()).map(|e| e.name.clone()).collect();
        if !remote_only.is_empty() && self.sync_client.is_none() {
            log_debug!("plugins requiring a remote coordinator are declared but no server is connected: {remote_only:?}");
        }
    }

    /// §4.2 commit contract: records the commit, then under swarm mode
    /// immediately attempts to merge the stream into the buffer (S1). A
    /// merge failure surfaces as `merge_error` on the report but never
    /// undoes the commit that already landed.
    pub async fn commit(&self, stream_id: &str, agent_id: &str, message: &str) -> Result<CommitReport> {
        let outcome = self.registry.commit(stream_id, agent_id, message)?;
        let repo = self.policy.repo(&self.repo_id)?;
        let merge_error = if repo.merge_mode == crate::db::models::MergeMode::Swarm {
            self.merge_orchestrator.merge_to_buffer(stream_id, agent_id).await.err().map(|e| e.to_string())
        } else {
            None
        };
        Ok(CommitReport { outcome, merge_error })
    }

    /// `connectServer`: persists the connection, flips consensus
    /// authority to the server so local merge paths stop answering
    /// consensus questions themselves, and flushes anything queued while
    /// offline.
    pub async fn connect_server(&mut self, options: ConnectOptions) -> Result<()> {
        let client = HttpSyncClient::new(options.url.clone(), options.api_key.clone());
        client.ping().await?;

        self.local_config.server = Some(crate::config::ServerConnection { url: options.url, agent_id: options.agent_id });
        self.local_config.save(&self.data_dir).map_err(|e| GitSwarmError::BadConfig(e.to_string()))?;

        let repos_table = self.db.table_name("repos");
        self.db.with_conn(|conn| {
            conn.execute(&format!("UPDATE {repos_table} SET consensus_authority = 'server' WHERE id = ?1"), rusqlite::params![self.repo_id])
        })?;

        let sync_client: Arc<dyn SyncClient> = Arc::new(client);
        sync_client.flush_queue(&self.queue).await?;
        self.merge_orchestrator.set_sync_client(Some(sync_client.clone()));
        self.sync_client = Some(sync_client);
        Ok(())
    }
}

fn insert_maintainer_row(db: &Database, repo_id: &str, agent_id: &str) -> Result<()> {
    let table = db.table_name("maintainers");
    db.with_conn(|conn| {
        conn.execute(
            &format!("INSERT INTO {table} (repo_id, agent_id, role) VALUES (?1, ?2, 'owner')"),
            rusqlite::params![repo_id, agent_id],
        )
    })?;
    Ok(())
}

fn repo_id_for(db: &Database) -> Result<String> {
    let table = db.table_name("repos");
    db.with_conn(|conn| conn.query_row(&format!("SELECT id FROM {table} LIMIT 1"), [], |row| row.get(0)))
}

fn insert_repo_row(db: &Database, repo_id: &str, repo_root: &Path, options: &InitOptions) -> Result<()> {
    let display_name = repo_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repository".to_string());

    let table = db.table_name("repos");
    db.with_conn(|conn| {
        conn.execute(
            &format!(
                "INSERT INTO {table} (id, display_name, merge_mode, consensus_threshold, min_reviews, buffer_branch, promote_target, stabilize_command) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            rusqlite::params![
                repo_id,
                display_name,
                options.merge_mode.clone().unwrap_or_else(|| "review".to_string()),
                options.consensus_threshold.unwrap_or(0.6),
                options.min_reviews.unwrap_or(1),
                options.buffer_branch.clone().unwrap_or_else(|| "buffer".to_string()),
                options.promote_target.clone().unwrap_or_else(|| "main".to_string()),
                options.stabilize_command,
            ],
        )
    })?;
    Ok(())
}
