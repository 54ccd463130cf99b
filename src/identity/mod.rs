//! Identity & Karma Store (§3, §5 "Shared-resource policy").
//!
//! Agents are registered once and never deleted while referenced; karma is
//! mutated only through a single write path using an atomic SQL
//! `UPDATE karma = karma + delta`, never read-modify-write in application
//! code.

use crate::db::models::Agent;
use crate::db::Database;
use crate::error::{GitSwarmError, Result};
use chrono::Utc;
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Prefix every freshly minted API key carries, per the CLI surface spec.
pub const API_KEY_PREFIX: &str = "gsw_";

pub struct IdentityStore {
    db: Database,
}

/// Returned exactly once by [`IdentityStore::register`]; the caller must
/// display `api_key` to the operator immediately, since only its hash is
/// retained.
pub struct Registration {
    pub agent: Agent,
    pub api_key: String,
}

impl IdentityStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn table(&self) -> String {
        self.db.table_name("agents")
    }

    /// Registers a new agent, returning the plaintext API key exactly once.
    pub fn register(&self, name: &str) -> Result<Registration> {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(40)
            .map(char::from)
            .collect();
        let api_key = format!("{API_KEY_PREFIX}{suffix}");
        let secret_hash = hash_secret(&api_key);

        let agent = Agent {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            secret_hash,
            karma: 0,
            status: "active".to_string(),
            created_at: Utc::now().to_rfc3339(),
        };

        let table = self.table();
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (id, name, secret_hash, karma, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                rusqlite::params![
                    agent.id,
                    agent.name,
                    agent.secret_hash,
                    agent.karma,
                    agent.status,
                    agent.created_at,
                ],
            )
        })?;

        Ok(Registration { agent, api_key })
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Agent>> {
        let table = self.table();
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT id, name, secret_hash, karma, status, created_at FROM {table} WHERE id = ?1"
                ),
                [id],
                row_to_agent,
            )
            .map(Some)
            .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })
        })
    }

    pub fn require(&self, id: &str) -> Result<Agent> {
        self.find_by_id(id)?.ok_or(GitSwarmError::AgentNotFound)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<Agent>> {
        let table = self.table();
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT id, name, secret_hash, karma, status, created_at FROM {table} WHERE name = ?1"
                ),
                [name],
                row_to_agent,
            )
            .map(Some)
            .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })
        })
    }

    /// Authenticates a plaintext API key against the stored hash.
    pub fn authenticate(&self, api_key: &str) -> Result<Option<Agent>> {
        let hash = hash_secret(api_key);
        let table = self.table();
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT id, name, secret_hash, karma, status, created_at FROM {table} WHERE secret_hash = ?1"
                ),
                [hash],
                row_to_agent,
            )
            .map(Some)
            .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })
        })
    }

    /// The single write path for karma mutation. `delta` may be negative.
    pub fn adjust_karma(&self, agent_id: &str, delta: i64) -> Result<()> {
        let table = self.table();
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "UPDATE {table} SET karma = MAX(0, karma + ?1) WHERE id = ?2"
                ),
                rusqlite::params![delta, agent_id],
            )
        })?;
        if changed == 0 {
            return Err(GitSwarmError::AgentNotFound);
        }
        Ok(())
    }

    pub fn set_status(&self, agent_id: &str, status: &str) -> Result<()> {
        let table = self.table();
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE {table} SET status = ?1 WHERE id = ?2"),
                rusqlite::params![status, agent_id],
            )
        })?;
        Ok(())
    }
}

fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        secret_hash: row.get(2)?,
        karma: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Minimal hex encoding, avoiding a dedicated `hex` crate dependency for a
/// single call site.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        bytes.as_ref().iter().fold(String::new(), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> IdentityStore {
        IdentityStore::new(Database::open_in_memory(false).unwrap())
    }

    #[test]
    fn register_returns_key_once_and_hashes_it() {
        let store = store();
        let reg = store.register("alice").unwrap();
        assert!(reg.api_key.starts_with(API_KEY_PREFIX));
        assert_ne!(reg.agent.secret_hash, reg.api_key);
        assert_eq!(reg.agent.secret_hash.len(), 64);
    }

    #[test]
    fn authenticate_round_trips() {
        let store = store();
        let reg = store.register("bob").unwrap();
        let found = store.authenticate(&reg.api_key).unwrap().unwrap();
        assert_eq!(found.id, reg.agent.id);
        assert!(store.authenticate("gsw_wrong").unwrap().is_none());
    }

    #[test]
    fn karma_never_goes_negative_and_uses_single_writer_update() {
        let store = store();
        let reg = store.register("carol").unwrap();
        store.adjust_karma(&reg.agent.id, 5).unwrap();
        store.adjust_karma(&reg.agent.id, -100).unwrap();
        let agent = store.require(&reg.agent.id).unwrap();
        assert_eq!(agent.karma, 0);
    }
}
