//! Buffer Merge Serializer (§4.3): mutual exclusion around the single
//! buffer branch, so two agents never merge into it concurrently (P5).
//!
//! Backed by a row in `merge_locks` rather than an OS file lock - the rest
//! of the core already treats the sqlite connection as the single source
//! of truth for cross-agent coordination state, and a CLI invocation has
//! no long-lived process to hold a `flock` across anyway.

use crate::db::Database;
use crate::error::{GitSwarmError, Result};
use chrono::{DateTime, Utc};

/// A lock is considered abandoned after this long with no release, so a
/// crashed holder can't wedge the buffer forever.
pub const STALE_AFTER_SECS: i64 = 120;

pub struct MergeLock<'a> {
    serializer: &'a BufferMergeSerializer,
    repo_id: String,
    released: bool,
}

impl<'a> Drop for MergeLock<'a> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.serializer.release(&self.repo_id);
        }
    }
}

pub struct BufferMergeSerializer {
    db: Database,
    worker_id: String,
}

impl BufferMergeSerializer {
    pub fn new(db: Database, worker_id: impl Into<String>) -> Self {
        Self {
            db,
            worker_id: worker_id.into(),
        }
    }

    fn table(&self) -> String {
        self.db.table_name("merge_locks")
    }

    /// Attempts to acquire the buffer lock for `repo_id` on behalf of
    /// `holder_agent`. Fails with [`GitSwarmError::LockHeld`] if someone
    /// else holds a non-stale lock.
    pub fn acquire(&self, repo_id: &str, holder_agent: &str) -> Result<MergeLock<'_>> {
        let table = self.table();
        let now = Utc::now();
        let acquired = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let existing: Option<(String, String)> = tx
                .query_row(
                    &format!("SELECT holder_agent, acquired_at FROM {table} WHERE repo_id = ?1"),
                    [repo_id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .map(Some)
                .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })?;

            if let Some((_, acquired_at)) = &existing {
                let age = DateTime::parse_from_rfc3339(acquired_at)
                    .map(|t| now.signed_duration_since(t).num_seconds())
                    .unwrap_or(i64::MAX);
                if age < STALE_AFTER_SECS {
                    return Ok(false);
                }
            }

            tx.execute(
                &format!(
                    "INSERT INTO {table} (repo_id, holder_agent, worker_id, acquired_at) VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(repo_id) DO UPDATE SET holder_agent = excluded.holder_agent, \
                     worker_id = excluded.worker_id, acquired_at = excluded.acquired_at"
                ),
                rusqlite::params![repo_id, holder_agent, self.worker_id, now.to_rfc3339()],
            )?;
            tx.commit()?;
            Ok(true)
        })?;

        if !acquired {
            return Err(GitSwarmError::LockHeld);
        }

        Ok(MergeLock {
            serializer: self,
            repo_id: repo_id.to_string(),
            released: false,
        })
    }

    fn release(&self, repo_id: &str) -> Result<()> {
        let table = self.table();
        self.db.with_conn(|conn| {
            conn.execute(&format!("DELETE FROM {table} WHERE repo_id = ?1"), [repo_id])
        })?;
        Ok(())
    }
}

impl MergeLock<'_> {
    pub fn release(mut self) {
        let _ = self.serializer.release(&self.repo_id);
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// P5: a second acquire attempt while the first lock is held fails.
    #[test]
    fn second_acquire_fails_while_held() {
        let db = Database::open_in_memory(false).unwrap();
        let serializer = BufferMergeSerializer::new(db, "worker-1");
        let _lock = serializer.acquire("repo-1", "alice").unwrap();
        let err = serializer.acquire("repo-1", "bob").unwrap_err();
        assert!(matches!(err, GitSwarmError::LockHeld));
    }

    #[test]
    fn release_allows_reacquire() {
        let db = Database::open_in_memory(false).unwrap();
        let serializer = BufferMergeSerializer::new(db, "worker-1");
        let lock = serializer.acquire("repo-1", "alice").unwrap();
        lock.release();
        assert!(serializer.acquire("repo-1", "bob").is_ok());
    }

    #[test]
    fn dropping_lock_without_explicit_release_still_frees_it() {
        let db = Database::open_in_memory(false).unwrap();
        let serializer = BufferMergeSerializer::new(db, "worker-1");
        {
            let _lock = serializer.acquire("repo-1", "alice").unwrap();
        }
        assert!(serializer.acquire("repo-1", "bob").is_ok());
    }

    #[test]
    fn stale_lock_is_reclaimable() {
        let db = Database::open_in_memory(false).unwrap();
        let table = db.table_name("merge_locks");
        let stale_at = (Utc::now() - chrono::Duration::seconds(STALE_AFTER_SECS + 10)).to_rfc3339();
        db.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO {table} (repo_id, holder_agent, worker_id, acquired_at) VALUES ('repo-1', 'alice', 'w0', ?1)"),
                [&stale_at],
            )
        })
        .unwrap();
        let serializer = BufferMergeSerializer::new(db, "worker-1");
        assert!(serializer.acquire("repo-1", "bob").is_ok());
    }
}
