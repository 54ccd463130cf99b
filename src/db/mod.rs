//! Persistence abstraction (§4.11): a single `query` contract over a
//! logical-name → physical-name table map, so the same code works against
//! either the prefixed (`gitswarm_*`) or unprefixed schema.
//!
//! The underlying connection is `rusqlite` (the embedded-storage crate
//! this reference pack reaches for — see `rand-mnemosyne`,
//! `tobert-kaijutsu`, `laynepenney-codi-rs`). The CLI is single-process,
//! so a single pooled connection behind a `parking_lot::Mutex` (already a
//! teacher dependency) is sufficient; sync flush/poll tasks and
//! interactive commands briefly contend for it rather than each holding a
//! dedicated connection.

pub mod models;
pub mod schema;

use crate::error::{GitSwarmError, Result};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

/// Result of a [`Database::query`] call: either selected rows or the
/// number of rows a write statement touched.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub rows: Vec<Vec<SqlValue>>,
    pub changes: Option<usize>,
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    prefixed: bool,
}

impl Database {
    /// Opens (creating if absent) the sqlite database at `path` and applies
    /// the schema idempotently.
    pub fn open(path: &Path, prefixed: bool) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            prefixed,
        };
        db.apply_schema()?;
        Ok(db)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory(prefixed: bool) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            prefixed,
        };
        db.apply_schema()?;
        Ok(db)
    }

    fn apply_schema(&self) -> Result<()> {
        let ddl = schema::render(|logical| self.table_name(logical));
        self.conn.lock().execute_batch(&ddl)?;
        Ok(())
    }

    /// Resolves a logical table name to its physical name.
    pub fn table_name(&self, logical: &str) -> String {
        if self.prefixed {
            format!("gitswarm_{logical}")
        } else {
            logical.to_string()
        }
    }

    /// Rewrites `$1`, `$2`, ... placeholders in `sql` to `?` and returns the
    /// positional-bind SQL. Parameters are already caller-ordered to match,
    /// so no reordering is necessary for SQLite's sequential binding.
    fn to_sequential(sql: &str) -> String {
        let mut out = String::with_capacity(sql.len());
        let mut chars = sql.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '$' && chars.peek().is_some_and(char::is_ascii_digit) {
                while chars.peek().is_some_and(char::is_ascii_digit) {
                    chars.next();
                }
                out.push('?');
            } else {
                out.push(c);
            }
        }
        out
    }

    /// Executes `sql_with_positional_params` (`$1`, `$2`, ... placeholders)
    /// with `params`, returning either the selected rows or the number of
    /// rows changed. Table names inside `sql` should already be resolved via
    /// [`Self::table_name`] by the caller.
    pub fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<QueryResult> {
        let sql = Self::to_sequential(sql);
        let conn = self.conn.lock();
        let trimmed = sql.trim_start().to_ascii_lowercase();
        if trimmed.starts_with("select") || trimmed.starts_with("with") {
            let mut stmt = conn.prepare(&sql)?;
            let col_count = stmt.column_count();
            let rows = stmt
                .query_map(params, |row| {
                    (0..col_count).map(|i| row.get::<_, SqlValue>(i)).collect()
                })?
                .collect::<std::result::Result<Vec<Vec<SqlValue>>, rusqlite::Error>>()?;
            Ok(QueryResult {
                rows,
                changes: None,
            })
        } else {
            let changes = conn.execute(&sql, params)?;
            Ok(QueryResult {
                rows: Vec::new(),
                changes: Some(changes),
            })
        }
    }

    /// Direct access to the underlying connection for call sites that need
    /// transactions or typed row mapping beyond the generic `query`
    /// contract (every component below uses this rather than hand-rolling
    /// SQL string building for every statement).
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        f(&self.conn.lock()).map_err(GitSwarmError::from)
    }

    pub fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        f(&mut self.conn.lock()).map_err(GitSwarmError::from)
    }
}

/// Shared row mapper for the `repos` table, used by every component that
/// loads a [`models::Repository`] (policy engine, stream registry, merge
/// orchestrator, stabilizer, promoter, stage engine).
pub fn row_to_repository(row: &rusqlite::Row<'_>) -> rusqlite::Result<models::Repository> {
    use models::{AccessMode, ConsensusAuthority, MergeMode, OwnershipModel, Stage};
    Ok(models::Repository {
        id: row.get(0)?,
        display_name: row.get(1)?,
        ownership_model: row
            .get::<_, String>(2)?
            .parse()
            .unwrap_or(OwnershipModel::Solo),
        merge_mode: row.get::<_, String>(3)?.parse().unwrap_or(MergeMode::Review),
        consensus_threshold: row.get(4)?,
        min_reviews: row.get(5)?,
        human_review_weight: row.get(6)?,
        buffer_branch: row.get(7)?,
        promote_target: row.get(8)?,
        stabilize_command: row.get(9)?,
        auto_promote_on_green: row.get::<_, i64>(10)? != 0,
        auto_revert_on_red: row.get::<_, i64>(11)? != 0,
        consensus_authority: row
            .get::<_, String>(12)?
            .parse()
            .unwrap_or(ConsensusAuthority::Local),
        access_mode: row.get::<_, String>(13)?.parse().unwrap_or(AccessMode::Private),
        min_karma: row.get(14)?,
        stage: row.get::<_, String>(15)?.parse().unwrap_or(Stage::Seed),
        contributor_count: row.get(16)?,
        patch_count: row.get(17)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_placeholder_rewrite() {
        assert_eq!(Database::to_sequential("select * from t where a=$1 and b=$2"), "select * from t where a=? and b=?");
        assert_eq!(Database::to_sequential("no placeholders here"), "no placeholders here");
    }

    #[test]
    fn table_name_resolves_prefix() {
        let db = Database::open_in_memory(true).unwrap();
        assert_eq!(db.table_name("streams"), "gitswarm_streams");
        let db = Database::open_in_memory(false).unwrap();
        assert_eq!(db.table_name("streams"), "streams");
    }

    #[test]
    fn schema_applies_for_both_prefix_modes() {
        assert!(Database::open_in_memory(true).is_ok());
        assert!(Database::open_in_memory(false).is_ok());
    }
}
