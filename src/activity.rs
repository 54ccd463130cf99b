//! Append-only activity log (§4, component table "Activity Log"): every
//! lifecycle event (merge, stabilization, promotion, stage change) is
//! recorded here for audit and for `pollUpdates` to replay from.

use crate::db::Database;
use crate::error::Result;
use chrono::Utc;
use serde_json::Value;

pub struct ActivityLog {
    db: Database,
}

impl ActivityLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn record(&self, repo_id: &str, kind: &str, metadata: Value) -> Result<()> {
        let table = self.db.table_name("activity_log");
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO {table} (repo_id, kind, metadata, at) VALUES (?1, ?2, ?3, ?4)"),
                rusqlite::params![repo_id, kind, metadata.to_string(), Utc::now().to_rfc3339()],
            )
        })?;
        Ok(())
    }

    pub fn recent(&self, repo_id: &str, limit: i64) -> Result<Vec<(String, Value, String)>> {
        let table = self.db.table_name("activity_log");
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT kind, metadata, at FROM {table} WHERE repo_id = ?1 ORDER BY id DESC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![repo_id, limit], |row| {
                    let metadata: String = row.get(1)?;
                    Ok((row.get::<_, String>(0)?, metadata, row.get::<_, String>(2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows
                .into_iter()
                .map(|(kind, metadata, at)| (kind, serde_json::from_str(&metadata).unwrap_or(Value::Null), at))
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_retrievable_newest_first() {
        let db = Database::open_in_memory(false).unwrap();
        let log = ActivityLog::new(db);
        log.record("repo-1", "stream_merged", serde_json::json!({"stream": "a"})).unwrap();
        log.record("repo-1", "stream_merged", serde_json::json!({"stream": "b"})).unwrap();
        let recent = log.recent("repo-1", 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].1["stream"], "b");
    }
}
