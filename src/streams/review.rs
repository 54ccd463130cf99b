//! Review Book (§4, component table "Review Book"): per-stream reviews,
//! idempotent upsert by `(stream, reviewer)`.

use crate::db::models::Verdict;
use crate::db::Database;
use crate::error::{GitSwarmError, Result};
use chrono::Utc;

pub struct ReviewBook {
    db: Database,
}

/// `(is_maintainer, is_human, karma, verdict)` for one review, the shape
/// [`crate::policy::PolicyEngine::check_consensus`] expects.
pub type ReviewTuple = (bool, bool, i64, Verdict);

impl ReviewBook {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Submits or updates a review. Self-review (reviewer = stream owner)
    /// is forbidden. `reject` is normalized to `request_changes` by the
    /// caller (CLI layer) before this is invoked.
    pub fn submit(
        &self,
        stream_id: &str,
        owner_agent_id: &str,
        reviewer_agent_id: &str,
        verdict: Verdict,
        feedback: &str,
        is_human: bool,
        tested: bool,
    ) -> Result<()> {
        if reviewer_agent_id == owner_agent_id {
            return Err(GitSwarmError::InsufficientPermissions);
        }

        let table = self.db.table_name("stream_reviews");
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (stream_id, reviewer_agent_id, verdict, feedback, is_human, tested, reviewed_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT(stream_id, reviewer_agent_id) DO UPDATE SET \
                     verdict = excluded.verdict, feedback = excluded.feedback, \
                     is_human = excluded.is_human, tested = excluded.tested, reviewed_at = excluded.reviewed_at"
                ),
                rusqlite::params![
                    stream_id,
                    reviewer_agent_id,
                    verdict.as_str(),
                    feedback,
                    is_human,
                    tested,
                    Utc::now().to_rfc3339(),
                ],
            )
        })?;
        Ok(())
    }

    /// All reviews for a stream, joined against each reviewer's maintainer
    /// status and karma, in the shape [`crate::policy::PolicyEngine::check_consensus`]
    /// expects.
    pub fn reviews_for_consensus(&self, repo_id: &str, stream_id: &str) -> Result<Vec<ReviewTuple>> {
        let reviews_table = self.db.table_name("stream_reviews");
        let agents_table = self.db.table_name("agents");
        let maintainers_table = self.db.table_name("maintainers");
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT \
                    (SELECT 1 FROM {maintainers_table} m WHERE m.repo_id = ?1 AND m.agent_id = r.reviewer_agent_id) IS NOT NULL, \
                    r.is_human, \
                    COALESCE((SELECT a.karma FROM {agents_table} a WHERE a.id = r.reviewer_agent_id), 0), \
                    r.verdict \
                 FROM {reviews_table} r WHERE r.stream_id = ?2"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![repo_id, stream_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)? != 0,
                        row.get::<_, i64>(1)? != 0,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows
                .into_iter()
                .map(|(is_maint, is_human, karma, verdict)| {
                    (is_maint, is_human, karma, verdict.parse().unwrap_or(Verdict::Comment))
                })
                .collect())
        })
    }

    pub fn count(&self, stream_id: &str) -> Result<i64> {
        let table = self.db.table_name("stream_reviews");
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE stream_id = ?1"),
                [stream_id],
                |row| row.get(0),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> ReviewBook {
        ReviewBook::new(Database::open_in_memory(false).unwrap())
    }

    #[test]
    fn self_review_is_forbidden() {
        let book = book();
        let err = book
            .submit("s1", "alice", "alice", Verdict::Approve, "", false, false)
            .unwrap_err();
        assert!(matches!(err, GitSwarmError::InsufficientPermissions));
    }

    /// P4: two consecutive submissions from the same reviewer collapse into
    /// one row reflecting the latest verdict.
    #[test]
    fn idempotent_upsert_keeps_latest_verdict() {
        let book = book();
        book.submit("s1", "alice", "bob", Verdict::RequestChanges, "no", false, false)
            .unwrap();
        book.submit("s1", "alice", "bob", Verdict::Approve, "now yes", false, false)
            .unwrap();
        assert_eq!(book.count("s1").unwrap(), 1);
        let reviews = book.reviews_for_consensus("repo-1", "s1").unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].3, Verdict::Approve);
    }
}
