//! Sliding-window rate limiter, per `(key, scope)`.

use crate::database::Database;
use crate::error::Result;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub current: i64,
    pub limit: i64,
    pub remaining: i64,
    pub reset_at: chrono::DateTime<Utc>,
    pub retry_after: Option<i64>,
}

pub struct RateLimiter<'a> {
    db: &'a Database,
}

impl<'a> RateLimiter<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Delete rows older than `now - window`, count what remains, and if
    /// below `limit`, insert a new hit stamped `now`.
    pub async fn check(
        &self,
        key: &str,
        scope: &str,
        limit: i64,
        window_secs: i64,
    ) -> Result<RateLimitResult> {
        let now = Utc::now();
        let window_start = now - ChronoDuration::seconds(window_secs);

        sqlx::query(
            "DELETE FROM rate_limit_hits WHERE key = ? AND scope = ? AND hit_at < ?",
        )
        .bind(key)
        .bind(scope)
        .bind(window_start.to_rfc3339())
        .execute(self.db.pool())
        .await?;

        let row = sqlx::query(
            "SELECT COUNT(*) as c FROM rate_limit_hits WHERE key = ? AND scope = ?",
        )
        .bind(key)
        .bind(scope)
        .fetch_one(self.db.pool())
        .await?;
        let current: i64 = sqlx::Row::get(&row, "c");

        let allowed = current < limit;
        if allowed {
            sqlx::query(
                "INSERT INTO rate_limit_hits (key, scope, hit_at) VALUES (?, ?, ?)",
            )
            .bind(key)
            .bind(scope)
            .bind(now.to_rfc3339())
            .execute(self.db.pool())
            .await?;
        }

        let current = if allowed { current + 1 } else { current };
        let reset_at = now + ChronoDuration::seconds(window_secs);
        let retry_after = if allowed { None } else { Some(window_secs) };

        Ok(RateLimitResult {
            allowed,
            current,
            limit,
            remaining: (limit - current).max(0),
            reset_at,
            retry_after,
        })
    }

    /// Periodic purge: delete rows older than the largest tracked window.
    pub async fn purge(&self, max_window_secs: i64) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::seconds(max_window_secs);
        let result = sqlx::query("DELETE FROM rate_limit_hits WHERE hit_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
