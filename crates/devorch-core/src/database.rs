//! Persistence kernel: one embedded SQLite store per controller instance,
//! holding the relational tables from §3/§6 plus a generic `kv_store` for
//! serialized state-machine snapshots.

use crate::error::Result;
use crate::issue::{Dependency, Issue};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteQueryResult};
use sqlx::{Row, SqlitePool};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(path: &str) -> Result<Self> {
        Self::with_config(path, DatabaseConfig::default()).await
    }

    pub async fn with_config(path: &str, config: DatabaseConfig) -> Result<Self> {
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&url)
            .await?;
        let db = Self { pool };
        db.init_pragmas().await?;
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.init_pragmas().await?;
        db.run_migrations().await?;
        Ok(db)
    }

    async fn init_pragmas(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL").execute(&self.pool).await.ok();
        sqlx::query("PRAGMA foreign_keys=ON").execute(&self.pool).await?;
        sqlx::query("PRAGMA busy_timeout=5000").execute(&self.pool).await?;
        Ok(())
    }

    async fn run_migrations(&self) -> Result<()> {
        let migrations = [
            include_str!("../../../migrations/001_init.sql"),
            include_str!("../../../migrations/002_execution.sql"),
            include_str!("../../../migrations/003_review.sql"),
            include_str!("../../../migrations/004_kv_and_ambient.sql"),
        ];
        for migration in migrations {
            for statement in migration.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                sqlx::query(statement).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- kv_store -----------------------------------------------------

    pub async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    pub async fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- issues ---------------------------------------------------------

    pub async fn upsert_issue(&self, issue: &Issue) -> Result<()> {
        sqlx::query(
            "INSERT INTO issues (id, title, description, design, acceptance_criteria, notes,
                status, priority, issue_type, assignee, created_at, updated_at, closed_at,
                close_reason, host_number, host_id, last_sync_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title, description = excluded.description,
                design = excluded.design, acceptance_criteria = excluded.acceptance_criteria,
                notes = excluded.notes, status = excluded.status, priority = excluded.priority,
                issue_type = excluded.issue_type, assignee = excluded.assignee,
                updated_at = excluded.updated_at, closed_at = excluded.closed_at,
                close_reason = excluded.close_reason, host_number = excluded.host_number,
                host_id = excluded.host_id, last_sync_at = excluded.last_sync_at",
        )
        .bind(&issue.id)
        .bind(&issue.title)
        .bind(&issue.description)
        .bind(&issue.design)
        .bind(&issue.acceptance_criteria)
        .bind(&issue.notes)
        .bind(&issue.status)
        .bind(issue.priority)
        .bind(&issue.issue_type)
        .bind(&issue.assignee)
        .bind(issue.created_at.to_rfc3339())
        .bind(issue.updated_at.to_rfc3339())
        .bind(issue.closed_at.map(|t| t.to_rfc3339()))
        .bind(&issue.close_reason)
        .bind(issue.host_number)
        .bind(issue.host_id)
        .bind(issue.last_sync_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM labels WHERE issue_id = ?")
            .bind(&issue.id)
            .execute(&self.pool)
            .await?;
        for label in &issue.labels {
            sqlx::query("INSERT OR IGNORE INTO labels (issue_id, name) VALUES (?, ?)")
                .bind(&issue.id)
                .bind(label)
                .execute(&self.pool)
                .await?;
        }

        for dep in &issue.dependencies {
            self.upsert_dependency(dep).await?;
        }
        Ok(())
    }

    pub async fn upsert_dependency(&self, dep: &Dependency) -> Result<()> {
        sqlx::query(
            "INSERT INTO dependencies (issue_id, depends_on_id, type) VALUES (?, ?, ?)
             ON CONFLICT(issue_id, depends_on_id) DO UPDATE SET type = excluded.type",
        )
        .bind(&dep.issue_id)
        .bind(&dep.depends_on_id)
        .bind(&dep.dep_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_issue(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM issues WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_issue(&self, id: &str) -> Result<Option<Issue>> {
        let row = sqlx::query(
            "SELECT id, title, description, design, acceptance_criteria, notes, status,
                    priority, issue_type, assignee, created_at, updated_at, closed_at,
                    close_reason, host_number, host_id, last_sync_at
             FROM issues WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(self.issue_from_row(&row, id).await?))
    }

    pub async fn find_by_host_number(&self, host_number: i64) -> Result<Option<Issue>> {
        let row = sqlx::query("SELECT id FROM issues WHERE host_number = ?")
            .bind(host_number)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => self.get_issue(&row.get::<String, _>("id")).await,
            None => Ok(None),
        }
    }

    pub async fn find_by_title_unsynced(&self, title: &str) -> Result<Option<Issue>> {
        let row = sqlx::query(
            "SELECT id FROM issues WHERE host_number IS NULL AND title = ? LIMIT 1",
        )
        .bind(title)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => self.get_issue(&row.get::<String, _>("id")).await,
            None => Ok(None),
        }
    }

    pub async fn list_issues(&self) -> Result<Vec<Issue>> {
        let rows = sqlx::query("SELECT id FROM issues ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(issue) = self.get_issue(&row.get::<String, _>("id")).await? {
                out.push(issue);
            }
        }
        Ok(out)
    }

    /// Ready-set: open issues with no open `blocks` dependency, ordered
    /// `priority ASC, updated_at DESC`.
    pub async fn list_ready(&self) -> Result<Vec<Issue>> {
        let rows = sqlx::query(
            "SELECT i.id FROM issues i
             WHERE i.status = 'open'
               AND NOT EXISTS (
                   SELECT 1 FROM dependencies d
                   JOIN issues blocker ON blocker.id = d.depends_on_id
                   WHERE d.issue_id = i.id AND d.type = 'blocks' AND blocker.status != 'closed'
               )
             ORDER BY i.priority ASC, i.updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(issue) = self.get_issue(&row.get::<String, _>("id")).await? {
                out.push(issue);
            }
        }
        Ok(out)
    }

    pub async fn list_blocked(&self) -> Result<Vec<Issue>> {
        let rows = sqlx::query(
            "SELECT i.id FROM issues i WHERE i.status = 'blocked' ORDER BY i.priority ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(issue) = self.get_issue(&row.get::<String, _>("id")).await? {
                out.push(issue);
            }
        }
        Ok(out)
    }

    pub async fn search(&self, query: &str) -> Result<Vec<Issue>> {
        let pattern = format!("%{query}%");
        let rows = sqlx::query(
            "SELECT id FROM issues WHERE title LIKE ? OR description LIKE ? ORDER BY id ASC",
        )
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(issue) = self.get_issue(&row.get::<String, _>("id")).await? {
                out.push(issue);
            }
        }
        Ok(out)
    }

    async fn issue_from_row(&self, row: &sqlx::sqlite::SqliteRow, id: &str) -> Result<Issue> {
        let labels = sqlx::query("SELECT name FROM labels WHERE issue_id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|r| r.get::<String, _>("name"))
            .collect();

        let deps = sqlx::query("SELECT issue_id, depends_on_id, type FROM dependencies WHERE issue_id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|r| Dependency {
                issue_id: r.get("issue_id"),
                depends_on_id: r.get("depends_on_id"),
                dep_type: r.get("type"),
            })
            .collect();

        Ok(Issue {
            id: row.get("id"),
            title: row.get("title"),
            description: row.get("description"),
            design: row.get("design"),
            acceptance_criteria: row.get("acceptance_criteria"),
            notes: row.get("notes"),
            status: row.get("status"),
            priority: row.get("priority"),
            issue_type: row.get("issue_type"),
            assignee: row.get("assignee"),
            created_at: parse_ts(row.get("created_at")),
            updated_at: parse_ts(row.get("updated_at")),
            closed_at: row.get::<Option<String>, _>("closed_at").map(parse_ts),
            close_reason: row.get("close_reason"),
            host_number: row.get("host_number"),
            host_id: row.get("host_id"),
            last_sync_at: row.get::<Option<String>, _>("last_sync_at").map(parse_ts),
            labels,
            dependencies: deps,
        })
    }

    // -- audit log --------------------------------------------------------

    pub async fn insert_audit_entry(
        &self,
        action: &str,
        entity_ref: &str,
        session_id: Option<&str>,
        details: &serde_json::Value,
    ) -> Result<SqliteQueryResult> {
        Ok(sqlx::query(
            "INSERT INTO audit_log (action, entity_ref, session_id, details, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(action)
        .bind(entity_ref)
        .bind(session_id)
        .bind(details.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?)
    }

    // -- state transitions -------------------------------------------------

    pub async fn insert_transition(
        &self,
        entity_ref: &str,
        from_state: &str,
        event: &str,
        to_state: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO state_transitions (entity_ref, from_state, event, to_state, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entity_ref)
        .bind(from_state)
        .bind(event)
        .bind(to_state)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_transitions(&self, entity_ref: &str, limit: i64) -> Result<Vec<(String, String, String, String)>> {
        let rows = sqlx::query(
            "SELECT from_state, event, to_state, created_at FROM state_transitions
             WHERE entity_ref = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(entity_ref)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("from_state"), r.get("event"), r.get("to_state"), r.get("created_at")))
            .collect())
    }

    // -- agent events -------------------------------------------------------

    pub async fn insert_agent_event(
        &self,
        session_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_events (session_id, event_type, payload, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(event_type)
        .bind(payload.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn events_for_session(&self, session_id: &str) -> Result<Vec<(String, serde_json::Value, String)>> {
        let rows = sqlx::query(
            "SELECT event_type, payload, created_at FROM agent_events
             WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let payload: String = r.get("payload");
                (
                    r.get("event_type"),
                    serde_json::from_str(&payload).unwrap_or_default(),
                    r.get("created_at"),
                )
            })
            .collect())
    }

    // -- tool checks / verifications ---------------------------------------

    pub async fn insert_tool_check(&self, issue_id: &str, required_tools: &[String], missing_tools: &[String]) -> Result<()> {
        sqlx::query(
            "INSERT INTO tool_checks (issue_id, required_tools, missing_tools, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(issue_id)
        .bind(serde_json::to_string(required_tools).unwrap_or_else(|_| "[]".to_string()))
        .bind(serde_json::to_string(missing_tools).unwrap_or_else(|_| "[]".to_string()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn tool_checks_for_issue(&self, issue_id: &str) -> Result<Vec<(Vec<String>, Vec<String>, String)>> {
        let rows = sqlx::query(
            "SELECT required_tools, missing_tools, created_at FROM tool_checks
             WHERE issue_id = ? ORDER BY id ASC",
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let required: String = r.get("required_tools");
                let missing: String = r.get("missing_tools");
                (
                    serde_json::from_str(&required).unwrap_or_default(),
                    serde_json::from_str(&missing).unwrap_or_default(),
                    r.get("created_at"),
                )
            })
            .collect())
    }

    pub async fn insert_verification(&self, issue_id: &str, session_id: &str, passed: bool, reason: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT INTO verifications (issue_id, session_id, passed, reason, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(issue_id)
        .bind(session_id)
        .bind(passed)
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn verifications_for_issue(&self, issue_id: &str) -> Result<Vec<(bool, Option<String>, String)>> {
        let rows = sqlx::query(
            "SELECT passed, reason, created_at FROM verifications
             WHERE issue_id = ? ORDER BY id ASC",
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| (r.get("passed"), r.get("reason"), r.get("created_at"))).collect())
    }
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_issue(id: &str) -> Issue {
        Issue {
            id: id.to_string(),
            title: "Title".into(),
            description: String::new(),
            design: String::new(),
            acceptance_criteria: String::new(),
            notes: String::new(),
            status: "open".into(),
            priority: 2,
            issue_type: "task".into(),
            assignee: None,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            closed_at: None,
            close_reason: None,
            host_number: None,
            host_id: None,
            last_sync_at: None,
            labels: vec![],
            dependencies: vec![],
        }
    }

    #[tokio::test]
    async fn upsert_and_get_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        db.upsert_issue(&sample_issue("todo-a")).await.unwrap();
        let fetched = db.get_issue("todo-a").await.unwrap().unwrap();
        assert_eq!(fetched.title, "Title");
    }

    #[tokio::test]
    async fn ready_set_excludes_blocked_issues() {
        let db = Database::in_memory().await.unwrap();
        db.upsert_issue(&sample_issue("todo-a")).await.unwrap();
        db.upsert_issue(&sample_issue("todo-b")).await.unwrap();
        db.upsert_dependency(&Dependency {
            issue_id: "todo-b".into(),
            depends_on_id: "todo-a".into(),
            dep_type: "blocks".into(),
        })
        .await
        .unwrap();

        let ready = db.list_ready().await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "todo-a");

        let mut closed = sample_issue("todo-a");
        closed.status = "closed".into();
        db.upsert_issue(&closed).await.unwrap();

        let ready = db.list_ready().await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "todo-b");
    }

    #[tokio::test]
    async fn kv_store_overwrites_on_conflict() {
        let db = Database::in_memory().await.unwrap();
        db.kv_set("machineState", "{\"value\":\"idle\"}").await.unwrap();
        db.kv_set("machineState", "{\"value\":\"executing\"}").await.unwrap();
        let value = db.kv_get("machineState").await.unwrap().unwrap();
        assert_eq!(value, "{\"value\":\"executing\"}");
    }

    #[tokio::test]
    async fn tool_checks_round_trip() {
        let db = Database::in_memory().await.unwrap();
        db.insert_tool_check("todo-a", &["shell.run".to_string()], &["file.write".to_string()]).await.unwrap();
        let checks = db.tool_checks_for_issue("todo-a").await.unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].0, vec!["shell.run".to_string()]);
        assert_eq!(checks[0].1, vec!["file.write".to_string()]);
    }

    #[tokio::test]
    async fn verifications_round_trip() {
        let db = Database::in_memory().await.unwrap();
        db.insert_verification("todo-a", "sess-1", false, Some("tests_failed")).await.unwrap();
        db.insert_verification("todo-a", "sess-1", true, None).await.unwrap();
        let verifications = db.verifications_for_issue("todo-a").await.unwrap();
        assert_eq!(verifications.len(), 2);
        assert!(!verifications[0].0);
        assert_eq!(verifications[0].1.as_deref(), Some("tests_failed"));
        assert!(verifications[1].0);
        assert!(verifications[1].1.is_none());
    }
}
