//! Hashed-token session store. Raw tokens never touch durable storage —
//! only their hex-encoded SHA-256 digest is stored.

use crate::database::Database;
use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSession {
    pub user: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub data: serde_json::Value,
    pub ttl_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct SessionStore<'a> {
    db: &'a Database,
}

impl<'a> SessionStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, token: &str, new_session: NewSession) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = now + ChronoDuration::seconds(new_session.ttl_seconds);
        sqlx::query(
            "INSERT INTO sessions (id, token_hash, user_id, email, name, data, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(hash_token(token))
        .bind(&new_session.user)
        .bind(&new_session.email)
        .bind(&new_session.name)
        .bind(new_session.data.to_string())
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .execute(self.db.pool())
        .await?;
        Ok(id)
    }

    /// Returns the session iff `now < expires_at`; expired rows are
    /// treated as absent (they're reaped by `sweep`).
    pub async fn validate(&self, token: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT id, user_id, email, name, data, created_at, expires_at FROM sessions
             WHERE token_hash = ?",
        )
        .bind(hash_token(token))
        .fetch_optional(self.db.pool())
        .await?;

        let Some(row) = row else { return Ok(None) };
        let expires_at: String = row.get("expires_at");
        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        if Utc::now() >= expires_at {
            return Ok(None);
        }

        let created_at: String = row.get("created_at");
        let data: String = row.get("data");
        Ok(Some(Session {
            id: row.get("id"),
            user: row.get("user_id"),
            email: row.get("email"),
            name: row.get("name"),
            data: serde_json::from_str(&data).unwrap_or_default(),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            expires_at,
        }))
    }

    /// Periodic cleanup: delete all expired rows.
    pub async fn sweep(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < ?")
            .bind(Utc::now().to_rfc3339())
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Revoke every session belonging to a user, e.g. on password change
    /// or account deactivation.
    pub async fn purge_user(&self, user: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(user)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_validate_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        let store = SessionStore::new(&db);
        let id = store
            .create(
                "raw-token",
                NewSession {
                    user: Some("u1".into()),
                    ttl_seconds: 3600,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let session = store.validate("raw-token").await.unwrap().unwrap();
        assert_eq!(session.id, id);
        assert_eq!(session.user.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn expired_session_is_invisible() {
        let db = Database::in_memory().await.unwrap();
        let store = SessionStore::new(&db);
        store
            .create(
                "raw-token",
                NewSession {
                    ttl_seconds: -1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(store.validate("raw-token").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn raw_token_never_stored() {
        let db = Database::in_memory().await.unwrap();
        let store = SessionStore::new(&db);
        store
            .create("super-secret", NewSession { ttl_seconds: 60, ..Default::default() })
            .await
            .unwrap();
        let row = sqlx::query("SELECT token_hash FROM sessions")
            .fetch_one(db.pool())
            .await
            .unwrap();
        let stored: String = row.get("token_hash");
        assert_ne!(stored, "super-secret");
        assert_eq!(stored, hash_token("super-secret"));
    }

    #[tokio::test]
    async fn sweep_removes_expired_rows() {
        let db = Database::in_memory().await.unwrap();
        let store = SessionStore::new(&db);
        store
            .create("a", NewSession { ttl_seconds: -5, ..Default::default() })
            .await
            .unwrap();
        store
            .create("b", NewSession { ttl_seconds: 3600, ..Default::default() })
            .await
            .unwrap();
        let removed = store.sweep().await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn purge_user_revokes_only_that_users_sessions() {
        let db = Database::in_memory().await.unwrap();
        let store = SessionStore::new(&db);
        store
            .create("a", NewSession { user: Some("u1".into()), ttl_seconds: 3600, ..Default::default() })
            .await
            .unwrap();
        store
            .create("b", NewSession { user: Some("u1".into()), ttl_seconds: 3600, ..Default::default() })
            .await
            .unwrap();
        store
            .create("c", NewSession { user: Some("u2".into()), ttl_seconds: 3600, ..Default::default() })
            .await
            .unwrap();

        let removed = store.purge_user("u1").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.validate("a").await.unwrap().is_none());
        assert!(store.validate("b").await.unwrap().is_none());
        assert!(store.validate("c").await.unwrap().is_some());
    }
}
