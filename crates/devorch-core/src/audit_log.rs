//! Append-only audit log. No code path may issue `UPDATE`/`DELETE` against
//! `audit_log` — logging failures are best-effort and never affect the
//! primary operation they describe.

use crate::database::Database;
use serde_json::Value;

pub struct AuditLog<'a> {
    db: &'a Database,
}

impl<'a> AuditLog<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Append a record. Failures are logged and swallowed: audit logging
    /// is best-effort per spec §7.
    pub async fn append(&self, action: &str, entity_ref: &str, session_id: Option<&str>, details: Value) {
        if let Err(err) = self
            .db
            .insert_audit_entry(action, entity_ref, session_id, &details)
            .await
        {
            tracing::warn!(error = %err, action, entity_ref, "audit log append failed");
        }
    }
}
