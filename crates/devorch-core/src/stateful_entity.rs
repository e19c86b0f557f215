//! StatefulEntity base: every controller composes one of these. On every
//! transition it snapshots synchronously to the local store and fires off
//! an asynchronous, best-effort mirror to the external canonical store.

use crate::backoff::capped_retry_delay;
use crate::database::Database;
use async_trait::async_trait;
use std::sync::Arc;

const MAX_MIRROR_ATTEMPTS: u32 = 10;
const MIRROR_BASE_MS: u64 = 100;
const MIRROR_CAP_MS: u64 = 100_000;

/// The external canonical store, reached as an RPC. A no-op implementation
/// is provided for tests and for deployments that don't wire one up.
#[async_trait]
pub trait CanonicalMirror: Send + Sync {
    async fn mirror_write(
        &self,
        entity_type: &str,
        entity_ref: &str,
        payload: &str,
    ) -> anyhow::Result<()>;
}

pub struct NoopMirror;

#[async_trait]
impl CanonicalMirror for NoopMirror {
    async fn mirror_write(&self, _entity_type: &str, _entity_ref: &str, _payload: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct StatefulEntity {
    db: Database,
    mirror: Arc<dyn CanonicalMirror>,
    entity_type: &'static str,
    entity_ref: String,
    local_key: &'static str,
}

impl StatefulEntity {
    pub fn new(
        db: Database,
        mirror: Arc<dyn CanonicalMirror>,
        entity_type: &'static str,
        entity_ref: impl Into<String>,
        local_key: &'static str,
    ) -> Self {
        Self {
            db,
            mirror,
            entity_type,
            entity_ref: entity_ref.into(),
            local_key,
        }
    }

    /// Re-read the local snapshot on startup; `None` means start fresh.
    pub async fn load_snapshot(&self) -> crate::error::Result<Option<String>> {
        self.db.kv_get(self.local_key).await
    }

    /// Called on every transition: write local synchronously, then spawn
    /// a detached mirror task that survives the current request.
    pub async fn on_transition(&self, serialized_snapshot: String) -> crate::error::Result<()> {
        self.db.kv_set(self.local_key, &serialized_snapshot).await?;

        let mirror = self.mirror.clone();
        let entity_type = self.entity_type;
        let entity_ref = self.entity_ref.clone();
        tokio::spawn(async move {
            mirror_with_retry(mirror, entity_type, &entity_ref, &serialized_snapshot).await;
        });

        Ok(())
    }
}

async fn mirror_with_retry(
    mirror: Arc<dyn CanonicalMirror>,
    entity_type: &str,
    entity_ref: &str,
    payload: &str,
) {
    for attempt in 0..MAX_MIRROR_ATTEMPTS {
        match mirror.mirror_write(entity_type, entity_ref, payload).await {
            Ok(()) => return,
            Err(err) => {
                tracing::warn!(
                    entity_type,
                    entity_ref,
                    attempt,
                    error = %err,
                    "canonical mirror write failed, retrying"
                );
                let delay = capped_retry_delay(MIRROR_BASE_MS, attempt, MIRROR_CAP_MS);
                tokio::time::sleep(delay).await;
            }
        }
    }
    tracing::error!(
        entity_type,
        entity_ref,
        "canonical mirror exhausted retries, dropping (next transition will retry)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyMirror {
        fail_times: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CanonicalMirror for FlakyMirror {
        async fn mirror_write(&self, _t: &str, _r: &str, _p: &str) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                anyhow::bail!("simulated failure");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn local_snapshot_persists_synchronously() {
        let db = Database::in_memory().await.unwrap();
        let entity = StatefulEntity::new(db, Arc::new(NoopMirror), "issue", "todo-a", "machineState");
        entity.on_transition("{\"value\":\"executing\"}".into()).await.unwrap();
        let loaded = entity.load_snapshot().await.unwrap().unwrap();
        assert_eq!(loaded, "{\"value\":\"executing\"}");
    }

    #[tokio::test]
    async fn mirror_retries_until_success() {
        let mirror = Arc::new(FlakyMirror { fail_times: 2, calls: AtomicUsize::new(0) });
        mirror_with_retry(mirror.clone(), "issue", "todo-a", "{}").await;
        assert_eq!(mirror.calls.load(Ordering::SeqCst), 3);
    }
}
