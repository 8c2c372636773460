//! In-memory lock store backend: a map protected by a single mutex, plus
//! a periodic cleanup ticker that evicts expired entries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::model::PasteLock;

use super::{now, LockStore};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct InMemoryLockStore {
    locks: Arc<DashMap<Uuid, PasteLock>>,
}

impl InMemoryLockStore {
    /// Construct the store and spawn its background eviction ticker.
    pub fn new() -> Self {
        let locks = Arc::new(DashMap::new());
        spawn_cleanup_ticker(Arc::clone(&locks));
        Self { locks }
    }
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_cleanup_ticker(locks: Arc<DashMap<Uuid, PasteLock>>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            let now = now();
            locks.retain(|_, lock| lock.expires_at > now);
        }
    });
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_lock(&self, session_id: Uuid, baseline_code: String, ttl_secs: i64) -> CoreResult<()> {
        let now = now();
        self.locks.insert(
            session_id,
            PasteLock {
                session_id,
                baseline_code,
                locked_at: now,
                expires_at: now + chrono::Duration::seconds(ttl_secs),
            },
        );
        Ok(())
    }

    async fn get_lock(&self, session_id: Uuid) -> CoreResult<Option<PasteLock>> {
        let Some(entry) = self.locks.get(&session_id) else {
            return Ok(None);
        };
        if entry.expires_at <= now() {
            drop(entry);
            self.locks.remove(&session_id);
            return Ok(None);
        }
        Ok(Some(entry.clone()))
    }

    async fn remove_lock(&self, session_id: Uuid) -> CoreResult<()> {
        self.locks.remove(&session_id);
        Ok(())
    }

    async fn refresh_ttl(&self, session_id: Uuid, ttl_secs: i64) -> CoreResult<()> {
        if let Some(mut entry) = self.locks.get_mut(&session_id) {
            entry.expires_at = now() + chrono::Duration::seconds(ttl_secs);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = InMemoryLockStore::new();
        let session_id = Uuid::new_v4();
        store
            .set_lock(session_id, "baseline".to_string(), 3600)
            .await
            .unwrap();

        let lock = store.get_lock(session_id).await.unwrap().unwrap();
        assert_eq!(lock.baseline_code, "baseline");
    }

    #[tokio::test]
    async fn expired_lock_reads_as_absent() {
        let store = InMemoryLockStore::new();
        let session_id = Uuid::new_v4();
        store.set_lock(session_id, "baseline".to_string(), -1).await.unwrap();

        assert!(store.get_lock(session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_lock_is_idempotent() {
        let store = InMemoryLockStore::new();
        let session_id = Uuid::new_v4();
        store.remove_lock(session_id).await.unwrap();
        store.remove_lock(session_id).await.unwrap();
        assert!(store.get_lock(session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_ttl_preserves_baseline() {
        let store = InMemoryLockStore::new();
        let session_id = Uuid::new_v4();
        store.set_lock(session_id, "baseline".to_string(), 3600).await.unwrap();
        store.refresh_ttl(session_id, 7200).await.unwrap();

        let lock = store.get_lock(session_id).await.unwrap().unwrap();
        assert_eq!(lock.baseline_code, "baseline");
    }
}
