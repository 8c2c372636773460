//! KV-backed lock store: two keys per session,
//! `paste_lock:{id}` (sentinel) and `paste_baseline:{id}` (the code), set
//! atomically with identical TTL via a pipeline. A lock is valid only when
//! both keys are present and the baseline is non-empty — if the baseline
//! key expired between pipeline calls, the session reads as unlocked.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::model::PasteLock;

use super::{now, LockStore};

fn lock_key(session_id: Uuid) -> String {
    format!("paste_lock:{session_id}")
}

fn baseline_key(session_id: Uuid) -> String {
    format!("paste_baseline:{session_id}")
}

#[derive(Clone)]
pub struct RedisLockStore {
    conn: ConnectionManager,
}

impl RedisLockStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_lock(&self, session_id: Uuid, baseline_code: String, ttl_secs: i64) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let ttl = ttl_secs.max(1) as u64;
        redis::pipe()
            .atomic()
            .set_ex(lock_key(session_id), "1", ttl)
            .set_ex(baseline_key(session_id), baseline_code, ttl)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_lock(&self, session_id: Uuid) -> CoreResult<Option<PasteLock>> {
        let mut conn = self.conn.clone();
        let (sentinel, baseline): (Option<String>, Option<String>) = redis::pipe()
            .get(lock_key(session_id))
            .get(baseline_key(session_id))
            .query_async(&mut conn)
            .await?;

        let (Some(_), Some(baseline)) = (sentinel, baseline) else {
            return Ok(None);
        };
        if baseline.is_empty() {
            return Ok(None);
        }

        let ttl_remaining: i64 = conn.ttl(lock_key(session_id)).await.unwrap_or(-1);
        let now = now();
        let expires_at = if ttl_remaining > 0 {
            now + chrono::Duration::seconds(ttl_remaining)
        } else {
            now
        };

        Ok(Some(PasteLock {
            session_id,
            baseline_code: baseline,
            locked_at: now,
            expires_at,
        }))
    }

    async fn remove_lock(&self, session_id: Uuid) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .del(lock_key(session_id))
            .del(baseline_key(session_id))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn refresh_ttl(&self, session_id: Uuid, ttl_secs: i64) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let ttl = ttl_secs.max(1) as u64;
        redis::pipe()
            .atomic()
            .expire(lock_key(session_id), ttl as i64)
            .expire(baseline_key(session_id), ttl as i64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}
