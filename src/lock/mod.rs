//! Paste-lock state machine storage. Two interchangeable backends behind
//! one trait, so the detector doesn't care whether locks live in-process
//! or in Redis.

mod memory;
mod redis_store;

pub use memory::InMemoryLockStore;
pub use redis_store::RedisLockStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreResult;
use crate::model::PasteLock;
use uuid::Uuid;

/// Default lock TTL.
pub const LOCK_TTL_SECS: i64 = 3600;

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set a new lock with a fresh TTL, overwriting any existing baseline.
    async fn set_lock(&self, session_id: Uuid, baseline_code: String, ttl_secs: i64) -> CoreResult<()>;

    /// Current lock state for a session. Absent or expired both read as
    /// `None`.
    async fn get_lock(&self, session_id: Uuid) -> CoreResult<Option<PasteLock>>;

    /// Idempotent removal.
    async fn remove_lock(&self, session_id: Uuid) -> CoreResult<()>;

    /// Extend the TTL without touching the stored baseline.
    async fn refresh_ttl(&self, session_id: Uuid, ttl_secs: i64) -> CoreResult<()>;
}

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}
