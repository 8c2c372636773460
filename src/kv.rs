//! Thin KV abstraction over the operations the buffered repository and
//! flusher need: string get/set, set ops, list ops, EXPIRE, EXISTS.
//! Backed by `redis` (async, `ConnectionManager` so a dropped connection
//! reconnects transparently instead of poisoning every caller).

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::CoreResult;

pub fn session_code_key(session_id: uuid::Uuid) -> String {
    format!("session:{session_id}:code")
}

pub fn session_messages_key(session_id: uuid::Uuid) -> String {
    format!("session:{session_id}:messages")
}

pub const DIRTY_SESSIONS_CODE: &str = "dirty_sessions:code";
pub const DIRTY_SESSIONS_MESSAGES: &str = "dirty_sessions:messages";

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> CoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> CoreResult<()>;
    async fn del(&self, key: &str) -> CoreResult<()>;
    async fn exists(&self, key: &str) -> CoreResult<bool>;

    async fn sadd(&self, key: &str, member: &str) -> CoreResult<()>;
    async fn srem(&self, key: &str, member: &str) -> CoreResult<()>;
    async fn smembers(&self, key: &str) -> CoreResult<Vec<String>>;

    async fn rpush(&self, key: &str, value: &str) -> CoreResult<()>;
    async fn lrange_all(&self, key: &str) -> CoreResult<Vec<String>>;

    /// Write `value` for `key` and add `dirty_member` to `dirty_set` in a
    /// single pipeline (the write-through hot path).
    async fn set_and_mark_dirty(&self, key: &str, value: &str, dirty_set: &str, dirty_member: &str) -> CoreResult<()>;

    /// Append `value` onto list `key` and add `dirty_member` to `dirty_set`
    /// in a single pipeline.
    async fn rpush_and_mark_dirty(&self, key: &str, value: &str, dirty_set: &str, dirty_member: &str) -> CoreResult<()>;

    /// Read and clear `key`'s full list contents, removing `member` from
    /// `dirty_set`, in one pipeline.
    async fn drain_list_and_unmark(&self, key: &str, dirty_set: &str, member: &str) -> CoreResult<Vec<String>>;

    /// Remove `member` from `dirty_set`; the code key itself stays, only
    /// the dirty marker is cleared.
    async fn unmark_dirty(&self, dirty_set: &str, member: &str) -> CoreResult<()>;
}

#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
}

impl RedisKvStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.set(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.sadd(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.srem(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> CoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn rpush(&self, key: &str, value: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.rpush(key, value).await?;
        Ok(())
    }

    async fn lrange_all(&self, key: &str) -> CoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, 0, -1).await?)
    }

    async fn set_and_mark_dirty(&self, key: &str, value: &str, dirty_set: &str, dirty_member: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .set(key, value)
            .sadd(dirty_set, dirty_member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn rpush_and_mark_dirty(&self, key: &str, value: &str, dirty_set: &str, dirty_member: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .rpush(key, value)
            .sadd(dirty_set, dirty_member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn drain_list_and_unmark(&self, key: &str, dirty_set: &str, member: &str) -> CoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = conn.lrange(key, 0, -1).await?;
        redis::pipe()
            .atomic()
            .del(key)
            .srem(dirty_set, member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(items)
    }

    async fn unmark_dirty(&self, dirty_set: &str, member: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.srem(dirty_set, member).await?;
        Ok(())
    }
}

/// An in-process `KvStore`, shared across this crate's test modules so
/// the flusher and buffered repository can be exercised without Redis.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct InMemoryKv {
        strings: Mutex<HashMap<String, String>>,
        sets: Mutex<HashMap<String, HashSet<String>>>,
        lists: Mutex<HashMap<String, Vec<String>>>,
    }

    impl InMemoryKv {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl KvStore for InMemoryKv {
        async fn get(&self, key: &str) -> CoreResult<Option<String>> {
            Ok(self.strings.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, key: &str, value: &str) -> CoreResult<()> {
            self.strings.lock().unwrap().insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn del(&self, key: &str) -> CoreResult<()> {
            self.strings.lock().unwrap().remove(key);
            Ok(())
        }

        async fn exists(&self, key: &str) -> CoreResult<bool> {
            Ok(self.strings.lock().unwrap().contains_key(key))
        }

        async fn sadd(&self, key: &str, member: &str) -> CoreResult<()> {
            self.sets.lock().unwrap().entry(key.to_string()).or_default().insert(member.to_string());
            Ok(())
        }

        async fn srem(&self, key: &str, member: &str) -> CoreResult<()> {
            if let Some(set) = self.sets.lock().unwrap().get_mut(key) {
                set.remove(member);
            }
            Ok(())
        }

        async fn smembers(&self, key: &str) -> CoreResult<Vec<String>> {
            Ok(self.sets.lock().unwrap().get(key).cloned().unwrap_or_default().into_iter().collect())
        }

        async fn rpush(&self, key: &str, value: &str) -> CoreResult<()> {
            self.lists.lock().unwrap().entry(key.to_string()).or_default().push(value.to_string());
            Ok(())
        }

        async fn lrange_all(&self, key: &str) -> CoreResult<Vec<String>> {
            Ok(self.lists.lock().unwrap().get(key).cloned().unwrap_or_default())
        }

        async fn set_and_mark_dirty(&self, key: &str, value: &str, dirty_set: &str, dirty_member: &str) -> CoreResult<()> {
            self.set(key, value).await?;
            self.sadd(dirty_set, dirty_member).await
        }

        async fn rpush_and_mark_dirty(&self, key: &str, value: &str, dirty_set: &str, dirty_member: &str) -> CoreResult<()> {
            self.rpush(key, value).await?;
            self.sadd(dirty_set, dirty_member).await
        }

        async fn drain_list_and_unmark(&self, key: &str, dirty_set: &str, member: &str) -> CoreResult<Vec<String>> {
            let items = self.lists.lock().unwrap().remove(key).unwrap_or_default();
            self.srem(dirty_set, member).await?;
            Ok(items)
        }

        async fn unmark_dirty(&self, dirty_set: &str, member: &str) -> CoreResult<()> {
            self.srem(dirty_set, member).await
        }
    }
}
