//! Periodic reconciliation of the hot cache's dirty sets into the durable
//! store. The write-through path marks a session dirty the instant it
//! writes to Redis; this loop is what actually makes that durable, on a
//! fixed interval rather than per-write, so bursts of edits collapse into
//! one flush.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::kv::{session_code_key, session_messages_key, KvStore, DIRTY_SESSIONS_CODE, DIRTY_SESSIONS_MESSAGES};
use crate::model::Message;
use crate::repo::SessionRepository;

/// Each pass (scheduled or ad hoc) is bounded so a stuck durable-store
/// call can't wedge the loop past the next tick.
const FLUSH_DEADLINE: Duration = Duration::from_secs(30);

/// The half of the flusher handed to callers who need to force an
/// immediate flush of one session, e.g. the hub on client disconnect.
#[derive(Clone)]
pub struct FlushTrigger {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl FlushTrigger {
    pub fn request_flush(&self, session_id: Uuid) {
        let _ = self.tx.send(session_id);
    }
}

pub struct Flusher<R, K> {
    durable: Arc<R>,
    kv: Arc<K>,
    interval: Duration,
    trigger_rx: mpsc::UnboundedReceiver<Uuid>,
}

impl<R, K> Flusher<R, K>
where
    R: SessionRepository + 'static,
    K: KvStore + 'static,
{
    pub fn new(durable: Arc<R>, kv: Arc<K>, interval: Duration) -> (Self, FlushTrigger) {
        let (tx, rx) = mpsc::unbounded_channel();
        let flusher = Self { durable, kv, interval, trigger_rx: rx };
        (flusher, FlushTrigger { tx })
    }

    /// Runs until `shutdown` fires, then performs one final drain before
    /// returning. Spawn this as a background task.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.bounded_flush_once().await {
                        tracing::error!(error = %err, "scheduled flush pass failed");
                    }
                }
                Some(session_id) = self.trigger_rx.recv() => {
                    if let Err(err) = self.bounded_flush_session(session_id).await {
                        tracing::error!(%session_id, error = %err, "ad hoc flush failed");
                    }
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }

        if let Err(err) = self.bounded_flush_once().await {
            tracing::error!(error = %err, "final flush pass on shutdown failed");
        }
    }

    async fn bounded_flush_once(&self) -> anyhow::Result<()> {
        match tokio::time::timeout(FLUSH_DEADLINE, self.flush_once()).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("flush pass exceeded {:?} deadline", FLUSH_DEADLINE),
        }
    }

    async fn bounded_flush_session(&self, session_id: Uuid) -> anyhow::Result<()> {
        match tokio::time::timeout(FLUSH_DEADLINE, self.flush_session(session_id)).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("session flush exceeded {:?} deadline", FLUSH_DEADLINE),
        }
    }

    /// One full pass: drain the dirty code set, then the dirty message set.
    pub async fn flush_once(&self) -> anyhow::Result<()> {
        self.flush_dirty_code().await?;
        self.flush_dirty_messages().await?;
        Ok(())
    }

    /// Flushes a single session's code and messages regardless of whether
    /// it is currently marked dirty in the scheduled sweep's view.
    async fn flush_session(&self, session_id: Uuid) -> anyhow::Result<()> {
        self.flush_one_code(session_id).await?;
        self.flush_one_message_list(session_id).await?;
        Ok(())
    }

    async fn flush_dirty_code(&self) -> anyhow::Result<()> {
        let dirty_ids = self.kv.smembers(DIRTY_SESSIONS_CODE).await?;
        for raw_id in dirty_ids {
            let Ok(session_id) = raw_id.parse::<Uuid>() else {
                tracing::warn!(raw_id, "skipping malformed dirty session id");
                continue;
            };
            self.flush_one_code(session_id).await?;
        }
        Ok(())
    }

    async fn flush_one_code(&self, session_id: Uuid) -> anyhow::Result<()> {
        let raw_id = session_id.to_string();
        let key = session_code_key(session_id);
        let Some(code) = self.kv.get(&key).await? else {
            // The key expired or was never written; just clear the
            // stale dirty marker.
            self.kv.unmark_dirty(DIRTY_SESSIONS_CODE, &raw_id).await?;
            return Ok(());
        };

        match self.durable.update_session_code(session_id, &code).await {
            Ok(()) => {
                self.kv.unmark_dirty(DIRTY_SESSIONS_CODE, &raw_id).await?;
            }
            Err(err) => {
                tracing::error!(%session_id, error = %err, "failed to flush session code, will retry next tick");
            }
        }
        Ok(())
    }

    async fn flush_dirty_messages(&self) -> anyhow::Result<()> {
        let dirty_ids = self.kv.smembers(DIRTY_SESSIONS_MESSAGES).await?;
        for raw_id in dirty_ids {
            let Ok(session_id) = raw_id.parse::<Uuid>() else {
                tracing::warn!(raw_id, "skipping malformed dirty session id");
                continue;
            };
            self.flush_one_message_list(session_id).await?;
        }
        Ok(())
    }

    async fn flush_one_message_list(&self, session_id: Uuid) -> anyhow::Result<()> {
        let raw_id = session_id.to_string();
        let key = session_messages_key(session_id);
        let drained = self
            .kv
            .drain_list_and_unmark(&key, DIRTY_SESSIONS_MESSAGES, &raw_id)
            .await?;

        for raw_message in drained {
            match serde_json::from_str::<Message>(&raw_message) {
                Ok(message) => {
                    if let Err(err) = self.durable.insert_message(message).await {
                        tracing::error!(%session_id, error = %err, "failed to persist buffered message, re-enqueuing");
                        if let Err(requeue_err) =
                            self.kv.rpush_and_mark_dirty(&key, &raw_message, DIRTY_SESSIONS_MESSAGES, &raw_id).await
                        {
                            tracing::error!(%session_id, error = %requeue_err, "failed to re-enqueue message after flush failure, message dropped");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(%session_id, error = %err, "dropping malformed buffered message");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::testing::InMemoryKv;
    use crate::model::{Message, MessageRole, MessageType};
    use crate::repo::testing::InMemoryRepo;

    /// A durable repository whose `insert_message` always fails, so the
    /// flusher's re-enqueue path can be exercised in isolation.
    #[derive(Default)]
    struct FailingInsertRepo {
        inner: InMemoryRepo,
    }

    #[async_trait::async_trait]
    impl SessionRepository for FailingInsertRepo {
        async fn create_session(&self, h: Option<Uuid>, d: bool) -> crate::error::CoreResult<crate::model::Session> {
            self.inner.create_session(h, d).await
        }
        async fn get_session(&self, id: Uuid) -> crate::error::CoreResult<Option<crate::model::Session>> {
            self.inner.get_session(id).await
        }
        async fn update_session_code(&self, id: Uuid, code: &str) -> crate::error::CoreResult<()> {
            self.inner.update_session_code(id, code).await
        }
        async fn end_session(&self, id: Uuid) -> crate::error::CoreResult<()> {
            self.inner.end_session(id).await
        }
        async fn list_discoverable(&self, l: i64, o: i64) -> crate::error::CoreResult<(Vec<crate::model::Session>, i64)> {
            self.inner.list_discoverable(l, o).await
        }
        async fn touch_last_activity(&self, id: Uuid) -> crate::error::CoreResult<()> {
            self.inner.touch_last_activity(id).await
        }
        async fn list_stale_sessions(&self, t: chrono::DateTime<chrono::Utc>) -> crate::error::CoreResult<Vec<crate::model::Session>> {
            self.inner.list_stale_sessions(t).await
        }
        async fn upsert_authenticated_participant(
            &self,
            s: Uuid,
            u: Uuid,
            n: &str,
            r: crate::model::ParticipantRole,
        ) -> crate::error::CoreResult<crate::model::Participant> {
            self.inner.upsert_authenticated_participant(s, u, n, r).await
        }
        async fn insert_anonymous_participant(
            &self,
            s: Uuid,
            n: &str,
            r: crate::model::ParticipantRole,
            e: chrono::DateTime<chrono::Utc>,
        ) -> crate::error::CoreResult<crate::model::Participant> {
            self.inner.insert_anonymous_participant(s, n, r, e).await
        }
        async fn list_combined_participants(&self, s: Uuid) -> crate::error::CoreResult<Vec<crate::model::Participant>> {
            self.inner.list_combined_participants(s).await
        }
        async fn remove_participant(&self, s: Uuid, u: Option<Uuid>) -> crate::error::CoreResult<()> {
            self.inner.remove_participant(s, u).await
        }
        async fn count_active_participants(&self, s: Uuid) -> crate::error::CoreResult<i64> {
            self.inner.count_active_participants(s).await
        }
        async fn mark_non_host_participants_left(&self, s: Uuid) -> crate::error::CoreResult<()> {
            self.inner.mark_non_host_participants_left(s).await
        }
        async fn create_invite_token(
            &self,
            s: Uuid,
            r: crate::model::ParticipantRole,
            m: Option<i32>,
            e: Option<chrono::DateTime<chrono::Utc>>,
        ) -> crate::error::CoreResult<crate::model::InviteToken> {
            self.inner.create_invite_token(s, r, m, e).await
        }
        async fn get_invite_token(&self, t: &str) -> crate::error::CoreResult<Option<crate::model::InviteToken>> {
            self.inner.get_invite_token(t).await
        }
        async fn increment_invite_uses(&self, t: &str) -> crate::error::CoreResult<()> {
            self.inner.increment_invite_uses(t).await
        }
        async fn revoke_all_tokens(&self, s: Uuid) -> crate::error::CoreResult<()> {
            self.inner.revoke_all_tokens(s).await
        }
        async fn insert_message(&self, _message: Message) -> crate::error::CoreResult<Message> {
            Err(crate::error::CoreError::Server("simulated durable-store failure".to_string()))
        }
        async fn list_messages(&self, s: Uuid, l: i64) -> crate::error::CoreResult<Vec<Message>> {
            self.inner.list_messages(s, l).await
        }
    }

    fn test_message(session_id: Uuid) -> Message {
        Message {
            id: None,
            session_id,
            user_id: None,
            role: MessageRole::User,
            message_type: MessageType::Chat,
            content: "hi".to_string(),
            display_name: Some("Ada".to_string()),
            avatar_url: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn flush_once_persists_dirty_code() {
        let durable = Arc::new(InMemoryRepo::new());
        let kv = Arc::new(InMemoryKv::new());
        let session = durable.create_session(None, false).await.unwrap();

        let key = session_code_key(session.id);
        kv.set_and_mark_dirty(&key, "fn main() {}", DIRTY_SESSIONS_CODE, &session.id.to_string())
            .await
            .unwrap();

        let (flusher, _trigger) = Flusher::new(Arc::clone(&durable), Arc::clone(&kv), Duration::from_secs(3600));
        flusher.flush_once().await.unwrap();

        let stored = durable.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.code, "fn main() {}");
        assert!(kv.smembers(DIRTY_SESSIONS_CODE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_message_insert_is_re_enqueued() {
        let durable = Arc::new(FailingInsertRepo::default());
        let kv = Arc::new(InMemoryKv::new());
        let session_id = Uuid::new_v4();
        let message = test_message(session_id);

        let key = session_messages_key(session_id);
        kv.rpush_and_mark_dirty(
            &key,
            &serde_json::to_string(&message).unwrap(),
            DIRTY_SESSIONS_MESSAGES,
            &session_id.to_string(),
        )
        .await
        .unwrap();

        let (flusher, _trigger) = Flusher::new(Arc::clone(&durable), Arc::clone(&kv), Duration::from_secs(3600));
        flusher.flush_once().await.unwrap();

        // The insert failed, so the message should have been pushed back
        // onto the list and the session re-marked dirty rather than lost.
        assert_eq!(kv.lrange_all(&key).await.unwrap().len(), 1);
        assert!(kv.smembers(DIRTY_SESSIONS_MESSAGES).await.unwrap().contains(&session_id.to_string()));
    }

    #[tokio::test]
    async fn trigger_flushes_one_session_ahead_of_schedule() {
        let durable = Arc::new(InMemoryRepo::new());
        let kv = Arc::new(InMemoryKv::new());
        let session = durable.create_session(None, false).await.unwrap();

        let key = session_code_key(session.id);
        kv.set_and_mark_dirty(&key, "let x = 1;", DIRTY_SESSIONS_CODE, &session.id.to_string())
            .await
            .unwrap();

        let (flusher, trigger) = Flusher::new(Arc::clone(&durable), Arc::clone(&kv), Duration::from_secs(3600));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(flusher.run(shutdown_rx));

        trigger.request_flush(session.id);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stored = durable.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.code, "let x = 1;");

        let _ = shutdown_tx.send(());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_performs_a_final_drain() {
        let durable = Arc::new(InMemoryRepo::new());
        let kv = Arc::new(InMemoryKv::new());
        let session = durable.create_session(None, false).await.unwrap();

        let key = session_code_key(session.id);
        kv.set_and_mark_dirty(&key, "final state", DIRTY_SESSIONS_CODE, &session.id.to_string())
            .await
            .unwrap();

        // A long interval so only the shutdown-triggered final drain,
        // not the ticker, could have flushed this.
        let (flusher, _trigger) = Flusher::new(Arc::clone(&durable), Arc::clone(&kv), Duration::from_secs(3600));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(flusher.run(shutdown_rx));

        let _ = shutdown_tx.send(());
        handle.await.unwrap();

        let stored = durable.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.code, "final state");
    }
}
