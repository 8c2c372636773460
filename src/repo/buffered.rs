//! Write-through wrapper: hot-writes go to the KV store and mark the
//! session dirty; the periodic flusher is what actually durably persists
//! them. Reads merge the hot value over the durable one when present, so
//! a reader never sees stale code between writes and the next flush.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::kv::{session_code_key, session_messages_key, KvStore, DIRTY_SESSIONS_CODE, DIRTY_SESSIONS_MESSAGES};
use crate::model::{InviteToken, Message, Participant, ParticipantRole, Session};

use super::SessionRepository;

pub struct BufferedRepository<R, K> {
    durable: R,
    kv: K,
}

impl<R, K> BufferedRepository<R, K>
where
    R: SessionRepository,
    K: KvStore,
{
    pub fn new(durable: R, kv: K) -> Self {
        Self { durable, kv }
    }
}

#[async_trait]
impl<R, K> SessionRepository for BufferedRepository<R, K>
where
    R: SessionRepository,
    K: KvStore,
{
    async fn create_session(&self, host_user_id: Option<Uuid>, is_discoverable: bool) -> CoreResult<Session> {
        self.durable.create_session(host_user_id, is_discoverable).await
    }

    async fn get_session(&self, session_id: Uuid) -> CoreResult<Option<Session>> {
        let Some(mut session) = self.durable.get_session(session_id).await? else {
            return Ok(None);
        };

        // The hot code value, if present, is newer than whatever is on
        // disk — it hasn't been flushed yet.
        if let Some(hot_code) = self.kv.get(&session_code_key(session_id)).await? {
            session.code = hot_code;
        }

        Ok(Some(session))
    }

    async fn update_session_code(&self, session_id: Uuid, code: &str) -> CoreResult<()> {
        let key = session_code_key(session_id);
        match self
            .kv
            .set_and_mark_dirty(&key, code, DIRTY_SESSIONS_CODE, &session_id.to_string())
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                // The hot cache is unavailable: fall back to writing the
                // durable store directly rather than silently dropping
                // the edit.
                tracing::warn!(%session_id, error = %err, "kv write-through failed, falling back to durable store");
                self.durable.update_session_code(session_id, code).await
            }
        }
    }

    async fn end_session(&self, session_id: Uuid) -> CoreResult<()> {
        self.durable.end_session(session_id).await
    }

    async fn list_discoverable(&self, limit: i64, offset: i64) -> CoreResult<(Vec<Session>, i64)> {
        self.durable.list_discoverable(limit, offset).await
    }

    async fn touch_last_activity(&self, session_id: Uuid) -> CoreResult<()> {
        self.durable.touch_last_activity(session_id).await
    }

    async fn list_stale_sessions(&self, threshold: DateTime<Utc>) -> CoreResult<Vec<Session>> {
        self.durable.list_stale_sessions(threshold).await
    }

    async fn upsert_authenticated_participant(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        display_name: &str,
        role: ParticipantRole,
    ) -> CoreResult<Participant> {
        self.durable
            .upsert_authenticated_participant(session_id, user_id, display_name, role)
            .await
    }

    async fn insert_anonymous_participant(
        &self,
        session_id: Uuid,
        display_name: &str,
        role: ParticipantRole,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<Participant> {
        self.durable
            .insert_anonymous_participant(session_id, display_name, role, expires_at)
            .await
    }

    async fn list_combined_participants(&self, session_id: Uuid) -> CoreResult<Vec<Participant>> {
        self.durable.list_combined_participants(session_id).await
    }

    async fn remove_participant(&self, session_id: Uuid, user_id: Option<Uuid>) -> CoreResult<()> {
        self.durable.remove_participant(session_id, user_id).await
    }

    async fn count_active_participants(&self, session_id: Uuid) -> CoreResult<i64> {
        self.durable.count_active_participants(session_id).await
    }

    async fn mark_non_host_participants_left(&self, session_id: Uuid) -> CoreResult<()> {
        self.durable.mark_non_host_participants_left(session_id).await
    }

    async fn create_invite_token(
        &self,
        session_id: Uuid,
        role: ParticipantRole,
        max_uses: Option<i32>,
        expires_at: Option<DateTime<Utc>>,
    ) -> CoreResult<InviteToken> {
        self.durable
            .create_invite_token(session_id, role, max_uses, expires_at)
            .await
    }

    async fn get_invite_token(&self, token: &str) -> CoreResult<Option<InviteToken>> {
        self.durable.get_invite_token(token).await
    }

    async fn increment_invite_uses(&self, token: &str) -> CoreResult<()> {
        self.durable.increment_invite_uses(token).await
    }

    async fn revoke_all_tokens(&self, session_id: Uuid) -> CoreResult<()> {
        self.durable.revoke_all_tokens(session_id).await
    }

    async fn insert_message(&self, message: Message) -> CoreResult<Message> {
        // Chat messages are appended hot and flushed in batches; the
        // caller gets back an assigned id immediately without waiting on
        // the durable write.
        let id = message.id.unwrap_or_else(Uuid::new_v4);
        let with_id = Message { id: Some(id), ..message };
        let serialized = serde_json::to_string(&with_id).map_err(|e| {
            crate::error::CoreError::Server(format!("failed to serialize message: {e}"))
        })?;

        let key = session_messages_key(with_id.session_id);
        match self
            .kv
            .rpush_and_mark_dirty(&key, &serialized, DIRTY_SESSIONS_MESSAGES, &with_id.session_id.to_string())
            .await
        {
            Ok(()) => Ok(with_id),
            Err(err) => {
                tracing::warn!(session_id = %with_id.session_id, error = %err, "kv write-through failed for message, falling back to durable store");
                self.durable.insert_message(with_id).await
            }
        }
    }

    async fn list_messages(&self, session_id: Uuid, limit: i64) -> CoreResult<Vec<Message>> {
        // Durable messages come first (oldest), then any not-yet-flushed
        // hot messages are appended in arrival order.
        let mut messages = self.durable.list_messages(session_id, limit).await?;

        let key = session_messages_key(session_id);
        let hot_raw = self.kv.lrange_all(&key).await.unwrap_or_default();
        for raw in hot_raw {
            if let Ok(message) = serde_json::from_str::<Message>(&raw) {
                messages.push(message);
            }
        }

        if messages.len() as i64 > limit {
            let start = messages.len() - limit as usize;
            messages = messages.split_off(start);
        }

        Ok(messages)
    }
}
