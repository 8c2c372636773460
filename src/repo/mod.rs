//! Two-tier storage: a durable session repository backed by Postgres, and
//! a write-through buffered wrapper that hot-writes to the KV store and
//! asynchronously flushes.

mod buffered;
mod durable;

pub use buffered::BufferedRepository;
pub use durable::PgSessionRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::model::{InviteToken, Message, Participant, ParticipantRole, Session};

/// Durable (or write-through) session storage. Both the plain Postgres
/// repository and the buffered wrapper implement this, so handlers never
/// need to know which tier they're talking to.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create_session(&self, host_user_id: Option<Uuid>, is_discoverable: bool) -> CoreResult<Session>;
    async fn get_session(&self, session_id: Uuid) -> CoreResult<Option<Session>>;
    async fn update_session_code(&self, session_id: Uuid, code: &str) -> CoreResult<()>;
    async fn end_session(&self, session_id: Uuid) -> CoreResult<()>;
    async fn list_discoverable(&self, limit: i64, offset: i64) -> CoreResult<(Vec<Session>, i64)>;
    async fn touch_last_activity(&self, session_id: Uuid) -> CoreResult<()>;
    async fn list_stale_sessions(&self, threshold: DateTime<Utc>) -> CoreResult<Vec<Session>>;

    async fn upsert_authenticated_participant(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        display_name: &str,
        role: ParticipantRole,
    ) -> CoreResult<Participant>;
    async fn insert_anonymous_participant(
        &self,
        session_id: Uuid,
        display_name: &str,
        role: ParticipantRole,
        expires_at: DateTime<Utc>,
    ) -> CoreResult<Participant>;
    async fn list_combined_participants(&self, session_id: Uuid) -> CoreResult<Vec<Participant>>;
    async fn remove_participant(&self, session_id: Uuid, user_id: Option<Uuid>) -> CoreResult<()>;
    async fn count_active_participants(&self, session_id: Uuid) -> CoreResult<i64>;
    async fn mark_non_host_participants_left(&self, session_id: Uuid) -> CoreResult<()>;

    async fn create_invite_token(
        &self,
        session_id: Uuid,
        role: ParticipantRole,
        max_uses: Option<i32>,
        expires_at: Option<DateTime<Utc>>,
    ) -> CoreResult<InviteToken>;
    async fn get_invite_token(&self, token: &str) -> CoreResult<Option<InviteToken>>;
    async fn increment_invite_uses(&self, token: &str) -> CoreResult<()>;
    async fn revoke_all_tokens(&self, session_id: Uuid) -> CoreResult<()>;

    async fn insert_message(&self, message: Message) -> CoreResult<Message>;
    async fn list_messages(&self, session_id: Uuid, limit: i64) -> CoreResult<Vec<Message>>;

    /// Soft-end: revoke all invite tokens and mark non-host participants
    /// left, without touching `is_active`/`ended_at` (that's `end_session`).
    async fn soft_end(&self, session_id: Uuid) -> CoreResult<()> {
        self.revoke_all_tokens(session_id).await?;
        self.mark_non_host_participants_left(session_id).await?;
        Ok(())
    }
}

/// A minimal in-process `SessionRepository`, shared across this crate's
/// test modules (hub, cleanup, flusher, gateway) so each doesn't need to
/// hand-roll its own fake. Not a mock of Postgres semantics — just
/// enough bookkeeping for the behavior those tests actually exercise.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct InMemoryRepo {
        sessions: Mutex<std::collections::HashMap<Uuid, Session>>,
        messages: Mutex<Vec<Message>>,
        invites: Mutex<std::collections::HashMap<String, InviteToken>>,
    }

    impl InMemoryRepo {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, session: Session) {
            self.sessions.lock().unwrap().insert(session.id, session);
        }

        pub fn seed_invite(&self, invite: InviteToken) {
            self.invites.lock().unwrap().insert(invite.token.clone(), invite);
        }
    }

    #[async_trait]
    impl SessionRepository for InMemoryRepo {
        async fn create_session(&self, host_user_id: Option<Uuid>, is_discoverable: bool) -> CoreResult<Session> {
            let session = Session {
                id: Uuid::new_v4(),
                host_user_id,
                code: String::new(),
                is_active: true,
                is_discoverable,
                language: None,
                title: None,
                created_at: Utc::now(),
                ended_at: None,
                last_activity: Utc::now(),
            };
            self.sessions.lock().unwrap().insert(session.id, session.clone());
            Ok(session)
        }

        async fn get_session(&self, session_id: Uuid) -> CoreResult<Option<Session>> {
            Ok(self.sessions.lock().unwrap().get(&session_id).cloned())
        }

        async fn update_session_code(&self, session_id: Uuid, code: &str) -> CoreResult<()> {
            if let Some(session) = self.sessions.lock().unwrap().get_mut(&session_id) {
                session.code = code.to_string();
            }
            Ok(())
        }

        async fn end_session(&self, session_id: Uuid) -> CoreResult<()> {
            if let Some(session) = self.sessions.lock().unwrap().get_mut(&session_id) {
                session.is_active = false;
                session.ended_at = Some(Utc::now());
            }
            Ok(())
        }

        async fn list_discoverable(&self, _limit: i64, _offset: i64) -> CoreResult<(Vec<Session>, i64)> {
            let sessions: Vec<Session> = self
                .sessions
                .lock()
                .unwrap()
                .values()
                .filter(|s| s.is_discoverable && s.is_active)
                .cloned()
                .collect();
            let total = sessions.len() as i64;
            Ok((sessions, total))
        }

        async fn touch_last_activity(&self, session_id: Uuid) -> CoreResult<()> {
            if let Some(session) = self.sessions.lock().unwrap().get_mut(&session_id) {
                session.last_activity = Utc::now();
            }
            Ok(())
        }

        async fn list_stale_sessions(&self, threshold: DateTime<Utc>) -> CoreResult<Vec<Session>> {
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .values()
                .filter(|s| s.is_active && s.last_activity < threshold)
                .cloned()
                .collect())
        }

        async fn upsert_authenticated_participant(
            &self,
            session_id: Uuid,
            user_id: Uuid,
            display_name: &str,
            role: ParticipantRole,
        ) -> CoreResult<Participant> {
            Ok(Participant {
                session_id,
                user_id: Some(user_id),
                display_name: display_name.to_string(),
                role,
                status: crate::model::ParticipantStatus::Active,
                joined_at: Utc::now(),
                left_at: None,
                expires_at: None,
            })
        }

        async fn insert_anonymous_participant(
            &self,
            session_id: Uuid,
            display_name: &str,
            role: ParticipantRole,
            expires_at: DateTime<Utc>,
        ) -> CoreResult<Participant> {
            Ok(Participant {
                session_id,
                user_id: None,
                display_name: display_name.to_string(),
                role,
                status: crate::model::ParticipantStatus::Active,
                joined_at: Utc::now(),
                left_at: None,
                expires_at: Some(expires_at),
            })
        }

        async fn list_combined_participants(&self, _session_id: Uuid) -> CoreResult<Vec<Participant>> {
            Ok(Vec::new())
        }

        async fn remove_participant(&self, _session_id: Uuid, _user_id: Option<Uuid>) -> CoreResult<()> {
            Ok(())
        }

        async fn count_active_participants(&self, _session_id: Uuid) -> CoreResult<i64> {
            Ok(0)
        }

        async fn mark_non_host_participants_left(&self, _session_id: Uuid) -> CoreResult<()> {
            Ok(())
        }

        async fn create_invite_token(
            &self,
            session_id: Uuid,
            role: ParticipantRole,
            max_uses: Option<i32>,
            expires_at: Option<DateTime<Utc>>,
        ) -> CoreResult<InviteToken> {
            let invite = InviteToken {
                token: Uuid::new_v4().to_string(),
                session_id,
                role,
                max_uses,
                uses_count: 0,
                expires_at,
                created_at: Utc::now(),
            };
            self.invites.lock().unwrap().insert(invite.token.clone(), invite.clone());
            Ok(invite)
        }

        async fn get_invite_token(&self, token: &str) -> CoreResult<Option<InviteToken>> {
            Ok(self.invites.lock().unwrap().get(token).cloned())
        }

        async fn increment_invite_uses(&self, token: &str) -> CoreResult<()> {
            if let Some(invite) = self.invites.lock().unwrap().get_mut(token) {
                invite.uses_count += 1;
            }
            Ok(())
        }

        async fn revoke_all_tokens(&self, session_id: Uuid) -> CoreResult<()> {
            self.invites.lock().unwrap().retain(|_, inv| inv.session_id != session_id);
            Ok(())
        }

        async fn insert_message(&self, message: Message) -> CoreResult<Message> {
            let with_id = Message {
                id: Some(message.id.unwrap_or_else(Uuid::new_v4)),
                ..message
            };
            self.messages.lock().unwrap().push(with_id.clone());
            Ok(with_id)
        }

        async fn list_messages(&self, session_id: Uuid, limit: i64) -> CoreResult<Vec<Message>> {
            Ok(self
                .messages
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.session_id == session_id)
                .take(limit.max(0) as usize)
                .cloned()
                .collect())
        }
    }
}
