//! Postgres-backed durable session repository: idempotent `migrate()`,
//! raw `sqlx::query` + manual binds rather than compile-time `query!`
//! macros (so this compiles without a live database at build time).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::model::{
    InviteToken, Message, MessageRole, MessageType, Participant, ParticipantRole,
    ParticipantStatus, Session,
};

use super::SessionRepository;

#[derive(Clone)]
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent schema setup: additive `CREATE TABLE IF NOT EXISTS` /
    /// `ADD COLUMN IF NOT EXISTS` statements, safe to run on every boot.
    pub async fn migrate(&self) -> CoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id UUID PRIMARY KEY,
                host_user_id UUID,
                code TEXT NOT NULL DEFAULT '',
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                is_discoverable BOOLEAN NOT NULL DEFAULT FALSE,
                language TEXT,
                title TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                ended_at TIMESTAMPTZ,
                last_activity TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS authenticated_participants (
                session_id UUID NOT NULL REFERENCES sessions(id),
                user_id UUID NOT NULL,
                display_name TEXT NOT NULL,
                role TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                joined_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                left_at TIMESTAMPTZ,
                UNIQUE (session_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS anonymous_participants (
                id UUID PRIMARY KEY,
                session_id UUID NOT NULL REFERENCES sessions(id),
                display_name TEXT NOT NULL,
                role TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                joined_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                left_at TIMESTAMPTZ,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS invite_tokens (
                token TEXT PRIMARY KEY,
                session_id UUID NOT NULL REFERENCES sessions(id),
                role TEXT NOT NULL,
                max_uses INTEGER,
                uses_count INTEGER NOT NULL DEFAULT 0,
                expires_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id UUID PRIMARY KEY,
                session_id UUID NOT NULL REFERENCES sessions(id),
                user_id UUID,
                role TEXT NOT NULL,
                message_type TEXT NOT NULL,
                content TEXT NOT NULL,
                display_name TEXT,
                avatar_url TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::debug!("session repository tables migrated");
        Ok(())
    }
}

fn role_to_str(role: ParticipantRole) -> &'static str {
    match role {
        ParticipantRole::Host => "host",
        ParticipantRole::CoAuthor => "co-author",
        ParticipantRole::Viewer => "viewer",
    }
}

fn role_from_str(s: &str) -> ParticipantRole {
    s.parse().unwrap_or(ParticipantRole::Viewer)
}

fn status_from_str(s: &str) -> ParticipantStatus {
    match s {
        "left" => ParticipantStatus::Left,
        _ => ParticipantStatus::Active,
    }
}

fn status_to_str(s: ParticipantStatus) -> &'static str {
    match s {
        ParticipantStatus::Active => "active",
        ParticipantStatus::Left => "left",
    }
}

fn message_role_to_str(r: MessageRole) -> &'static str {
    match r {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn message_role_from_str(s: &str) -> MessageRole {
    match s {
        "assistant" => MessageRole::Assistant,
        _ => MessageRole::User,
    }
}

fn message_type_to_str(t: MessageType) -> &'static str {
    match t {
        MessageType::UserPrompt => "user_prompt",
        MessageType::AiResponse => "ai_response",
        MessageType::Chat => "chat",
    }
}

fn message_type_from_str(s: &str) -> MessageType {
    match s {
        "user_prompt" => MessageType::UserPrompt,
        "ai_response" => MessageType::AiResponse,
        _ => MessageType::Chat,
    }
}

fn session_from_row(row: &sqlx::postgres::PgRow) -> Session {
    Session {
        id: row.get("id"),
        host_user_id: row.get("host_user_id"),
        code: row.get("code"),
        is_active: row.get("is_active"),
        is_discoverable: row.get("is_discoverable"),
        language: row.get("language"),
        title: row.get("title"),
        created_at: row.get("created_at"),
        ended_at: row.get("ended_at"),
        last_activity: row.get("last_activity"),
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn create_session(&self, host_user_id: Option<Uuid>, is_discoverable: bool) -> CoreResult<Session> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO sessions (id, host_user_id, code, is_active, is_discoverable, created_at, last_activity)
            VALUES ($1, $2, '', TRUE, $3, $4, $4)
            "#,
        )
        .bind(id)
        .bind(host_user_id)
        .bind(is_discoverable)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Session {
            id,
            host_user_id,
            code: String::new(),
            is_active: true,
            is_discoverable,
            language: None,
            title: None,
            created_at: now,
            ended_at: None,
            last_activity: now,
        })
    }

    async fn get_session(&self, session_id: Uuid) -> CoreResult<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(session_from_row))
    }

    async fn update_session_code(&self, session_id: Uuid, code: &str) -> CoreResult<()> {
        sqlx::query("UPDATE sessions SET code = $1 WHERE id = $2")
            .bind(code)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn end_session(&self, session_id: Uuid) -> CoreResult<()> {
        sqlx::query(
            "UPDATE sessions SET is_active = FALSE, ended_at = now() WHERE id = $1 AND is_active = TRUE",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_discoverable(&self, limit: i64, offset: i64) -> CoreResult<(Vec<Session>, i64)> {
        let total: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM sessions WHERE is_active = TRUE AND is_discoverable = TRUE",
        )
        .fetch_one(&self.pool)
        .await?
        .try_get("count")?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM sessions
            WHERE is_active = TRUE AND is_discoverable = TRUE
            ORDER BY last_activity DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((rows.iter().map(session_from_row).collect(), total))
    }

    async fn touch_last_activity(&self, session_id: Uuid) -> CoreResult<()> {
        sqlx::query("UPDATE sessions SET last_activity = now() WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_stale_sessions(&self, threshold: DateTime<Utc>) -> CoreResult<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE is_active = TRUE AND last_activity < $1")
            .bind(threshold)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    async fn upsert_authenticated_participant(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        display_name: &str,
        role: ParticipantRole,
    ) -> CoreResult<Participant> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO authenticated_participants (session_id, user_id, display_name, role, status, joined_at)
            VALUES ($1, $2, $3, $4, 'active', $5)
            ON CONFLICT (session_id, user_id) DO UPDATE SET
                status = 'active',
                display_name = EXCLUDED.display_name,
                role = EXCLUDED.role,
                joined_at = EXCLUDED.joined_at,
                left_at = NULL
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(display_name)
        .bind(role_to_str(role))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Participant {
            session_id,
            user_id: Some(user_id),
            display_name: display_name.to_string(),
            role,
            status: crate::model::ParticipantStatus::Active,
            joined_at: now,
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
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO anonymous_participants (id, session_id, display_name, role, status, joined_at, expires_at)
            VALUES ($1, $2, $3, $4, 'active', $5, $6)
            "#,
        )
        .bind(id)
        .bind(session_id)
        .bind(display_name)
        .bind(role_to_str(role))
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(Participant {
            session_id,
            user_id: None,
            display_name: display_name.to_string(),
            role,
            status: crate::model::ParticipantStatus::Active,
            joined_at: now,
            left_at: None,
            expires_at: Some(expires_at),
        })
    }

    async fn list_combined_participants(&self, session_id: Uuid) -> CoreResult<Vec<Participant>> {
        let mut out = Vec::new();

        let auth_rows = sqlx::query(
            "SELECT user_id, display_name, role, status, joined_at, left_at FROM authenticated_participants WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        for row in &auth_rows {
            out.push(Participant {
                session_id,
                user_id: Some(row.get("user_id")),
                display_name: row.get("display_name"),
                role: role_from_str(row.get::<String, _>("role").as_str()),
                status: status_from_str(row.get::<String, _>("status").as_str()),
                joined_at: row.get("joined_at"),
                left_at: row.get("left_at"),
                expires_at: None,
            });
        }

        let anon_rows = sqlx::query(
            "SELECT display_name, role, status, joined_at, left_at, expires_at FROM anonymous_participants WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        for row in &anon_rows {
            out.push(Participant {
                session_id,
                user_id: None,
                display_name: row.get("display_name"),
                role: role_from_str(row.get::<String, _>("role").as_str()),
                status: status_from_str(row.get::<String, _>("status").as_str()),
                joined_at: row.get("joined_at"),
                left_at: row.get("left_at"),
                expires_at: Some(row.get("expires_at")),
            });
        }

        Ok(out)
    }

    async fn remove_participant(&self, session_id: Uuid, user_id: Option<Uuid>) -> CoreResult<()> {
        // Tries the authenticated table first, falls back to anonymous.
        if let Some(user_id) = user_id {
            let result = sqlx::query(
                "UPDATE authenticated_participants SET status = 'left', left_at = now() WHERE session_id = $1 AND user_id = $2",
            )
            .bind(session_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() > 0 {
                return Ok(());
            }
        }

        sqlx::query(
            "UPDATE anonymous_participants SET status = 'left', left_at = now() WHERE session_id = $1 AND status = 'active'",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_active_participants(&self, session_id: Uuid) -> CoreResult<i64> {
        let auth_count: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM authenticated_participants WHERE session_id = $1 AND status = 'active'",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?
        .try_get("count")?;

        let anon_count: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM anonymous_participants WHERE session_id = $1 AND status = 'active'",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?
        .try_get("count")?;

        Ok(auth_count + anon_count)
    }

    async fn mark_non_host_participants_left(&self, session_id: Uuid) -> CoreResult<()> {
        let session = self.get_session(session_id).await?;
        let host_user_id = session.and_then(|s| s.host_user_id);

        sqlx::query(
            r#"
            UPDATE authenticated_participants
            SET status = 'left', left_at = now()
            WHERE session_id = $1 AND status = 'active' AND user_id IS DISTINCT FROM $2
            "#,
        )
        .bind(session_id)
        .bind(host_user_id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "UPDATE anonymous_participants SET status = 'left', left_at = now() WHERE session_id = $1 AND status = 'active'",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_invite_token(
        &self,
        session_id: Uuid,
        role: ParticipantRole,
        max_uses: Option<i32>,
        expires_at: Option<DateTime<Utc>>,
    ) -> CoreResult<InviteToken> {
        let token = generate_invite_token();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO invite_tokens (token, session_id, role, max_uses, uses_count, expires_at, created_at)
            VALUES ($1, $2, $3, $4, 0, $5, $6)
            "#,
        )
        .bind(&token)
        .bind(session_id)
        .bind(role_to_str(role))
        .bind(max_uses)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(InviteToken {
            token,
            session_id,
            role,
            max_uses,
            uses_count: 0,
            expires_at,
            created_at: now,
        })
    }

    async fn get_invite_token(&self, token: &str) -> CoreResult<Option<InviteToken>> {
        let row = sqlx::query("SELECT * FROM invite_tokens WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| InviteToken {
            token: row.get("token"),
            session_id: row.get("session_id"),
            role: role_from_str(row.get::<String, _>("role").as_str()),
            max_uses: row.get("max_uses"),
            uses_count: row.get("uses_count"),
            expires_at: row.get("expires_at"),
            created_at: row.get("created_at"),
        }))
    }

    async fn increment_invite_uses(&self, token: &str) -> CoreResult<()> {
        sqlx::query("UPDATE invite_tokens SET uses_count = uses_count + 1 WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn revoke_all_tokens(&self, session_id: Uuid) -> CoreResult<()> {
        sqlx::query("DELETE FROM invite_tokens WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_message(&self, message: Message) -> CoreResult<Message> {
        let id = message.id.unwrap_or_else(Uuid::new_v4);
        sqlx::query(
            r#"
            INSERT INTO messages (id, session_id, user_id, role, message_type, content, display_name, avatar_url, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(message.session_id)
        .bind(message.user_id)
        .bind(message_role_to_str(message.role))
        .bind(message_type_to_str(message.message_type))
        .bind(&message.content)
        .bind(&message.display_name)
        .bind(&message.avatar_url)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        Ok(Message {
            id: Some(id),
            ..message
        })
    }

    async fn list_messages(&self, session_id: Uuid, limit: i64) -> CoreResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = $1 ORDER BY created_at ASC LIMIT $2",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Message {
                id: row.get("id"),
                session_id: row.get("session_id"),
                user_id: row.get("user_id"),
                role: message_role_from_str(row.get::<String, _>("role").as_str()),
                message_type: message_type_from_str(row.get::<String, _>("message_type").as_str()),
                content: row.get("content"),
                display_name: row.get("display_name"),
                avatar_url: row.get("avatar_url"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

/// 32 cryptographically random bytes, hex-encoded.
fn generate_invite_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
