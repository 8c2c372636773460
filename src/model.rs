//! Core entities. Plain serde-derived structs; no ORM macros — the
//! durable repository hand-maps rows, keeping data shape and persistence
//! cleanly separated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub host_user_id: Option<Uuid>,
    pub code: String,
    pub is_active: bool,
    pub is_discoverable: bool,
    pub language: Option<String>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// `is_active=false ⇒ ended_at` is set.
    pub fn invariant_holds(&self) -> bool {
        self.is_active || self.ended_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Host,
    CoAuthor,
    Viewer,
}

impl ParticipantRole {
    /// A writer is host or co-author.
    pub fn can_write(self) -> bool {
        matches!(self, ParticipantRole::Host | ParticipantRole::CoAuthor)
    }
}

impl std::fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParticipantRole::Host => "host",
            ParticipantRole::CoAuthor => "co-author",
            ParticipantRole::Viewer => "viewer",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ParticipantRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(ParticipantRole::Host),
            "co-author" => Ok(ParticipantRole::CoAuthor),
            "viewer" => Ok(ParticipantRole::Viewer),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Active,
    Left,
}

/// Combined view over authenticated + anonymous participants, preserving
/// origin via a nullable `user_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub session_id: Uuid,
    pub user_id: Option<Uuid>,
    pub display_name: String,
    pub role: ParticipantRole,
    pub status: ParticipantStatus,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    /// Only set for anonymous participants.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteToken {
    pub token: String,
    pub session_id: Uuid,
    pub role: ParticipantRole,
    pub max_uses: Option<i32>,
    pub uses_count: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl InviteToken {
    /// Valid when `expires_at IS NULL OR > now` AND
    /// `max_uses IS NULL OR uses_count < max_uses`.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        let not_expired = self.expires_at.map(|exp| exp > now).unwrap_or(true);
        let has_uses_left = self
            .max_uses
            .map(|max| self.uses_count < max)
            .unwrap_or(true);
        not_expired && has_uses_left
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    UserPrompt,
    AiResponse,
    Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Option<Uuid>,
    pub session_id: Uuid,
    pub user_id: Option<Uuid>,
    pub role: MessageRole,
    pub message_type: MessageType,
    pub content: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasteLock {
    pub session_id: Uuid,
    pub baseline_code: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Author-declared consent signal for AI use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CcSignal {
    CcCr,
    CcDc,
    CcEc,
    CcOp,
    NoAi,
}

impl CcSignal {
    /// This method only ever sees a concrete variant — "unknown" is
    /// represented by `Option<CcSignal>` at call sites and handled there,
    /// since the default-resolution rule differs by call site.
    pub fn allows_ai(self) -> bool {
        !matches!(self, CcSignal::NoAi)
    }
}

/// Resolve an optional signal using the default-permissive rule used by
/// similarity and ownership checks: a missing or unrecognized signal
/// allows AI use.
pub fn allows_ai_permissive_default(signal: Option<CcSignal>) -> bool {
    signal.map(CcSignal::allows_ai).unwrap_or(true)
}

/// Resolve an optional signal using the default-restrictive rule used by
/// the public-exact-match check: a missing or unrecognized signal is
/// treated as `no-ai`.
pub fn allows_ai_restrictive_default(signal: Option<CcSignal>) -> bool {
    signal.map(CcSignal::allows_ai).unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub id: Uuid,
    pub fingerprint: u64,
    pub work_id: Uuid,
    pub creator_id: Option<Uuid>,
    pub cc_signal: CcSignal,
    pub content_length: usize,
}

impl FingerprintRecord {
    /// Only `no-ai` works of at least 200 chars are indexed.
    pub fn should_index(cc_signal: CcSignal, content_length: usize) -> bool {
        matches!(cc_signal, CcSignal::NoAi) && content_length >= 200
    }
}
