//! Wire-level message protocol: the envelope every frame is wrapped in,
//! the payload for each recognized message type, and the handler
//! registry the hub dispatches through.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The envelope every inbound and outbound frame is wrapped in.
/// `client_id` is server-internal and never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub session_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub payload: Value,
}

impl Envelope {
    pub fn new(message_type: impl Into<String>, session_id: Uuid, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            session_id,
            user_id: None,
            timestamp: chrono::Utc::now(),
            seq: None,
            payload,
        }
    }

    pub fn with_user(mut self, user_id: Option<Uuid>) -> Self {
        self.user_id = user_id;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeUpdatePayload {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_col: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserJoinedPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub display_name: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLeftPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayStopPayload {
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatePayload {
    pub code: String,
    pub your_role: String,
    pub participants: Vec<Value>,
    pub chat_history: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEndedPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerShutdownPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasteLockChangedPayload {
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorPayload {
    pub fn new(error: &str, message: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            message: message.into(),
            details: None,
            request_id: None,
        }
    }
}

pub const TYPE_CODE_UPDATE: &str = "code_update";
pub const TYPE_USER_JOINED: &str = "user_joined";
pub const TYPE_USER_LEFT: &str = "user_left";
pub const TYPE_CHAT_MESSAGE: &str = "chat_message";
pub const TYPE_PLAY: &str = "play";
pub const TYPE_STOP: &str = "stop";
pub const TYPE_SESSION_STATE: &str = "session_state";
pub const TYPE_SESSION_ENDED: &str = "session_ended";
pub const TYPE_SERVER_SHUTDOWN: &str = "server_shutdown";
pub const TYPE_PING: &str = "ping";
pub const TYPE_PONG: &str = "pong";
pub const TYPE_PASTE_LOCK_CHANGED: &str = "paste_lock_changed";
pub const TYPE_ERROR: &str = "error";
