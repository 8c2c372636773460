//! Per-type message handlers. Each owns all side-effecting logic for its
//! message type: rate-limit check, permission check, payload decode,
//! state mutation, broadcast. Dispatched off the hub's loop so none of
//! this blocks other sessions' traffic.

use async_trait::async_trait;

use crate::client::{ClientHandle, InboundMessage};
use crate::protocol::{
    ChatMessagePayload, CodeUpdatePayload, Envelope, PlayStopPayload, TYPE_CHAT_MESSAGE, TYPE_PLAY,
    TYPE_PONG, TYPE_STOP,
};

use super::Hub;

/// Code updates above this many bytes are rejected outright rather than
/// buffered or broadcast.
const MAX_CODE_BYTES: usize = 100 * 1024;
/// Chat messages are capped by character count, not byte length.
const MAX_CHAT_CHARS: usize = 5000;

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, hub: &Hub, client: ClientHandle, msg: InboundMessage);
}

pub struct CodeUpdateHandler;

#[async_trait]
impl Handler for CodeUpdateHandler {
    async fn handle(&self, hub: &Hub, client: ClientHandle, msg: InboundMessage) {
        if !client.check_code_update_rate() {
            client.send_error("too_many_requests", "code_update rate limit exceeded");
            return;
        }
        if !client.can_write() {
            client.send_error("forbidden", "viewers cannot edit code");
            return;
        }

        let Ok(mut payload) = serde_json::from_value::<CodeUpdatePayload>(msg.payload.clone()) else {
            client.send_error("bad_request", "malformed code_update payload");
            return;
        };

        if payload.code.len() > MAX_CODE_BYTES {
            client.send_error("bad_request", "code exceeds maximum size");
            return;
        }

        let previous_code = match hub.repo.get_session(msg.session_id).await {
            Ok(Some(session)) => session.code,
            Ok(None) => {
                client.send_error("session_not_found", "session no longer exists");
                return;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to load session for code_update");
                client.send_error("server_error", "internal error");
                return;
            }
        };

        if let Err(err) = hub.repo.update_session_code(msg.session_id, &payload.code).await {
            tracing::error!(error = %err, "failed to write session code");
            client.send_error("server_error", "internal error");
            return;
        }

        let was_locked = hub
            .detector
            .lock_status(msg.session_id)
            .await
            .ok()
            .flatten()
            .is_some();

        match hub
            .detector
            .process_code_update(msg.session_id, msg.user_id, &previous_code, &payload.code)
            .await
        {
            Ok(result) => {
                let is_locked = hub
                    .detector
                    .lock_status(msg.session_id)
                    .await
                    .ok()
                    .flatten()
                    .is_some();
                if is_locked != was_locked {
                    hub.send_paste_lock_status(&client, is_locked, Some(result.reason.as_str()));
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "paste detection failed, continuing without lock update");
            }
        }

        payload.display_name = Some(client.display_name());
        let envelope = Envelope::new(
            msg.message_type.clone(),
            msg.session_id,
            serde_json::json!(payload),
        )
        .with_user(msg.user_id);

        hub.broadcast_to_session(msg.session_id, envelope, Some(client.client_id));
    }
}

pub struct ChatMessageHandler;

#[async_trait]
impl Handler for ChatMessageHandler {
    async fn handle(&self, hub: &Hub, client: ClientHandle, msg: InboundMessage) {
        if !client.check_chat_message_rate() {
            client.send_error("too_many_requests", "chat_message rate limit exceeded");
            return;
        }

        let Ok(mut payload) = serde_json::from_value::<ChatMessagePayload>(msg.payload.clone()) else {
            client.send_error("bad_request", "malformed chat_message payload");
            return;
        };

        if payload.message.is_empty() {
            client.send_error("bad_request", "chat message cannot be empty");
            return;
        }
        if payload.message.chars().count() > MAX_CHAT_CHARS {
            client.send_error("bad_request", "chat message exceeds maximum length");
            return;
        }

        payload.display_name = Some(client.display_name());

        let stored = crate::model::Message {
            id: None,
            session_id: msg.session_id,
            user_id: msg.user_id,
            role: crate::model::MessageRole::User,
            message_type: crate::model::MessageType::Chat,
            content: payload.message.clone(),
            display_name: payload.display_name.clone(),
            avatar_url: None,
            created_at: msg.timestamp,
        };

        if let Err(err) = hub.repo.insert_message(stored).await {
            tracing::error!(error = %err, "failed to buffer chat message");
            client.send_error("server_error", "internal error");
            return;
        }

        let envelope = Envelope::new(TYPE_CHAT_MESSAGE, msg.session_id, serde_json::json!(payload))
            .with_user(msg.user_id);
        hub.broadcast_to_session(msg.session_id, envelope, None);
    }
}

pub struct PlayStopHandler {
    pub message_type: &'static str,
}

#[async_trait]
impl Handler for PlayStopHandler {
    async fn handle(&self, hub: &Hub, client: ClientHandle, msg: InboundMessage) {
        if !client.can_write() {
            client.send_error("forbidden", "viewers cannot control playback");
            return;
        }

        let payload = PlayStopPayload {
            display_name: client.display_name(),
        };
        let envelope = Envelope::new(self.message_type, msg.session_id, serde_json::json!(payload))
            .with_user(msg.user_id);
        hub.broadcast_to_session(msg.session_id, envelope, None);
    }
}

pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, _hub: &Hub, client: ClientHandle, msg: InboundMessage) {
        let envelope = Envelope::new(TYPE_PONG, msg.session_id, serde_json::Value::Null);
        client.send_envelope(&envelope);
    }
}

pub fn play_handler() -> PlayStopHandler {
    PlayStopHandler { message_type: TYPE_PLAY }
}

pub fn stop_handler() -> PlayStopHandler {
    PlayStopHandler { message_type: TYPE_STOP }
}
