//! The hub: a single registry of connected clients shared across the
//! whole process, plus the operations (register/unregister/broadcast/
//! dispatch) that mutate it. The registry (`DashMap`-backed) gives
//! per-entry locking, so these methods never hold a lock across an
//! `.await` and the hub never blocks one session's traffic behind
//! another's.
//!
//! Incoming frames are dispatched to a typed [`handlers::Handler`] on a
//! spawned task, so a slow handler (a Postgres write, a detector pass)
//! can't stall the read pump that's feeding it.

mod handlers;
mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::client::{ClientHandle, InboundMessage};
use crate::flusher::FlushTrigger;
use crate::paste::Detector;
use crate::protocol::{
    Envelope, ServerShutdownPayload, SessionEndedPayload, UserJoinedPayload, UserLeftPayload,
    PasteLockChangedPayload, TYPE_CHAT_MESSAGE, TYPE_CODE_UPDATE, TYPE_PASTE_LOCK_CHANGED,
    TYPE_PING, TYPE_PLAY, TYPE_SERVER_SHUTDOWN, TYPE_SESSION_ENDED, TYPE_SESSION_STATE, TYPE_STOP,
    TYPE_USER_JOINED, TYPE_USER_LEFT,
};
use crate::repo::SessionRepository;

use handlers::{play_handler, stop_handler, ChatMessageHandler, CodeUpdateHandler, Handler, PingHandler};
use registry::ClientRegistry;

/// How long the hub waits after announcing a session end or a server
/// shutdown before it forcibly closes the affected connections, giving
/// the write pump a chance to actually deliver the announcement first.
const SESSION_END_QUIESCENCE: Duration = Duration::from_millis(200);
const SHUTDOWN_QUIESCENCE: Duration = Duration::from_millis(500);

pub struct Hub {
    registry: ClientRegistry,
    handlers: HashMap<&'static str, Arc<dyn Handler>>,
    pub repo: Arc<dyn SessionRepository>,
    pub detector: Arc<Detector>,
    max_user_connections: usize,
    max_ip_connections: usize,
    flush_trigger: Option<FlushTrigger>,
}

impl Hub {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        detector: Arc<Detector>,
        max_user_connections: usize,
        max_ip_connections: usize,
        flush_trigger: Option<FlushTrigger>,
    ) -> Self {
        let mut handlers: HashMap<&'static str, Arc<dyn Handler>> = HashMap::new();
        handlers.insert(TYPE_CODE_UPDATE, Arc::new(CodeUpdateHandler));
        handlers.insert(TYPE_CHAT_MESSAGE, Arc::new(ChatMessageHandler));
        handlers.insert(TYPE_PLAY, Arc::new(play_handler()));
        handlers.insert(TYPE_STOP, Arc::new(stop_handler()));
        handlers.insert(TYPE_PING, Arc::new(PingHandler));

        Self {
            registry: ClientRegistry::new(),
            handlers,
            repo,
            detector,
            max_user_connections,
            max_ip_connections,
            flush_trigger,
        }
    }

    /// Admission check the gateway runs before it even upgrades the
    /// socket: per-user and per-IP connection caps.
    pub fn can_accept_connection(&self, user_id: Option<Uuid>, ip: &str) -> bool {
        if let Some(user_id) = user_id {
            if self.registry.user_connection_count(user_id) >= self.max_user_connections {
                return false;
            }
        }
        self.registry.ip_connection_count(ip) < self.max_ip_connections
    }

    pub fn client_count(&self, session_id: Uuid) -> usize {
        self.registry.clients_in_session(session_id).len()
    }

    /// Registers a freshly upgraded client: inserts it into the registry,
    /// sends it a `session_state` snapshot, announces it to the rest of
    /// the session, and reports the session's current paste-lock state.
    pub async fn register(
        &self,
        handle: ClientHandle,
        code: String,
        chat_history: Vec<serde_json::Value>,
    ) {
        self.registry.insert(handle.clone());

        let participants: Vec<serde_json::Value> = self
            .registry
            .clients_in_session(handle.session_id)
            .iter()
            .map(|c| {
                serde_json::json!({
                    "user_id": c.user_id,
                    "display_name": c.display_name(),
                    "role": c.role().to_string(),
                })
            })
            .collect();

        let state = crate::protocol::SessionStatePayload {
            code,
            your_role: handle.role().to_string(),
            participants,
            chat_history,
        };
        let envelope = Envelope::new(TYPE_SESSION_STATE, handle.session_id, serde_json::json!(state));
        handle.send_envelope(&envelope);

        let joined = UserJoinedPayload {
            user_id: handle.user_id,
            display_name: handle.display_name(),
            role: handle.role().to_string(),
        };
        let joined_envelope = Envelope::new(TYPE_USER_JOINED, handle.session_id, serde_json::json!(joined))
            .with_user(handle.user_id);
        self.broadcast_to_session(handle.session_id, joined_envelope, Some(handle.client_id));

        self.report_lock_status(&handle).await;
    }

    async fn report_lock_status(&self, handle: &ClientHandle) {
        match self.detector.lock_status(handle.session_id).await {
            Ok(lock) => self.send_paste_lock_status(handle, lock.is_some(), None),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read paste lock status on register");
            }
        }
    }

    pub fn send_paste_lock_status(&self, handle: &ClientHandle, locked: bool, reason: Option<&str>) {
        let payload = PasteLockChangedPayload {
            locked,
            reason: reason.map(|s| s.to_string()),
        };
        let envelope = Envelope::new(TYPE_PASTE_LOCK_CHANGED, handle.session_id, serde_json::json!(payload));
        handle.send_envelope(&envelope);
    }

    /// Removes a client from the registry, announces its departure (if
    /// the session isn't now empty), and, if a flush trigger was wired
    /// up, asks the flusher to flush this session's buffered code right
    /// away rather than waiting for the next scheduled tick.
    pub async fn unregister(&self, session_id: Uuid, client_id: Uuid) {
        let (removed, became_empty) = self.registry.remove(session_id, client_id);
        let Some(handle) = removed else { return };
        handle.close();

        if !became_empty {
            let left = UserLeftPayload {
                user_id: handle.user_id,
                display_name: handle.display_name(),
            };
            let envelope = Envelope::new(TYPE_USER_LEFT, session_id, serde_json::json!(left)).with_user(handle.user_id);
            self.broadcast_to_session(session_id, envelope, None);
        }

        if let Some(trigger) = &self.flush_trigger {
            trigger.request_flush(session_id);
        }
    }

    /// Dispatches one inbound frame. Looks up the sending client and the
    /// handler for its message type and spawns the handler so this call
    /// never blocks the caller (the per-connection read pump).
    pub fn dispatch(self: &Arc<Self>, msg: InboundMessage) {
        let Some(client) = self.registry.get(msg.session_id, msg.client_id) else {
            return;
        };
        let Some(handler) = self.handlers.get(msg.message_type.as_str()).cloned() else {
            client.send_error("bad_request", format!("unknown message type: {}", msg.message_type));
            return;
        };

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            handler.handle(&hub, client, msg).await;
        });
    }

    /// Assigns the next sequence number for `session_id` and fans the
    /// envelope out to every connected client but `exclude`. A client
    /// whose outbound queue is already full is force-closed with a
    /// `buffer_overflow` error delivered on the priority control channel.
    pub fn broadcast_to_session(&self, session_id: Uuid, mut envelope: Envelope, exclude: Option<Uuid>) {
        envelope.seq = Some(self.registry.next_sequence(session_id));
        let Ok(text) = serde_json::to_string(&envelope) else {
            tracing::error!(%session_id, "failed to serialize outbound envelope");
            return;
        };

        for client in self.registry.clients_in_session(session_id) {
            if Some(client.client_id) == exclude {
                continue;
            }
            let frame = axum::extract::ws::Message::Text(text.clone());
            if !client.try_send(frame) {
                client.force_close_with_error("buffer_overflow", "outbound queue full");
            }
        }
    }

    /// Same as [`Hub::broadcast_to_session`], but only to clients who can
    /// currently write (host/co-author), for server-originated state that
    /// viewers don't need to react to.
    pub fn broadcast_to_writers(&self, session_id: Uuid, mut envelope: Envelope, exclude: Option<Uuid>) {
        envelope.seq = Some(self.registry.next_sequence(session_id));
        let Ok(text) = serde_json::to_string(&envelope) else {
            tracing::error!(%session_id, "failed to serialize outbound envelope");
            return;
        };

        for client in self.registry.clients_in_session(session_id) {
            if Some(client.client_id) == exclude || !client.can_write() {
                continue;
            }
            let frame = axum::extract::ws::Message::Text(text.clone());
            if !client.try_send(frame) {
                client.force_close_with_error("buffer_overflow", "outbound queue full");
            }
        }
    }

    /// Announces `session_ended`, waits briefly for delivery, then closes
    /// every connection in the session and drops its registry entry.
    /// Used by the cleanup service for inactivity sweeps.
    pub async fn end_session(&self, session_id: Uuid, reason: &str) {
        let payload = SessionEndedPayload {
            reason: Some(reason.to_string()),
        };
        let envelope = Envelope::new(TYPE_SESSION_ENDED, session_id, serde_json::json!(payload));
        self.broadcast_to_session(session_id, envelope, None);

        tokio::time::sleep(SESSION_END_QUIESCENCE).await;

        for client in self.registry.remove_session(session_id) {
            client.close_gracefully();
        }
    }

    /// Announces `server_shutdown` to every session, waits for delivery,
    /// then closes every connection and clears all hub state. Called once
    /// from the server's shutdown sequence.
    pub async fn shutdown(&self, reason: &str) {
        let payload = ServerShutdownPayload {
            reason: reason.to_string(),
        };
        for session_id in self.registry.session_ids() {
            let envelope = Envelope::new(TYPE_SERVER_SHUTDOWN, session_id, serde_json::json!(payload.clone()));
            self.broadcast_to_session(session_id, envelope, None);
        }

        tokio::time::sleep(SHUTDOWN_QUIESCENCE).await;

        for client in self.registry.clear() {
            client.close_gracefully();
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::lock::InMemoryLockStore;
    use crate::model::ParticipantRole;
    use crate::repo::testing::InMemoryRepo;

    fn test_hub() -> Arc<Hub> {
        let repo: Arc<dyn SessionRepository> = Arc::new(InMemoryRepo::new());
        let detector = Arc::new(Detector::new(Arc::new(InMemoryLockStore::new()), None, None));
        Arc::new(Hub::new(repo, detector, 100, 100, None))
    }

    fn test_client(session_id: Uuid, role: ParticipantRole) -> (ClientHandle, mpsc::Receiver<axum::extract::ws::Message>) {
        let (handle, rx, _ctrl_rx) = ClientHandle::new(
            Uuid::new_v4(),
            session_id,
            None,
            "Tester".to_string(),
            role,
            "127.0.0.1".to_string(),
        );
        (handle, rx)
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let hub = test_hub();
        let session_id = Uuid::new_v4();

        let (a, mut a_rx) = test_client(session_id, ParticipantRole::Host);
        let (b, mut b_rx) = test_client(session_id, ParticipantRole::Viewer);
        hub.register(a.clone(), String::new(), Vec::new()).await;
        hub.register(b.clone(), String::new(), Vec::new()).await;

        // Drain the session_state/user_joined/paste_lock_changed traffic
        // from registration before asserting on the broadcast under test.
        while a_rx.try_recv().is_ok() {}
        while b_rx.try_recv().is_ok() {}

        let envelope = Envelope::new(TYPE_CHAT_MESSAGE, session_id, serde_json::json!({"hello": "world"}));
        hub.broadcast_to_session(session_id, envelope, Some(a.client_id));

        assert!(a_rx.try_recv().is_err(), "excluded client should not receive the broadcast");
        let received = b_rx.try_recv().expect("non-excluded client should receive the broadcast");
        match received {
            axum::extract::ws::Message::Text(text) => assert!(text.contains("chat_message")),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_reports_unlocked_status() {
        let hub = test_hub();
        let session_id = Uuid::new_v4();
        let (client, mut rx) = test_client(session_id, ParticipantRole::Host);

        hub.register(client, String::new(), Vec::new()).await;

        let mut saw_lock_status = false;
        while let Ok(frame) = rx.try_recv() {
            if let axum::extract::ws::Message::Text(text) = frame {
                if text.contains("paste_lock_changed") {
                    saw_lock_status = true;
                    assert!(text.contains("\"locked\":false"));
                }
            }
        }
        assert!(saw_lock_status, "expected a paste_lock_changed frame on register");
    }

    #[tokio::test]
    async fn unregister_announces_departure_to_remaining_clients() {
        let hub = test_hub();
        let session_id = Uuid::new_v4();
        let (a, mut a_rx) = test_client(session_id, ParticipantRole::Host);
        let (b, mut b_rx) = test_client(session_id, ParticipantRole::Viewer);
        hub.register(a.clone(), String::new(), Vec::new()).await;
        hub.register(b.clone(), String::new(), Vec::new()).await;
        while a_rx.try_recv().is_ok() {}
        while b_rx.try_recv().is_ok() {}

        hub.unregister(session_id, a.client_id).await;

        let mut saw_user_left = false;
        while let Ok(frame) = b_rx.try_recv() {
            if let axum::extract::ws::Message::Text(text) = frame {
                if text.contains("user_left") {
                    saw_user_left = true;
                }
            }
        }
        assert!(saw_user_left, "remaining client should be told the other one left");
    }
}
