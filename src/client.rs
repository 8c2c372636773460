//! A connected client: the pair of cooperating tasks (read pump, write
//! pump) that own one WebSocket, plus the per-connection state the hub
//! and handlers consult (role, rate-limit buffers, outbound queue).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::ParticipantRole;
use crate::protocol::{Envelope, ErrorPayload, TYPE_ERROR};

pub const MAX_FRAME_BYTES: usize = 512 * 1024;
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;
pub const PONG_DEADLINE: Duration = Duration::from_secs(60);
pub const PING_INTERVAL: Duration = Duration::from_secs(54);
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

const CODE_UPDATE_LIMIT: usize = 10;
const CODE_UPDATE_WINDOW: Duration = Duration::from_secs(1);
const CHAT_MESSAGE_LIMIT: usize = 20;
const CHAT_MESSAGE_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window limiter: each check scans the timestamp buffer, drops
/// entries outside the window, rejects at the cap, otherwise appends `now`.
#[derive(Default)]
struct SlidingWindow {
    timestamps: Vec<Instant>,
}

impl SlidingWindow {
    fn check(&mut self, now: Instant, window: Duration, limit: usize) -> bool {
        self.timestamps.retain(|&t| now.duration_since(t) <= window);
        if self.timestamps.len() >= limit {
            return false;
        }
        self.timestamps.push(now);
        true
    }
}

struct RateLimiters {
    code_update: SlidingWindow,
    chat_message: SlidingWindow,
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self {
            code_update: SlidingWindow::default(),
            chat_message: SlidingWindow::default(),
        }
    }
}

/// A handle to a connected client, cheap to clone and shared between the
/// hub, the handlers, and the client's own tasks.
#[derive(Clone)]
pub struct ClientHandle {
    pub client_id: Uuid,
    pub session_id: Uuid,
    pub user_id: Option<Uuid>,
    pub display_name: Arc<Mutex<String>>,
    pub role: Arc<Mutex<ParticipantRole>>,
    pub ip: Arc<str>,
    outbound: mpsc::Sender<WsMessage>,
    control: mpsc::UnboundedSender<ControlMessage>,
    closed: Arc<AtomicBool>,
    rate_limiters: Arc<Mutex<RateLimiters>>,
}

/// A frame sent on the unbounded control channel, which the write pump
/// drains ahead of the regular outbound queue. Used for the one case
/// that must never be dropped by backpressure: telling a client why it
/// is being force-closed.
pub enum ControlMessage {
    Frame(WsMessage),
    Close,
}

impl ClientHandle {
    pub fn new(
        client_id: Uuid,
        session_id: Uuid,
        user_id: Option<Uuid>,
        display_name: String,
        role: ParticipantRole,
        ip: String,
    ) -> (Self, mpsc::Receiver<WsMessage>, mpsc::UnboundedReceiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let handle = Self {
            client_id,
            session_id,
            user_id,
            display_name: Arc::new(Mutex::new(display_name)),
            role: Arc::new(Mutex::new(role)),
            ip: ip.into(),
            outbound: tx,
            control: ctrl_tx,
            closed: Arc::new(AtomicBool::new(false)),
            rate_limiters: Arc::new(Mutex::new(RateLimiters::default())),
        };
        (handle, rx, ctrl_rx)
    }

    pub fn role(&self) -> ParticipantRole {
        *self.role.lock()
    }

    pub fn set_role(&self, role: ParticipantRole) {
        *self.role.lock() = role;
    }

    pub fn display_name(&self) -> String {
        self.display_name.lock().clone()
    }

    /// A writer is host or co-author.
    pub fn can_write(&self) -> bool {
        self.role().can_write()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the client closed. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn check_code_update_rate(&self) -> bool {
        let mut limiters = self.rate_limiters.lock();
        limiters.code_update.check(Instant::now(), CODE_UPDATE_WINDOW, CODE_UPDATE_LIMIT)
    }

    pub fn check_chat_message_rate(&self) -> bool {
        let mut limiters = self.rate_limiters.lock();
        limiters
            .chat_message
            .check(Instant::now(), CHAT_MESSAGE_WINDOW, CHAT_MESSAGE_LIMIT)
    }

    /// Non-blocking enqueue. Returns `false` if the outbound queue is
    /// full, signaling the caller to force-close the client.
    pub fn try_send(&self, message: WsMessage) -> bool {
        self.outbound.try_send(message).is_ok()
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match serde_json::to_string(envelope) {
            Ok(text) => self.try_send(WsMessage::Text(text)),
            Err(_) => false,
        }
    }

    pub fn send_error(&self, error: &str, message: impl Into<String>) {
        let payload = ErrorPayload::new(error, message);
        let envelope = Envelope::new(TYPE_ERROR, self.session_id, serde_json::json!(payload));
        self.send_envelope(&envelope);
    }

    /// Forces the connection closed, pushing one last error frame on the
    /// control channel first so it is delivered even if the regular
    /// outbound queue is already full. Used when `try_send` fails.
    pub fn force_close_with_error(&self, error: &str, message: impl Into<String>) {
        let payload = ErrorPayload::new(error, message);
        let envelope = Envelope::new(TYPE_ERROR, self.session_id, serde_json::json!(payload));
        if let Ok(text) = serde_json::to_string(&envelope) {
            let _ = self.control.send(ControlMessage::Frame(WsMessage::Text(text)));
        }
        let _ = self.control.send(ControlMessage::Close);
        self.close();
    }

    /// Closes the connection without an error frame, e.g. when a session
    /// ends normally.
    pub fn close_gracefully(&self) {
        let _ = self.control.send(ControlMessage::Close);
        self.close();
    }
}

/// A parsed, server-stamped inbound frame, ready for handler dispatch.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_type: String,
    pub client_id: Uuid,
    pub session_id: Uuid,
    pub user_id: Option<Uuid>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

/// Reads frames off the socket until the client disconnects or sends a
/// malformed/oversized frame. Forwards every valid frame to `dispatch`.
pub async fn run_read_pump(
    mut stream: SplitStream<WebSocket>,
    handle: ClientHandle,
    dispatch: mpsc::Sender<InboundMessage>,
) {
    loop {
        let next = tokio::time::timeout(PONG_DEADLINE, stream.next()).await;
        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(_))) | Ok(None) | Err(_) => break,
        };

        match frame {
            WsMessage::Text(text) => {
                if text.len() > MAX_FRAME_BYTES {
                    handle.send_error("bad_request", "frame too large");
                    continue;
                }
                let Ok(raw): Result<serde_json::Value, _> = serde_json::from_str(&text) else {
                    handle.send_error("bad_request", "malformed message");
                    continue;
                };
                let Some(message_type) = raw.get("type").and_then(|v| v.as_str()) else {
                    handle.send_error("bad_request", "missing message type");
                    continue;
                };
                let payload = raw.get("payload").cloned().unwrap_or(serde_json::Value::Null);

                let inbound = InboundMessage {
                    message_type: message_type.to_string(),
                    client_id: handle.client_id,
                    session_id: handle.session_id,
                    user_id: handle.user_id,
                    timestamp: chrono::Utc::now(),
                    payload,
                };
                if dispatch.send(inbound).await.is_err() {
                    break;
                }
            }
            WsMessage::Binary(bytes) if bytes.len() > MAX_FRAME_BYTES => {
                handle.send_error("bad_request", "frame too large");
            }
            WsMessage::Close(_) => break,
            // Ping/Pong/Binary frames refresh liveness implicitly via the
            // timeout above; nothing else to do with them.
            _ => {}
        }
    }

    handle.close();
}

/// Drains the outbound queue, coalescing backlog into one frame
/// separated by newlines, and sends periodic pings on `PING_INTERVAL`.
/// The control channel is drained with priority: it is how the hub
/// delivers a forced close even when the regular queue is saturated.
pub async fn run_write_pump(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<WsMessage>,
    mut control: mpsc::UnboundedReceiver<ControlMessage>,
) {
    let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
    ping_ticker.tick().await; // first tick fires immediately

    'outer: loop {
        tokio::select! {
            biased;

            ctrl = control.recv() => {
                match ctrl {
                    Some(ControlMessage::Frame(msg)) => {
                        if tokio::time::timeout(WRITE_DEADLINE, sink.send(msg)).await.is_err() {
                            break 'outer;
                        }
                    }
                    Some(ControlMessage::Close) | None => break 'outer,
                }
            }
            maybe_msg = outbound.recv() => {
                let Some(first) = maybe_msg else { break };
                let mut batch = vec![first];
                while let Ok(next) = outbound.try_recv() {
                    batch.push(next);
                }
                let coalesced = coalesce(batch);
                if tokio::time::timeout(WRITE_DEADLINE, sink.send(coalesced)).await.is_err() {
                    break;
                }
            }
            _ = ping_ticker.tick() => {
                if tokio::time::timeout(WRITE_DEADLINE, sink.send(WsMessage::Ping(Vec::new()))).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

fn coalesce(batch: Vec<WsMessage>) -> WsMessage {
    if batch.len() == 1 {
        return batch.into_iter().next().unwrap();
    }
    let joined = batch
        .into_iter()
        .filter_map(|msg| match msg {
            WsMessage::Text(text) => Some(text),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    WsMessage::Text(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sliding_window_rejects_at_cap() {
        let mut window = SlidingWindow::default();
        let now = Instant::now();
        for _ in 0..10 {
            assert!(window.check(now, Duration::from_secs(1), 10));
        }
        assert!(!window.check(now, Duration::from_secs(1), 10));
    }

    #[test]
    fn sliding_window_evicts_expired_entries() {
        let mut window = SlidingWindow::default();
        let t0 = Instant::now();
        for _ in 0..10 {
            assert!(window.check(t0, Duration::from_secs(1), 10));
        }
        let t1 = t0 + Duration::from_secs(2);
        assert!(window.check(t1, Duration::from_secs(1), 10));
    }

    #[test]
    fn can_write_matches_role() {
        let (handle, _rx, _ctrl_rx) = ClientHandle::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            "Anonymous Viewer".to_string(),
            ParticipantRole::Viewer,
            "127.0.0.1".to_string(),
        );
        assert!(!handle.can_write());
        handle.set_role(ParticipantRole::CoAuthor);
        assert!(handle.can_write());
    }
}
