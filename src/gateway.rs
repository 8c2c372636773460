//! The connection gateway: turns an incoming WebSocket upgrade into a
//! registered, role-resolved client. All admission logic (who gets in,
//! as what role) lives here so the hub never has to second-guess a
//! client's identity once it's registered.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::{self, ClientHandle};
use crate::error::{CoreError, CoreResult};
use crate::model::{InviteToken, ParticipantRole, Session};
use crate::server::AppState;

const MAX_DISPLAY_NAME_LEN: usize = 100;
/// Anonymous participants backed by an invite token are tracked for this
/// long after joining, matching the invite's own lifetime assumptions.
const ANONYMOUS_PARTICIPANT_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    pub session_id: Option<Uuid>,
    #[allow(dead_code)] // carried by clients reconnecting after a session rotation; not yet consulted
    pub previous_session_id: Option<Uuid>,
    pub token: Option<String>,
    pub invite: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Uuid,
    #[serde(default)]
    name: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

fn verify_jwt(token: &str, secret: &str) -> Option<Claims> {
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &Validation::default())
        .ok()
        .map(|data| data.claims)
}

/// Resolves the role and identity a connection should get, in the order
/// the gateway's admission policy specifies: an authenticated host first,
/// then a valid invite token, then an authenticated non-host viewer,
/// and finally outright rejection.
fn resolve_identity(
    session: &Session,
    claims: Option<&Claims>,
    invite: Option<&InviteToken>,
    display_name: Option<&str>,
    now: DateTime<Utc>,
) -> CoreResult<(ParticipantRole, String, Option<Uuid>)> {
    if let Some(claims) = claims {
        if Some(claims.sub) == session.host_user_id {
            let name = display_name
                .map(str::to_string)
                .or_else(|| claims.name.clone())
                .unwrap_or_else(|| "Host".to_string());
            return Ok((ParticipantRole::Host, name, Some(claims.sub)));
        }
    }

    if let Some(invite) = invite {
        if invite.session_id != session.id {
            return Err(CoreError::WrongSession);
        }
        if !invite.is_valid(now) {
            return Err(CoreError::InviteExpired);
        }
        let name = display_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("Anonymous {}", invite.role));
        return Ok((invite.role, name, None));
    }

    if let Some(claims) = claims {
        let name = display_name
            .map(str::to_string)
            .or_else(|| claims.name.clone())
            .unwrap_or_else(|| "Viewer".to_string());
        return Ok((ParticipantRole::Viewer, name, Some(claims.sub)));
    }

    Err(CoreError::Unauthorized)
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> CoreResult<Response> {
    let origin = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok());
    if !state.config.origin_allowed(origin) {
        return Err(CoreError::Unauthorized);
    }

    let Some(session_id) = query.session_id else {
        return Err(CoreError::BadRequest("session_id is required".to_string()));
    };
    if let Some(name) = &query.display_name {
        if name.chars().count() > MAX_DISPLAY_NAME_LEN {
            return Err(CoreError::BadRequest("display_name too long".to_string()));
        }
    }

    let session = state
        .repo
        .get_session(session_id)
        .await?
        .ok_or(CoreError::SessionNotFound)?;
    if !session.is_active {
        return Err(CoreError::SessionInactive);
    }

    let claims = query.token.as_deref().and_then(|t| verify_jwt(t, &state.config.jwt_secret));
    let invite = match &query.invite {
        Some(token) => Some(
            state
                .repo
                .get_invite_token(token)
                .await?
                .ok_or(CoreError::InvalidInvite)?,
        ),
        None => None,
    };

    let (role, display_name, user_id) = resolve_identity(
        &session,
        claims.as_ref(),
        invite.as_ref(),
        query.display_name.as_deref(),
        Utc::now(),
    )?;

    let ip: Arc<str> = Arc::from(addr.ip().to_string());
    if !state.hub.can_accept_connection(user_id, &ip) {
        return Err(CoreError::ConnectionLimitExceeded);
    }

    if let Some(invite) = &invite {
        if let Err(err) = state.repo.increment_invite_uses(&invite.token).await {
            tracing::warn!(error = %err, "failed to record invite use");
        }
    }

    let client_id = random_client_id();
    let chat_history = state
        .repo
        .list_messages(session_id, 100)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|m| serde_json::json!(m))
        .collect::<Vec<_>>();

    Ok(ws
        .on_upgrade(move |socket| {
            handle_socket(
                socket,
                state,
                client_id,
                session_id,
                user_id,
                display_name,
                role,
                ip,
                session.code,
                chat_history,
            )
        })
        .into_response())
}

fn random_client_id() -> Uuid {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    Uuid::from_bytes(bytes)
}

#[allow(clippy::too_many_arguments)]
async fn handle_socket(
    socket: axum::extract::ws::WebSocket,
    state: AppState,
    client_id: Uuid,
    session_id: Uuid,
    user_id: Option<Uuid>,
    display_name: String,
    role: ParticipantRole,
    ip: Arc<str>,
    code: String,
    chat_history: Vec<serde_json::Value>,
) {
    use futures::StreamExt;

    let (sink, stream) = socket.split();
    let (handle, outbound_rx, control_rx) =
        ClientHandle::new(client_id, session_id, user_id, display_name.clone(), role, ip.to_string());

    state.hub.register(handle.clone(), code, chat_history).await;

    if let Some(user_id) = user_id {
        if let Err(err) = state
            .repo
            .upsert_authenticated_participant(session_id, user_id, &display_name, role)
            .await
        {
            tracing::warn!(error = %err, "failed to record authenticated participant");
        }
    } else if let Err(err) = state
        .repo
        .insert_anonymous_participant(
            session_id,
            &display_name,
            role,
            Utc::now() + chrono::Duration::from_std(ANONYMOUS_PARTICIPANT_TTL).unwrap_or_default(),
        )
        .await
    {
        tracing::warn!(error = %err, "failed to record anonymous participant");
    }

    let (dispatch_tx, mut dispatch_rx) = tokio::sync::mpsc::channel(64);
    let hub = Arc::clone(&state.hub);
    tokio::spawn(async move {
        while let Some(msg) = dispatch_rx.recv().await {
            hub.dispatch(msg);
        }
    });

    tokio::spawn(client::run_write_pump(sink, outbound_rx, control_rx));

    let read_hub = Arc::clone(&state.hub);
    let read_handle = handle.clone();
    tokio::spawn(async move {
        client::run_read_pump(stream, read_handle, dispatch_tx).await;
        read_hub.unregister(session_id, client_id).await;
    });
}

/// Response body for the paste-lock REST gate.
#[derive(Debug, Serialize)]
pub struct AiCheckResponse {
    pub allowed: bool,
}

#[derive(Debug, Deserialize)]
pub struct AiCheckRequest {
    /// The CC signal declared by whatever work this session's code was
    /// forked from, if any. Fork lineage itself lives outside the core;
    /// the caller supplies the parent's signal so the gate can consult it
    /// without the core needing to know about works at all.
    #[serde(default)]
    pub parent_cc_signal: Option<crate::model::CcSignal>,
}

/// `POST /api/sessions/:id/ai/check` — the only REST surface the core
/// owns, because it shares state (the paste lock) with the hub. Fails
/// open on a lock-store error: an AI assistant proposing code is a
/// convenience, not a safety property, so an infrastructure hiccup
/// should not block it.
pub async fn ai_check(
    State(state): State<AppState>,
    axum::extract::Path(session_id): axum::extract::Path<Uuid>,
    body: Option<axum::Json<AiCheckRequest>>,
) -> CoreResult<axum::Json<AiCheckResponse>> {
    let parent_cc_signal = body.and_then(|b| b.0.parent_cc_signal);
    if let Some(signal) = parent_cc_signal {
        if !signal.allows_ai() {
            return Err(CoreError::Forbidden("parent work disallows AI assistance".to_string()));
        }
    }

    match state.detector.lock_status(session_id).await {
        Ok(Some(_)) => Err(CoreError::Forbidden("session is paste-locked".to_string())),
        Ok(None) => Ok(axum::Json(AiCheckResponse { allowed: true })),
        Err(err) => {
            tracing::warn!(%session_id, error = %err, "lock store unavailable, failing open");
            Ok(axum::Json(AiCheckResponse { allowed: true }))
        }
    }
}
