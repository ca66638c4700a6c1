use crate::{
    error::AppError,
    middleware::auth,
    state::AppState,
    websocket::events::RoomEvent,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// WebSocket endpoint for real-time room communication.
///
/// Authentication happens here, before the upgrade: the broadcast core is
/// never reachable for an unauthenticated connection.
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    // Room ids are case-insensitive at the boundary.
    let room_id = room_id.to_lowercase();

    let user_id = match authorize(&state, &params, &headers) {
        Ok(user_id) => user_id,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(state, room_id, user_id, socket))
}

fn authorize(
    state: &AppState,
    params: &WsParams,
    headers: &HeaderMap,
) -> Result<Option<String>, AppError> {
    let config = &state.config;
    if config.dev_allow_unauthenticated {
        warn!("token validation bypassed (WS_DEV_ALLOW_ALL=true) - do not use in production");
        return Ok(None);
    }

    let token = params.token.clone().or_else(|| {
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(|s| s.to_string())
    });

    let Some(token) = token else {
        warn!("websocket rejected: no token provided");
        return Err(AppError::Unauthorized);
    };
    let secret = config.jwt_secret.as_deref().ok_or(AppError::Unauthorized)?;
    let claims = auth::verify_token(&token, secret)?;
    Ok(Some(claims.sub))
}

/// Per-connection session task.
///
/// Registers with the connection manager, then multiplexes outbound
/// broadcast payloads and inbound client events until the transport
/// closes. The membership guard guarantees exactly one disconnect on every
/// exit path, including panic unwind.
async fn handle_socket(state: AppState, room_id: String, user_id: Option<String>, socket: WebSocket) {
    debug!(%room_id, user = user_id.as_deref().unwrap_or("<dev>"), "websocket session opened");

    let (membership, mut rx) = state.manager.connect(&room_id).await;
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_event(&state, &room_id, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by the framework
                    Some(Err(_)) => break,
                }
            }
        }
    }

    membership.leave().await;
    debug!(%room_id, "websocket session closed");
}

/// Validate an inbound client event and hand it to the broadcast path.
/// This handler never decides routing policy; it only triggers it.
async fn handle_client_event(state: &AppState, room_id: &str, text: &str) {
    let event: RoomEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(%room_id, error = %e, "dropping unrecognized client event");
            return;
        }
    };

    match serde_json::to_value(&event) {
        Ok(payload) => state.manager.broadcast(room_id, &payload).await,
        Err(e) => warn!(%room_id, error = %e, "failed to serialize room event"),
    }
}
