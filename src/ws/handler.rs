//! WebSocket upgrade handler and per-socket tasks

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::http::middleware::{verify_token, AuthenticatedUser};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::ws::protocol::{ClientMsg, ServerMsg};
use crate::ws::registry::{ConnectionHandle, OutboundFrame};

/// How long a fresh socket may sit silent before it must have authed
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_CHAT_LEN: usize = 500;

/// WebSocket upgrade handler. Authentication happens in-band: the first
/// message on the socket must be an `auth` envelope.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (ws_sink, mut ws_stream) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let mut writer = tokio::spawn(write_loop(ws_sink, out_rx));

    let identity = match wait_for_auth(&mut ws_stream, &state).await {
        Ok(identity) => {
            let _ = out_tx.send(OutboundFrame::Msg(ServerMsg::AuthSuccess {
                user_id: identity.user_id,
                username: identity.username.clone(),
            }));
            identity
        }
        Err(message) => {
            let _ = out_tx.send(OutboundFrame::Msg(ServerMsg::AuthError { message }));
            let _ = out_tx.send(OutboundFrame::Close);
            let _ = writer.await;
            return;
        }
    };

    info!(user_id = %identity.user_id, "WebSocket authenticated");

    let conn_id = Uuid::new_v4();
    state
        .connections
        .register(identity.user_id, ConnectionHandle::new(conn_id, out_tx.clone()));

    // Still a participant somewhere? Resubscribe and push a fresh baseline.
    state.sessions.reconnected(identity.user_id).await;

    let rate_limiter = ConnectionRateLimiter::new();
    loop {
        tokio::select! {
            // The writer only ends early on a send failure or a forced
            // close (supersede, heartbeat timeout) - either way this
            // socket is done.
            _ = &mut writer => break,

            item = ws_stream.next() => match item {
                Some(Ok(Message::Text(text))) => {
                    state.connections.touch(identity.user_id);

                    if !rate_limiter.check_message() {
                        warn!(user_id = %identity.user_id, "Rate limited client message");
                        continue;
                    }

                    match serde_json::from_str::<ClientMsg>(&text) {
                        Ok(msg) => dispatch(&state, &identity, msg, &out_tx).await,
                        Err(e) => {
                            warn!(user_id = %identity.user_id, error = %e, "Failed to parse client message");
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    state.connections.touch(identity.user_id);
                }
                Some(Ok(Message::Ping(_))) => {
                    state.connections.touch(identity.user_id);
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(user_id = %identity.user_id, "Received binary message, ignoring");
                }
                Some(Ok(Message::Close(_))) => {
                    info!(user_id = %identity.user_id, "Client initiated close");
                    break;
                }
                Some(Err(e)) => {
                    debug!(user_id = %identity.user_id, error = %e, "WebSocket error");
                    break;
                }
                None => break,
            }
        }
    }

    // Only the connection that still owns the mapping runs disconnect
    // cleanup; a superseded socket must not mark its successor offline.
    if state.connections.unregister(identity.user_id, conn_id) {
        state.sessions.disconnected(identity.user_id).await;
    }

    writer.abort();
    info!(user_id = %identity.user_id, "WebSocket connection closed");
}

/// Writer task: drains the outbound channel into the socket
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            OutboundFrame::Msg(msg) => {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize outbound message");
                        continue;
                    }
                };
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            OutboundFrame::Ping => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            OutboundFrame::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

/// The first message must be `auth`; everything else is rejected
async fn wait_for_auth(
    stream: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> Result<AuthenticatedUser, String> {
    let deadline = tokio::time::sleep(AUTH_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return Err("authentication timeout".to_string()),
            item = stream.next() => match item {
                Some(Ok(Message::Text(text))) => {
                    return match serde_json::from_str::<ClientMsg>(&text) {
                        Ok(ClientMsg::Auth { token }) => {
                            verify_token(&token, &state.config.auth_token_secret)
                                .map(AuthenticatedUser::from_claims)
                                .map_err(|e| e.to_string())
                        }
                        Ok(_) => Err("expected auth message".to_string()),
                        Err(_) => Err("malformed auth message".to_string()),
                    };
                }
                Some(Ok(Message::Close(_))) | None => return Err("closed before auth".to_string()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.to_string()),
            }
        }
    }
}

async fn dispatch(
    state: &AppState,
    identity: &AuthenticatedUser,
    msg: ClientMsg,
    out_tx: &mpsc::UnboundedSender<OutboundFrame>,
) {
    let user_id = identity.user_id;
    let result = match msg {
        ClientMsg::Auth { .. } => {
            send_error(out_tx, "already_authenticated", "already authenticated");
            return;
        }

        ClientMsg::SessionJoin {
            session_id,
            password,
            character_id,
        } => {
            match state
                .sessions
                .join(
                    session_id,
                    user_id,
                    identity.username.clone(),
                    password,
                    character_id,
                    false,
                )
                .await
            {
                Ok(full) => {
                    let _ = out_tx.send(OutboundFrame::Msg(ServerMsg::SessionJoined {
                        state: full,
                    }));
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }

        ClientMsg::SessionLeave => state.sessions.leave(user_id).await,

        ClientMsg::SessionReady { ready } => state.sessions.set_ready(user_id, ready).await,

        ClientMsg::ActionMove { x, y, facing } => {
            state.sessions.move_to(user_id, x, y, facing).await
        }

        ClientMsg::ActionAttack { target_id } => state.sessions.attack(user_id, target_id).await,

        ClientMsg::ActionUseItem { item_id, target_id } => {
            state.sessions.use_item(user_id, item_id, target_id).await
        }

        ClientMsg::ActionInteract { object_id } => {
            state.sessions.interact(user_id, object_id).await
        }

        ClientMsg::TurnEnd => state.sessions.end_turn(user_id).await,

        ClientMsg::ChatSend { text } => {
            if text.is_empty() || text.len() > MAX_CHAT_LEN {
                send_error(out_tx, "validation", "chat message length out of bounds");
                return;
            }
            state.sessions.chat(user_id, text).await
        }

        ClientMsg::SyncRequest { since } => state.sessions.sync_request(user_id, since).await,

        ClientMsg::Ping { t } => {
            let _ = out_tx.send(OutboundFrame::Msg(ServerMsg::Pong { t }));
            return;
        }
    };

    if let Err(e) = result {
        debug!(user_id = %user_id, error = %e, "Client request rejected");
        send_error(out_tx, e.code(), &e.to_string());
    }
}

fn send_error(out_tx: &mpsc::UnboundedSender<OutboundFrame>, code: &str, message: &str) {
    let _ = out_tx.send(OutboundFrame::Msg(ServerMsg::Error {
        code: code.to_string(),
        message: message.to_string(),
    }));
}
