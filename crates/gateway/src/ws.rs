//! Per-connection WebSocket handling.
//!
//! Each connection gets a writer task fed by an unbounded channel and a read
//! loop that dispatches JSON control frames. Slow operations (login, command
//! dispatch) run in spawned tasks so the read loop keeps answering liveness
//! probes; their results come back through the same writer channel.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, StreamExt},
    tracing::{debug, info, warn},
};

use {
    tiller_protocol::{ClientFrame, ServerFrame},
    tiller_rtm::DispatchError,
};

use crate::state::{ConnectedClient, GatewayState, Outbound};

/// Run one client connection to completion.
pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, addr: SocketAddr) {
    let conn_id = GatewayState::next_conn_id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Outbound>();

    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let msg = match out {
                Outbound::Frame(text) => Message::Text(text.into()),
                Outbound::Ping => Message::Ping(Vec::new().into()),
                Outbound::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                },
            };
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    state
        .register_client(ConnectedClient::new(conn_id.clone(), addr, tx))
        .await;
    info!(conn_id = %conn_id, %addr, "client connected");

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "read error");
                break;
            },
        };
        match msg {
            Message::Text(text) => {
                touch(&state, &conn_id).await;
                handle_text(&state, &conn_id, text.as_str()).await;
            },
            // Any sign of life counts for liveness.
            Message::Pong(_) | Message::Ping(_) => touch(&state, &conn_id).await,
            Message::Binary(_) => {
                send_to(&state, &conn_id, &ServerFrame::error("binary frames not supported"))
                    .await;
            },
            Message::Close(_) => break,
        }
    }

    info!(conn_id = %conn_id, "client disconnected");
    state.close_client(&conn_id).await;
    // close_client asked the writer to close the socket; reap the task.
    let _ = writer.await;
}

async fn touch(state: &GatewayState, conn_id: &str) {
    if let Some(client) = state.clients.write().await.get_mut(conn_id) {
        client.touch();
    }
}

async fn send_to(state: &GatewayState, conn_id: &str, frame: &ServerFrame) {
    if let Some(client) = state.clients.read().await.get(conn_id) {
        client.send(frame);
    }
}

// ── Frame dispatch ───────────────────────────────────────────────────────────

async fn handle_text(state: &Arc<GatewayState>, conn_id: &str, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!(conn_id, error = %e, "malformed client frame");
            send_to(state, conn_id, &ServerFrame::error(format!("malformed frame: {e}"))).await;
            return;
        },
    };

    match frame {
        ClientFrame::Login { identity, token } => {
            let state = Arc::clone(state);
            let conn_id = conn_id.to_string();
            tokio::spawn(async move {
                handle_login(&state, &conn_id, &identity, &token).await;
            });
        },
        ClientFrame::Logout => handle_logout(state, conn_id).await,
        ClientFrame::SendCommand {
            payload,
            recipient_override,
        } => {
            let state = Arc::clone(state);
            let conn_id = conn_id.to_string();
            tokio::spawn(async move {
                handle_send_command(&state, &conn_id, payload, recipient_override.as_deref())
                    .await;
            });
        },
        ClientFrame::GetStatus => {
            let frame = status_frame(state, conn_id).await;
            send_to(state, conn_id, &frame).await;
        },
        // Touched above; liveness refresh carries no reply.
        ClientFrame::Ping => {},
    }
}

async fn status_frame(state: &GatewayState, conn_id: &str) -> ServerFrame {
    match state.session_of(conn_id).await {
        Some(session) => ServerFrame::Status {
            ready: session.is_ready(),
            identity: session.current_identity().await,
        },
        None => ServerFrame::Status {
            ready: false,
            identity: None,
        },
    }
}

async fn handle_login(state: &Arc<GatewayState>, conn_id: &str, identity: &str, token: &str) {
    // Bind fails only when the connection disappeared underneath us.
    let Some(session) = state.bind_session(conn_id).await else {
        return;
    };
    match session.login_with(identity, token).await {
        Ok(()) => {
            info!(conn_id, identity, "login succeeded");
        },
        Err(e) => {
            warn!(conn_id, identity, error = %e, "login failed");
            send_to(state, conn_id, &ServerFrame::error(format!("login failed: {e}"))).await;
        },
    }
    let frame = status_frame(state, conn_id).await;
    send_to(state, conn_id, &frame).await;
}

async fn handle_logout(state: &GatewayState, conn_id: &str) {
    let bound = {
        let mut clients = state.clients.write().await;
        clients.get_mut(conn_id).and_then(|c| c.session.take())
    };
    if let Some(bound) = bound {
        info!(conn_id, "logout");
        bound.teardown().await;
    }
    send_to(state, conn_id, &ServerFrame::Status {
        ready: false,
        identity: None,
    })
    .await;
}

async fn handle_send_command(
    state: &Arc<GatewayState>,
    conn_id: &str,
    payload: tiller_protocol::CommandEnvelope,
    recipient_override: Option<&str>,
) {
    let session = match state.session_of(conn_id).await {
        Some(s) if s.is_ready() => s,
        other => {
            let message = if other.is_none() {
                "not logged in"
            } else {
                "session not ready"
            };
            send_to(state, conn_id, &ServerFrame::error(message)).await;
            send_to(state, conn_id, &ServerFrame::CommandResult {
                success: false,
                recipient: None,
                attempts: Vec::new(),
            })
            .await;
            return;
        },
    };

    let result = state
        .dispatcher
        .dispatch(&session, &payload, recipient_override)
        .await;
    let frame = match result {
        Ok(outcome) => ServerFrame::CommandResult {
            success: true,
            recipient: Some(outcome.recipient),
            attempts: outcome.attempts,
        },
        Err(e) => {
            debug!(conn_id, error = %e, "command dispatch failed");
            if matches!(e, DispatchError::NoCandidates) {
                send_to(state, conn_id, &ServerFrame::error("no recipient resolved")).await;
            }
            ServerFrame::CommandResult {
                success: false,
                recipient: None,
                attempts: e.attempts().to_vec(),
            }
        },
    };
    send_to(state, conn_id, &frame).await;
}
