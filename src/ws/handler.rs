//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::util::rate_limit::ClientRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::hub::Transport;
use crate::ws::protocol::{ClientMsg, ServerEnvelope};

const MAX_CLIENT_NAME: usize = 64;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Client name, unique among connected clients
    pub client: String,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let client = query.client.trim().to_string();
    if client.is_empty() || client.len() > MAX_CLIENT_NAME {
        return (StatusCode::BAD_REQUEST, "Invalid client name").into_response();
    }

    let Some(outbound) = state.hub.register(&client) else {
        warn!(client_id = %client, "Client name already connected");
        return (StatusCode::CONFLICT, "Client name already connected").into_response();
    };

    let connection_id = Uuid::new_v4();
    info!(client_id = %client, connection_id = %connection_id, "WebSocket upgrade");

    let hub = state.hub.clone();
    let failed_client = client.clone();
    ws.on_failed_upgrade(move |e| {
        warn!(client_id = %failed_client, error = %e, "WebSocket upgrade failed");
        hub.unregister(&failed_client);
    })
    .on_upgrade(move |socket| handle_socket(socket, client, connection_id, outbound, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    client: String,
    connection_id: Uuid,
    mut outbound: mpsc::UnboundedReceiver<String>,
    state: AppState,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let welcome = ServerEnvelope::welcome(&client, unix_millis());
    state.hub.send_to(&client, &welcome);

    // Writer task: hub queue -> WebSocket
    let writer_client = client.clone();
    let writer_handle = tokio::spawn(async move {
        while let Some(json) = outbound.recv().await {
            if let Err(e) = ws_sink.send(Message::Text(json)).await {
                debug!(client_id = %writer_client, error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    let rate_limiter = ClientRateLimiter::new();

    // Reader loop: WebSocket -> rooms
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(client_id = %client, "Rate limited input message");
                    continue;
                }

                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => handle_message(&state, &client, msg),
                    Err(e) => {
                        warn!(client_id = %client, error = %e, "Failed to parse client message");
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(client_id = %client, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(client_id = %client, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(client_id = %client, error = %e, "WebSocket error");
                break;
            }
        }
    }

    if let Some(room_id) = state.hub.unregister(&client) {
        state.manager.leave(&room_id, &client);
    }
    writer_handle.abort();

    info!(client_id = %client, connection_id = %connection_id, "WebSocket connection closed");
}

fn handle_message(state: &AppState, client: &str, msg: ClientMsg) {
    match msg {
        ClientMsg::Join { room_id } => {
            let previous = state.hub.set_room(client, Some(room_id.clone()));
            match previous {
                // a crashed room is gone from the manager and is joined again
                Some(previous)
                    if previous == room_id && state.manager.status(&room_id).is_some() =>
                {
                    debug!(client_id = %client, room_id = %room_id, "Already in room");
                    return;
                }
                Some(previous) if previous != room_id => state.manager.leave(&previous, client),
                _ => {}
            }
            if let Err(e) = state.manager.join(&room_id, client) {
                warn!(client_id = %client, room_id = %room_id, error = %e, "Join rejected");
                state.hub.set_room(client, None);
                state
                    .hub
                    .send_to(client, &ServerEnvelope::notification(e.to_string()));
            }
        }
        msg @ ClientMsg::Input { .. } => {
            let Some(room_id) = state.hub.room_of(client) else {
                debug!(client_id = %client, "Input outside of a room");
                return;
            };
            for (kind, payload) in msg.into_actions() {
                if !state.manager.input(&room_id, client, &kind, payload) {
                    debug!(client_id = %client, room_id = %room_id, "Room is not resident");
                    break;
                }
            }
        }
        ClientMsg::Leave => {
            if let Some(room_id) = state.hub.set_room(client, None) {
                state.manager.leave(&room_id, client);
            }
        }
        ClientMsg::Ping { t } => {
            state
                .hub
                .send_to(client, &ServerEnvelope::pong(t, unix_millis()));
        }
    }
}
