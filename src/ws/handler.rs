//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{PlayerInput, RoomHandle, WireInput};
use crate::http::AppError;
use crate::transport::server::SERVER_PEER_ID;
use crate::transport::{Outbound, PeerId, PeerInfo, PeerMessage};
use crate::util::rate_limit::PeerRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

const MAX_NAME_LEN: usize = 24;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Room code from `POST /rooms`
    pub room: String,
    /// Display name shown to other players
    #[serde(default)]
    pub name: Option<String>,
}

fn display_name(raw: Option<&str>) -> String {
    let name: String = raw
        .map(str::trim)
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_NAME_LEN)
        .collect();
    if name.is_empty() {
        "Player".to_string()
    } else {
        name
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    if query.room.trim().is_empty() {
        return Err(AppError::BadRequest("Missing room code".to_string()));
    }
    let room = state
        .rooms
        .get(&query.room)
        .ok_or_else(|| AppError::NotFound(format!("Room {}", query.room)))?;
    if room.is_full() {
        return Err(AppError::Conflict("Room is full".to_string()));
    }

    let peer = PeerInfo {
        id: Uuid::new_v4().to_string(),
        display_name: display_name(query.name.as_deref()),
    };
    info!(room = %room.code, peer_id = %peer.id, "WebSocket upgrade");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, peer, room)))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, peer: PeerInfo, room: RoomHandle) {
    let (mut ws_sink, ws_stream) = socket.split();

    // Subscribe before joining so the slot replay for this peer isn't missed
    let outbound_rx = room.subscribe();

    let welcome = ServerMsg::Welcome {
        peer_id: peer.id.clone(),
        room_code: room.code.clone(),
        authority: SERVER_PEER_ID.to_string(),
        server_time: unix_millis(),
    };
    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(peer_id = %peer.id, error = %e, "Failed to send welcome");
        return;
    }

    if !room.send(PeerMessage::Joined(peer.clone())) {
        warn!(room = %room.code, peer_id = %peer.id, "Room closed before join");
        return;
    }

    run_session(peer.id.clone(), &room, ws_sink, ws_stream, outbound_rx).await;

    room.send(PeerMessage::Left(peer.id.clone()));
    info!(room = %room.code, peer_id = %peer.id, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    peer_id: PeerId,
    room: &RoomHandle,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    mut outbound_rx: broadcast::Receiver<Outbound>,
) {
    let rate_limiter = PeerRateLimiter::new();
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<ServerMsg>();

    // Writer task: room broadcast + direct replies -> WebSocket
    let writer_peer = peer_id.clone();
    let writer_handle = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                direct = direct_rx.recv() => match direct {
                    Some(msg) => msg,
                    None => break,
                },
                published = outbound_rx.recv() => match published {
                    Ok(out) if out.is_for(&writer_peer) => out.msg,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            peer_id = %writer_peer,
                            lagged_count = n,
                            "Peer lagged, skipping {} messages", n
                        );
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(peer_id = %writer_peer, "Room channel closed");
                        break;
                    }
                },
            };

            let closing = matches!(&msg, ServerMsg::Error { code, .. } if code == "room_full" || code == "room_closed");
            if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                debug!(peer_id = %writer_peer, error = %e, "WebSocket send failed");
                break;
            }
            if closing {
                let _ = ws_sink.close().await;
                break;
            }
        }
    });

    // Reader loop: WebSocket -> room
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let client_msg = match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(peer_id = %peer_id, error = %e, "Failed to parse client message");
                        continue;
                    }
                };

                let forwarded = match client_msg {
                    ClientMsg::Input {
                        seq,
                        button_a,
                        button_b,
                        dash_requested,
                        captured_at_ms,
                    } => {
                        if !rate_limiter.check_input() {
                            debug!(peer_id = %peer_id, "Rate limited input message");
                            continue;
                        }
                        let wire = WireInput {
                            seq,
                            input: PlayerInput {
                                button_a,
                                button_b,
                                dash_requested,
                                captured_at_ms,
                            },
                        };
                        match serde_json::to_value(wire) {
                            Ok(value) => PeerMessage::Input {
                                peer: peer_id.clone(),
                                value,
                            },
                            Err(e) => {
                                error!(peer_id = %peer_id, error = %e, "Failed to encode input");
                                continue;
                            }
                        }
                    }
                    ClientMsg::Call {
                        event,
                        payload,
                        target,
                    } => {
                        if !rate_limiter.check_call() {
                            warn!(peer_id = %peer_id, event = %event, "Rate limited call");
                            continue;
                        }
                        PeerMessage::Call {
                            from: peer_id.clone(),
                            event,
                            payload,
                            target,
                        }
                    }
                    ClientMsg::Ping { t } => {
                        let _ = direct_tx.send(ServerMsg::Pong { t });
                        continue;
                    }
                    ClientMsg::Leave => {
                        info!(peer_id = %peer_id, "Client left the room");
                        break;
                    }
                };

                if !room.send(forwarded) {
                    debug!(peer_id = %peer_id, "Room inbox closed");
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(peer_id = %peer_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(peer_id = %peer_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(peer_id = %peer_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    writer_handle.abort();
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
