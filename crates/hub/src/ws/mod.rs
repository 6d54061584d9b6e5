// WebSocket transport: upgrade route and the per-connection socket task.
//
// The socket task owns its connection id for the socket's whole life. It
// forwards decoded frames into the event router and drains the outbound
// queue registered in the connection map. Liveness is the transport's
// job: the server pings on an interval and drops peers that stop
// answering, which funnels into the same disconnect cleanup as a close.

pub mod router;

use atrium_common::protocol::ws::{ClientEvent, ServerEvent};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics;
pub use router::EventRouter;

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: usize = 65_536;

#[derive(Clone)]
struct WsState {
    router: EventRouter,
}

pub fn router(event_router: EventRouter) -> Router {
    Router::new()
        .route("/v1/ws", get(ws_upgrade))
        .with_state(WsState { router: event_router })
}

async fn ws_upgrade(State(state): State<WsState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(state.router, socket))
}

async fn handle_socket(event_router: EventRouter, mut socket: WebSocket) {
    let connection_id = Uuid::new_v4().to_string();

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerEvent>();
    event_router.connections.insert(&connection_id, outbound_sender).await;
    metrics::connection_opened();
    info!(connection_id = %connection_id, "client connected");

    let connected =
        ServerEvent::Connected { connection_id: connection_id.clone() };
    if send_server_event(&mut socket, &connected).await.is_err() {
        finish(&event_router, &connection_id).await;
        return;
    }

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS, disconnects if
    // no pong arrives within HEARTBEAT_TIMEOUT_MS.
    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(connection_id = %connection_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(event) => {
                        if send_server_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw)) => {
                        match ClientEvent::decode(&raw) {
                            Ok(event) => event_router.dispatch(&connection_id, event).await,
                            Err(err) => {
                                debug!(connection_id = %connection_id, error = %err, "dropping undecodable frame");
                                let error_event = ServerEvent::error("invalid event frame");
                                if send_server_event(&mut socket, &error_event).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    finish(&event_router, &connection_id).await;
}

/// Disconnect cleanup, invoked exactly once per socket when the transport
/// declares it dead.
async fn finish(event_router: &EventRouter, connection_id: &str) {
    event_router.connections.remove(connection_id).await;
    event_router.handle_disconnect(connection_id).await;
    metrics::connection_closed();
    info!(connection_id = %connection_id, "client disconnected");
}

async fn send_server_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let encoded = serde_json::to_string(event).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
