use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use sandbox_protocol::ClientMessage;
use tracing::{debug, info, warn};

use crate::registry::EventSink;
use crate::session::SessionController;

/// Close codes that end a connection normally: going away, abnormal closure.
const EXPECTED_CLOSE_CODES: [u16; 2] = [1001, 1006];

#[derive(Clone)]
pub struct AppState {
    service_name: String,
    controller: Arc<SessionController>,
}

impl AppState {
    #[must_use]
    pub fn new(service_name: String, controller: Arc<SessionController>) -> Self {
        Self {
            service_name,
            controller,
        }
    }

    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/status", get(status_ws))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn status_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| status_ws_session(state, socket, peer))
}

async fn status_ws_session(state: AppState, socket: WebSocket, peer: SocketAddr) {
    info!(service = %state.service_name, peer = %peer, "status channel opened");
    let (mut outbound, mut inbound) = socket.split();
    let (sink, mut events) = EventSink::channel();

    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let payload = match event.to_json() {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(peer = %peer, reason = %error, "dropping unserializable event");
                    continue;
                }
            };
            if outbound.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(message) => {
                    debug!(peer = %peer, action = %message.action, "status channel command");
                    let _ = state.controller.handle_command(peer, message, &sink).await;
                }
                Err(error) => warn!(peer = %peer, reason = %error, "failed to decode status command"),
            },
            Ok(Message::Close(frame)) => {
                log_close(peer, frame.as_ref());
                break;
            }
            Ok(Message::Binary(_)) => warn!(peer = %peer, "ignoring binary frame"),
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(error) => {
                warn!(peer = %peer, reason = %error, "status channel read failed");
                break;
            }
        }
    }

    // Membership must not outlive the connection, whatever ended it.
    let _ = state.controller.registry().remove(&peer).await;
    drop(sink);
    writer.abort();
    info!(peer = %peer, "status channel closed");
}

fn log_close(peer: SocketAddr, frame: Option<&CloseFrame<'static>>) {
    match frame {
        Some(frame) if !EXPECTED_CLOSE_CODES.contains(&frame.code) && frame.code != 1000 => {
            warn!(peer = %peer, code = frame.code, reason = %frame.reason, "status channel closed unexpectedly");
        }
        Some(frame) => debug!(peer = %peer, code = frame.code, "status channel closed by peer"),
        None => debug!(peer = %peer, "status channel closed by peer"),
    }
}
