//! Live subscription channel.
//!
//! Server-to-client frames are the hub's JSON frames; the only recognized
//! client-to-server message is the literal text `shutdown`. Subscriber
//! state is owned by the hub; this task only pumps its own channel into the
//! socket, so no cross-task writes ever touch the transport.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use tracing::{debug, info};
use uuid::Uuid;

use crate::app_state::AppState;

pub async fn live_channel(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket, addr))
}

async fn handle_socket(state: AppState, mut socket: WebSocket, addr: SocketAddr) {
    let mut sub = state.hub().subscribe();
    let request_id = Uuid::new_v4();
    info!(
        target: "wingman::events",
        %addr,
        %request_id,
        connections = state.hub().subscriber_count(),
        "new live connection"
    );

    loop {
        tokio::select! {
            frame = sub.rx.recv() => {
                let Some(text) = frame else { break };
                sub.buffered.fetch_sub(text.len() as u64, Ordering::Relaxed);
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text == "shutdown" => {
                        let _ = socket.send(Message::Text("Shutting down".into())).await;
                        info!(target: "wingman::events", %addr, "shutdown requested over live channel");
                        state.request_shutdown();
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        info!(target: "wingman::events", %addr, "message: {text}");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(target: "wingman::events", %addr, %err, "live channel receive error");
                        break;
                    }
                }
            }
        }
    }

    state.hub().unsubscribe(sub.id);
    info!(
        target: "wingman::events",
        %addr,
        %request_id,
        connections = state.hub().subscriber_count(),
        "live connection closed"
    );
}
