//! Live alert push over WebSocket.
//!
//! Every connection registers with the broadcast hub and gets its own writer
//! loop that drains the connection's outbound buffer onto the socket. The
//! channel is push-only: client frames are read solely to notice a close.

use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use tracing::{debug, warn};

use super::AppState;
use crate::hub::HubHandle;

// ---

/// Budget for a single socket write before the subscriber is given up on.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/ws/alerts", get(handler))
}

async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_subscriber(socket, state.hub))
}

async fn serve_subscriber(mut socket: WebSocket, hub: HubHandle) {
    // ---
    let mut subscription = match hub.register().await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("Rejecting subscriber: {}", e);
            return;
        }
    };
    let id = subscription.id;
    debug!("Subscriber {} connected", id);

    loop {
        tokio::select! {
            frame = subscription.receiver.recv() => {
                // None: the hub dropped us or is shutting down
                let Some(frame) = frame else { break };
                let sent = tokio::time::timeout(
                    WRITE_TIMEOUT,
                    socket.send(Message::Text(frame.to_string().into())),
                )
                .await;
                if !matches!(sent, Ok(Ok(()))) {
                    debug!("Subscriber {} write failed", id);
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    if let Err(e) = hub.unregister(id).await {
        debug!("Subscriber {} not unregistered: {}", id, e);
    }
    let _ = socket.send(Message::Close(None)).await;
    debug!("Subscriber {} disconnected", id);
}
