use axum::{
    extract::ws::{Message as ClientMessage, WebSocket, WebSocketUpgrade},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{error, info};

use crate::trace::TraceId;

const PREVIEW_CHARS: usize = 100;

/// Accept the client upgrade and relay against the configured backend
/// socket. The returned response completes the upgrade handshake; the relay
/// itself runs on the connection task.
pub fn bridge(ws: WebSocketUpgrade, upstream_url: String, trace_id: TraceId) -> Response {
    ws.on_upgrade(move |client| relay(client, upstream_url, trace_id))
}

/// Bidirectional, whole-message relay. Closing either side closes the other;
/// failures past the handshake can only be logged and torn down, not
/// converted into a structured error response.
async fn relay(mut client: WebSocket, upstream_url: String, trace_id: TraceId) {
    let upstream = match tokio_tungstenite::connect_async(&upstream_url).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            error!(
                trace_id = %trace_id,
                destination = %upstream_url,
                error = %e,
                "Socket upstream connection failed"
            );
            let _ = client.send(ClientMessage::Close(None)).await;
            return;
        }
    };

    info!(trace_id = %trace_id, destination = %upstream_url, "Socket relay established");

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    loop {
        tokio::select! {
            message = client_rx.next() => {
                let Some(Ok(message)) = message else { break };
                info!(
                    trace_id = %trace_id,
                    direction = "client_to_backend",
                    payload = %client_preview(&message),
                    "Socket message"
                );
                let Some(converted) = to_upstream(message) else { break };
                if upstream_tx.send(converted).await.is_err() {
                    break;
                }
            }
            message = upstream_rx.next() => {
                let Some(Ok(message)) = message else { break };
                info!(
                    trace_id = %trace_id,
                    direction = "backend_to_client",
                    payload = %upstream_preview(&message),
                    "Socket message"
                );
                let Some(converted) = to_client(message) else { break };
                if client_tx.send(converted).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = client_tx.send(ClientMessage::Close(None)).await;
    let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
    info!(trace_id = %trace_id, destination = %upstream_url, "Socket relay closed");
}

/// A `None` means the message ends the relay (close frame or an unmappable
/// raw frame).
fn to_upstream(message: ClientMessage) -> Option<UpstreamMessage> {
    match message {
        ClientMessage::Text(text) => Some(UpstreamMessage::Text(text)),
        ClientMessage::Binary(data) => Some(UpstreamMessage::Binary(data)),
        ClientMessage::Ping(data) => Some(UpstreamMessage::Ping(data)),
        ClientMessage::Pong(data) => Some(UpstreamMessage::Pong(data)),
        ClientMessage::Close(_) => None,
    }
}

fn to_client(message: UpstreamMessage) -> Option<ClientMessage> {
    match message {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text)),
        UpstreamMessage::Binary(data) => Some(ClientMessage::Binary(data)),
        UpstreamMessage::Ping(data) => Some(ClientMessage::Ping(data)),
        UpstreamMessage::Pong(data) => Some(ClientMessage::Pong(data)),
        UpstreamMessage::Close(_) | UpstreamMessage::Frame(_) => None,
    }
}

fn client_preview(message: &ClientMessage) -> String {
    match message {
        ClientMessage::Text(text) => truncate(text),
        ClientMessage::Close(_) => "[close]".to_string(),
        _ => "[binary]".to_string(),
    }
}

fn upstream_preview(message: &UpstreamMessage) -> String {
    match message {
        UpstreamMessage::Text(text) => truncate(text),
        UpstreamMessage::Close(_) => "[close]".to_string(),
        _ => "[binary]".to_string(),
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        text.to_string()
    } else {
        text.chars().take(PREVIEW_CHARS).collect()
    }
}
