//! WebSocket transport for the notification hub.
//!
//! Each connection is one hub listener. Clients send
//! `{"action":"subscribe","jobId":"..."}` or `unsubscribe` and receive the
//! event envelopes published for the jobs they follow, plus broadcasts.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use jobflow_core::notify::ListenerId;
use jobflow_core::NotificationHub;

use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_MESSAGES_SENT};
use crate::state::AppState;

/// Message sent by a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe { job_id: String },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { job_id: String },
}

/// Acknowledgement sent back for a client message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    #[serde(rename_all = "camelCase")]
    Subscribed { job_id: String },
    #[serde(rename_all = "camelCase")]
    Unsubscribed { job_id: String, was_subscribed: bool },
    Error { message: String },
}

/// Apply one text frame from a client to the hub.
pub fn handle_client_message(hub: &NotificationHub, listener: ListenerId, text: &str) -> ServerReply {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { job_id }) => {
            if hub.subscribe(&job_id, listener) {
                debug!("Listener {} subscribed to {}", listener, job_id);
                ServerReply::Subscribed { job_id }
            } else {
                ServerReply::Error {
                    message: "listener is no longer connected".to_string(),
                }
            }
        }
        Ok(ClientMessage::Unsubscribe { job_id }) => {
            let was_subscribed = hub.unsubscribe(&job_id, listener);
            ServerReply::Unsubscribed {
                job_id,
                was_subscribed,
            }
        }
        Err(e) => ServerReply::Error {
            message: format!("invalid message: {}", e),
        },
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a single WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let hub = state.hub().clone();
    let mut listener = hub.connect();
    let listener_id = listener.id();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerReply>(16);

    WS_CONNECTIONS_TOTAL.inc();
    WS_CONNECTIONS_ACTIVE.inc();

    info!("WebSocket client connected (listener {})", listener_id);

    // Forward hub events and replies to this client
    let send_task = tokio::spawn(async move {
        loop {
            let (label, json) = tokio::select! {
                event = listener.recv() => {
                    let Some(event) = event else {
                        debug!("Hub closed listener {}", listener_id);
                        break;
                    };
                    let label = event.event.clone();
                    (label, serde_json::to_string(&event))
                }
                reply = reply_rx.recv() => {
                    let Some(reply) = reply else { break };
                    ("reply".to_string(), serde_json::to_string(&reply))
                }
            };

            match json {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        debug!("WebSocket send failed, client disconnected");
                        break;
                    }
                    WS_MESSAGES_SENT.with_label_values(&[&label]).inc();
                }
                Err(e) => {
                    error!("Failed to serialize websocket message: {}", e);
                }
            }
        }
    });

    // Handle incoming messages from client
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Close(_)) => {
                debug!("WebSocket client requested close");
                break;
            }
            Ok(Message::Text(text)) => {
                let reply = handle_client_message(&hub, listener_id, text.as_str());
                if reply_tx.send(reply).await.is_err() {
                    break;
                }
            }
            Ok(_) => {
                // Ping/pong is handled by axum
            }
            Err(e) => {
                warn!("WebSocket receive error: {}", e);
                break;
            }
        }
    }

    // Clean up
    hub.disconnect(listener_id);
    send_task.abort();
    WS_CONNECTIONS_ACTIVE.dec();
    info!("WebSocket client disconnected (listener {})", listener_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let hub = NotificationHub::new(8);
        let listener = hub.connect();

        let reply = handle_client_message(
            &hub,
            listener.id(),
            r#"{"action":"subscribe","jobId":"job-1"}"#,
        );
        assert_eq!(
            reply,
            ServerReply::Subscribed {
                job_id: "job-1".to_string()
            }
        );
        assert_eq!(hub.subscriber_count("job-1"), 1);

        let reply = handle_client_message(
            &hub,
            listener.id(),
            r#"{"action":"unsubscribe","jobId":"job-1"}"#,
        );
        assert_eq!(
            reply,
            ServerReply::Unsubscribed {
                job_id: "job-1".to_string(),
                was_subscribed: true
            }
        );
        assert_eq!(hub.subscriber_count("job-1"), 0);
    }

    #[test]
    fn test_subscribe_after_disconnect_is_an_error() {
        let hub = NotificationHub::new(8);
        let listener = hub.connect();
        hub.disconnect(listener.id());

        let reply = handle_client_message(
            &hub,
            listener.id(),
            r#"{"action":"subscribe","jobId":"job-1"}"#,
        );
        assert!(matches!(reply, ServerReply::Error { .. }));
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let hub = NotificationHub::new(8);
        let listener = hub.connect();
        let reply = handle_client_message(&hub, listener.id(), r#"{"action":"shout"}"#);
        assert!(matches!(reply, ServerReply::Error { .. }));
    }

    #[test]
    fn test_reply_wire_format() {
        let reply = ServerReply::Unsubscribed {
            job_id: "job-1".to_string(),
            was_subscribed: false,
        };
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"type": "unsubscribed", "jobId": "job-1", "wasSubscribed": false})
        );
    }
}
