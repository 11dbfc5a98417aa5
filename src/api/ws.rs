//! WebSocket push channel for receipt status updates.
//!
//! Clients authenticate at upgrade time with the same bearer credential as
//! the REST API (as a query parameter; browser WebSocket clients cannot
//! set headers), then subscribe to individual receipt topics. Reconnecting
//! after a drop is the client's job.

use crate::api::AppState;
use crate::db::queries;
use crate::notify::ReceiptEvent;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct WsAuthParams {
    pub token: String,
}

/// Client -> server frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsClientMessage {
    Ping,
    Subscribe { receipt_id: Uuid },
}

/// Server -> client control frames. Receipt events are forwarded in their
/// own (`type`-tagged) shape from the hub.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsControlMessage {
    Pong,
    Subscribed { receipt_id: Uuid },
    Error { message: String },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsAuthParams>,
    State(state): State<AppState>,
) -> Response {
    let user_id = match queries::lookup_token(&state.pool, &params.token).await {
        Ok(Some(user_id)) => user_id,
        Ok(None) => return crate::error::AppError::Unauthorized.into_response(),
        Err(e) => return crate::error::AppError::Database(e).into_response(),
    };
    ws.on_upgrade(move |socket| handle_connection(socket, state, user_id))
}

async fn handle_connection(socket: WebSocket, state: AppState, user_id: Uuid) {
    info!(%user_id, "websocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Forward queued payloads to the actual websocket.
    let mut send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sender.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    // Receive client frames and manage subscriptions.
    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        // One forwarder per receipt per connection; repeat subscribes
        // are acknowledged without spawning another.
        let mut subscriptions: HashSet<Uuid> = HashSet::new();
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<WsClientMessage>(&text) {
                    Ok(client_msg) => {
                        handle_client_message(
                            client_msg,
                            &tx,
                            &recv_state,
                            user_id,
                            &mut subscriptions,
                        )
                        .await
                    }
                    Err(_) => {
                        warn!(%user_id, "invalid websocket frame: {}", text);
                        send_control(
                            &tx,
                            &WsControlMessage::Error {
                                message: "invalid message".into(),
                            },
                        );
                    }
                },
                Message::Close(_) => break,
                _ => {} // binary, ping, pong
            }
        }
    });

    // Either task ending means the connection is done.
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    info!(%user_id, "websocket client disconnected");
}

async fn handle_client_message(
    msg: WsClientMessage,
    tx: &mpsc::UnboundedSender<String>,
    state: &AppState,
    user_id: Uuid,
    subscriptions: &mut HashSet<Uuid>,
) {
    match msg {
        WsClientMessage::Ping => send_control(tx, &WsControlMessage::Pong),
        WsClientMessage::Subscribe { receipt_id } => {
            // Ownership gate: other users' receipts look nonexistent.
            let owns = state
                .service
                .owns_receipt(user_id, receipt_id)
                .await
                .unwrap_or(false);
            if !owns {
                send_control(
                    tx,
                    &WsControlMessage::Error {
                        message: "receipt not found".into(),
                    },
                );
                return;
            }

            if !subscriptions.insert(receipt_id) {
                // Already forwarding this topic; just re-acknowledge.
                send_control(tx, &WsControlMessage::Subscribed { receipt_id });
                return;
            }

            let events = state.hub.subscribe(receipt_id);
            send_control(tx, &WsControlMessage::Subscribed { receipt_id });
            debug!(%user_id, %receipt_id, "websocket subscription added");

            tokio::spawn(forward_events(receipt_id, events, tx.clone()));
        }
    }
}

/// Forward one topic's events onto a connection's outbound channel.
/// Exits when the topic closes or the connection goes away, whichever
/// comes first; an idle subscription must not hold the topic open after
/// the client disconnects.
async fn forward_events(
    receipt_id: Uuid,
    mut events: broadcast::Receiver<ReceiptEvent>,
    forward_tx: mpsc::UnboundedSender<String>,
) {
    loop {
        tokio::select! {
            _ = forward_tx.closed() => break,
            received = events.recv() => match received {
                Ok(event) => {
                    let payload = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(_) => continue,
                    };
                    if forward_tx.send(payload).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%receipt_id, skipped, "websocket subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!(%receipt_id, "websocket forwarder stopped");
}

fn send_control(tx: &mpsc::UnboundedSender<String>, msg: &WsControlMessage) {
    if let Ok(json) = serde_json::to_string(msg) {
        let _ = tx.send(json);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReceiptStatus;
    use crate::notify::StatusHub;
    use std::time::Duration;

    #[tokio::test]
    async fn forwarder_delivers_topic_events_as_json() {
        let hub = StatusHub::new();
        let receipt_id = Uuid::new_v4();
        let events = hub.subscribe(receipt_id);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_events(receipt_id, events, tx));

        hub.status_updated(receipt_id, ReceiptStatus::OcrInProgress, None);

        let payload = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["type"], "status_updated");
        assert_eq!(json["receipt_id"], receipt_id.to_string());
    }

    #[tokio::test]
    async fn forwarder_exits_when_connection_goes_away() {
        let hub = StatusHub::new();
        let receipt_id = Uuid::new_v4();
        let events = hub.subscribe(receipt_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_events(receipt_id, events, tx));

        // Dropping the connection's receiving half must end the task
        // even though the topic never publishes again.
        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), forwarder)
            .await
            .expect("forwarder kept running after the connection closed")
            .unwrap();

        // With its receiver gone, the next publish drops the topic.
        hub.status_updated(receipt_id, ReceiptStatus::Ready, None);
        assert_eq!(hub.topic_count(), 0);
    }

    #[test]
    fn client_messages_deserialize() {
        let msg: WsClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, WsClientMessage::Ping));

        let id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"subscribe","receipt_id":"{}"}}"#, id);
        let msg: WsClientMessage = serde_json::from_str(&raw).unwrap();
        match msg {
            WsClientMessage::Subscribe { receipt_id } => assert_eq!(receipt_id, id),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn control_messages_serialize_tagged() {
        let json = serde_json::to_value(&WsControlMessage::Pong).unwrap();
        assert_eq!(json["type"], "pong");

        let json = serde_json::to_value(&WsControlMessage::Subscribed {
            receipt_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(json["type"], "subscribed");
    }
}
