//! Per-chat SSE fan-out to UI clients.
//!
//! Each connected client gets a bounded mpsc queue; `broadcast_to_chat`
//! pushes frames to every live queue and prunes clients whose receiver is
//! gone (disconnected). Keepalive comments go out every 15 s through axum's
//! SSE machinery. The wire shape per frame is
//! `event: <name>` + `data: {"event": <name>, "data": <payload>}`.

use crate::relay::envelope::ErrorEnvelope;
use crate::relay::Relay;
use crate::store::types::Part;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// Queue depth per client; slow consumers drop frames rather than stall
/// the relay (snapshots resynchronize them).
const CLIENT_QUEUE_DEPTH: usize = 128;

/// One event on a chat stream.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastFrame {
    pub event: String,
    pub data: Value,
}

struct ChatConnection {
    id: u64,
    tx: mpsc::Sender<BroadcastFrame>,
}

/// Registry of live UI connections, keyed by chat.
pub struct ChatBroadcaster {
    connections: RwLock<HashMap<String, Vec<ChatConnection>>>,
    next_id: AtomicU64,
}

impl Default for ChatBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatBroadcaster {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a client on a chat. Returns the connection id and the frame
    /// receiver; dropping the receiver disconnects.
    pub async fn register(&self, chat_id: &str) -> (u64, mpsc::Receiver<BroadcastFrame>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut connections = self.connections.write().await;
        let list = connections.entry(chat_id.to_string()).or_default();
        list.push(ChatConnection { id, tx });
        tracing::debug!(chat_id = %chat_id, total = list.len(), "registered stream client");
        (id, rx)
    }

    /// Remove a client explicitly.
    pub async fn unregister(&self, chat_id: &str, conn_id: u64) {
        let mut connections = self.connections.write().await;
        if let Some(list) = connections.get_mut(chat_id) {
            list.retain(|c| c.id != conn_id);
            if list.is_empty() {
                connections.remove(chat_id);
            }
        }
    }

    pub async fn connection_count(&self, chat_id: &str) -> usize {
        self.connections
            .read()
            .await
            .get(chat_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Push an event to every live client of a chat.
    pub async fn broadcast_to_chat(&self, chat_id: &str, event: &str, data: Value) {
        let senders: Vec<(u64, mpsc::Sender<BroadcastFrame>)> = {
            let connections = self.connections.read().await;
            match connections.get(chat_id) {
                Some(list) => list.iter().map(|c| (c.id, c.tx.clone())).collect(),
                None => return,
            }
        };

        let frame = BroadcastFrame {
            event: event.to_string(),
            data,
        };

        let mut dead = Vec::new();
        for (id, tx) in senders {
            match tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(chat_id = %chat_id, conn = id, "client queue full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut connections = self.connections.write().await;
            if let Some(list) = connections.get_mut(chat_id) {
                list.retain(|c| !dead.contains(&c.id));
                if list.is_empty() {
                    connections.remove(chat_id);
                }
            }
            tracing::debug!(chat_id = %chat_id, removed = dead.len(), "pruned dead stream clients");
        }
    }

    // ── event helpers ───────────────────────────────────────────────────

    pub async fn message_snapshot(&self, chat_id: &str, message_id: &str, role: &str, parts: &[Part]) {
        self.broadcast_to_chat(
            chat_id,
            "message_snapshot",
            json!({ "messageID": message_id, "role": role, "parts": parts }),
        )
        .await;
    }

    pub async fn text_delta(&self, chat_id: &str, part_id: &str, delta: &str) {
        self.broadcast_to_chat(
            chat_id,
            "text_delta",
            json!({ "partID": part_id, "text": delta }),
        )
        .await;
    }

    pub async fn tool_status(&self, chat_id: &str, part_id: &str, tool: &str, status: &str) {
        self.broadcast_to_chat(
            chat_id,
            "tool_status",
            json!({ "partID": part_id, "tool": tool, "status": status }),
        )
        .await;
    }

    pub async fn message_complete(
        &self,
        chat_id: &str,
        message_id: &str,
        parts: &[Part],
        status: &str,
    ) {
        self.broadcast_to_chat(
            chat_id,
            "message_complete",
            json!({ "messageID": message_id, "parts": parts, "status": status }),
        )
        .await;
    }

    pub async fn error(&self, chat_id: &str, message_id: &str, envelope: &ErrorEnvelope) {
        self.broadcast_to_chat(
            chat_id,
            "error",
            json!({ "messageID": message_id, "envelope": envelope }),
        )
        .await;
    }
}

/// `GET /api/chats/:id/stream` — attach a UI client to a chat's event feed.
pub async fn stream_chat(
    State(relay): State<Arc<Relay>>,
    Path(chat_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    if chat_id.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if relay.store().chat(&chat_id).await.is_err() {
        return Err(StatusCode::NOT_FOUND);
    }

    let (_, rx) = relay.broadcaster().register(&chat_id).await;
    let stream = ReceiverStream::new(rx).map(|frame| {
        let name = frame.event.clone();
        let payload = serde_json::to_string(&frame)
            .unwrap_or_else(|_| "{\"event\":\"error\",\"data\":null}".to_string());
        Ok::<Event, Infallible>(Event::default().event(name).data(payload))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(relay.config().timing.keepalive())
            .text("ping"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_broadcast_receive() {
        let broadcaster = ChatBroadcaster::new();
        let (_, mut rx) = broadcaster.register("chat1").await;

        broadcaster
            .broadcast_to_chat("chat1", "text_delta", json!({"partID": "p1", "text": "hi"}))
            .await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "text_delta");
        assert_eq!(frame.data["partID"], "p1");
    }

    #[tokio::test]
    async fn test_broadcast_scoped_to_chat() {
        let broadcaster = ChatBroadcaster::new();
        let (_, mut rx_a) = broadcaster.register("chat_a").await;
        let (_, mut rx_b) = broadcaster.register("chat_b").await;

        broadcaster
            .broadcast_to_chat("chat_a", "error", json!({}))
            .await;

        assert_eq!(rx_a.recv().await.unwrap().event, "error");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_connections_pruned() {
        let broadcaster = ChatBroadcaster::new();
        let (_, rx) = broadcaster.register("chat1").await;
        drop(rx);
        assert_eq!(broadcaster.connection_count("chat1").await, 1);

        broadcaster
            .broadcast_to_chat("chat1", "text_delta", json!({}))
            .await;
        assert_eq!(broadcaster.connection_count("chat1").await, 0);
    }

    #[tokio::test]
    async fn test_unregister() {
        let broadcaster = ChatBroadcaster::new();
        let (id, _rx) = broadcaster.register("chat1").await;
        broadcaster.unregister("chat1", id).await;
        assert_eq!(broadcaster.connection_count("chat1").await, 0);
    }

    #[tokio::test]
    async fn test_frame_envelope_shape() {
        let frame = BroadcastFrame {
            event: "message_complete".to_string(),
            data: json!({"messageID": "m1"}),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["event"], "message_complete");
        assert_eq!(value["data"]["messageID"], "m1");
    }
}
