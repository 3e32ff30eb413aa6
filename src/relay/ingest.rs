//! Engine event ingestion.
//!
//! One long-lived task reads the engine's SSE firehose, decodes each
//! `data:` frame, and dispatches by event type. Every handler runs in its
//! own task — the reader itself never touches the store, so one slow
//! handler cannot stall the stream. A dropped stream fails everything in
//! flight and reconnects after a short delay.

use super::Relay;
use crate::engine::events::{
    EngineEvent, MessageUpdatedPayload, PartDeltaPayload, PartUpdatedPayload,
    PermissionAskedPayload, SessionPayload,
};
use futures::StreamExt;
use std::sync::Arc;

impl Relay {
    /// Connect to `GET /event` and pump frames until the process exits.
    pub async fn run_event_loop(self: Arc<Self>) {
        let reconnect_delay = self.config().timing.reconnect_delay();
        tracing::info!(url = %self.engine().base_url(), "connecting engine event stream");

        loop {
            let response = match self.engine().open_event_stream().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = %e, "event stream connection failed");
                    tokio::time::sleep(reconnect_delay).await;
                    continue;
                }
            };
            tracing::info!("engine event stream connected");

            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!(error = %e, "event stream read error");
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // process complete SSE event blocks
                while let Some(block_end) = buffer.find("\n\n") {
                    let block: String = buffer.drain(..block_end + 2).collect();
                    for line in block.lines() {
                        if let Some(data) = line.strip_prefix("data: ") {
                            self.dispatch_frame(data);
                        }
                    }
                }
            }

            // the stream was live and then ended: fail in-flight work, then
            // reconnect
            let relay = self.clone();
            tokio::spawn(async move {
                relay.handle_stream_closed().await;
            });
            tokio::time::sleep(reconnect_delay).await;
        }
    }

    /// Decode one `data:` frame and hand it to the right handler.
    pub fn dispatch_frame(self: &Arc<Self>, data: &str) {
        if data.is_empty() || data == "{}" {
            return;
        }

        let event: EngineEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, data = %data, "undecodable engine event");
                return;
            }
        };
        tracing::trace!(kind = %event.kind, "engine event received");

        match event.kind.as_str() {
            "server.heartbeat" => {
                self.record_heartbeat();
            }

            "permission.asked" => {
                let payload: PermissionAskedPayload = match event.payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(error = %e, "bad permission.asked payload");
                        return;
                    }
                };
                let relay = self.clone();
                tokio::spawn(async move {
                    let chat_id = relay.resolve_chat_id(&payload.session_id).await;
                    if let Err(e) = relay.authority().handle_asked(payload, chat_id).await {
                        tracing::error!(error = %e, "permission handling failed");
                    }
                });
            }

            "message.part.updated" => {
                let payload: PartUpdatedPayload = match event.payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(error = %e, "bad message.part.updated payload");
                        return;
                    }
                };
                let relay = self.clone();
                tokio::spawn(async move {
                    let session_id = payload.part.session_id.clone().unwrap_or_default();
                    let chat_id = relay.resolve_chat_id(&session_id).await;
                    if chat_id.is_empty() {
                        tracing::warn!(session_id = %session_id, "part for unresolvable session");
                        return;
                    }
                    relay.upsert_message_part(&chat_id, payload.part).await;
                });
            }

            "message.part.delta" => {
                let payload: PartDeltaPayload = match event.payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(error = %e, "bad message.part.delta payload");
                        return;
                    }
                };
                let relay = self.clone();
                tokio::spawn(async move {
                    let chat_id = relay.resolve_delta_chat(&payload).await;
                    if chat_id.is_empty() {
                        return;
                    }
                    relay
                        .apply_part_delta(
                            &chat_id,
                            &payload.message_id,
                            &payload.part_id,
                            &payload.delta,
                        )
                        .await;
                });
            }

            "message.updated" => {
                let payload: MessageUpdatedPayload = match event.payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(error = %e, "bad message.updated payload");
                        return;
                    }
                };
                let relay = self.clone();
                tokio::spawn(async move {
                    let chat_id = relay.resolve_chat_id(&payload.info.session_id).await;
                    if chat_id.is_empty() {
                        tracing::warn!(
                            session_id = %payload.info.session_id,
                            "completion for unresolvable session"
                        );
                        return;
                    }
                    relay.handle_message_completion(&chat_id, payload.info).await;
                });
            }

            "message.error" => {
                if let Ok(payload) = event.payload::<SessionPayload>() {
                    let relay = self.clone();
                    tokio::spawn(async move {
                        relay.handle_message_error(payload).await;
                    });
                }
            }

            "session.error" => {
                if let Ok(payload) = event.payload::<SessionPayload>() {
                    let relay = self.clone();
                    tokio::spawn(async move {
                        relay.handle_session_error(payload).await;
                    });
                }
            }

            "session.idle" => {
                if let Ok(payload) = event.payload::<SessionPayload>() {
                    let sid = payload.sid().to_string();
                    if !sid.is_empty() {
                        let relay = self.clone();
                        tokio::spawn(async move {
                            relay.handle_session_idle(&sid).await;
                        });
                    }
                }
            }

            "session.updated" => {
                if let Ok(payload) = event.payload::<SessionPayload>() {
                    let idle = payload.status.as_deref() == Some("idle");
                    let sid = payload.sid().to_string();
                    if idle && !sid.is_empty() {
                        let relay = self.clone();
                        tokio::spawn(async move {
                            relay.handle_session_idle(&sid).await;
                        });
                    }
                }
            }

            other => {
                tracing::trace!(kind = %other, "ignoring engine event");
            }
        }
    }

    /// Deltas usually carry their session id; fall back to the message row
    /// when they do not.
    async fn resolve_delta_chat(&self, payload: &PartDeltaPayload) -> String {
        if let Some(session_id) = payload.session_id.as_deref() {
            if !session_id.is_empty() {
                return self.resolve_chat_id(session_id).await;
            }
        }
        match self.store().message_by_engine_id(&payload.message_id).await {
            Ok(Some(message)) => message.chat_id,
            _ => String::new(),
        }
    }
}
