//! The user-message pump.
//!
//! Pending user messages are claimed, matched with a live engine session,
//! and posted via `prompt_async`. Triggered by the record-create hook, by a
//! recovery sweep at startup, and again on `session.idle` so queued
//! double-texting drains as soon as the assistant yields the turn.

use super::Relay;
use crate::store::types::{Message, Turn, UserMessageStatus};
use std::sync::Arc;
use std::time::Duration;

/// Attempts to observe the session id persisted on the chat row before
/// prompting (closes the write-read race with the event stream).
const SESSION_VERIFY_ATTEMPTS: u32 = 5;
const SESSION_VERIFY_BASE_DELAY_MS: u64 = 10;

/// Recovery sweep batch size.
const RECOVERY_BATCH: usize = 100;

impl Relay {
    /// Deliver one user message to the engine.
    pub async fn process_user_message(&self, message: Message) {
        tracing::info!(message_id = %message.id, "processing user message");

        let chat_id = message.chat_id.clone();
        if self.store().chat(&chat_id).await.is_err() {
            tracing::warn!(
                message_id = %message.id,
                chat_id = %chat_id,
                "no chat context for user message"
            );
            return;
        }

        // Claim: re-read and flip to `sending` so exactly one pump task
        // carries the message forward.
        let mut message = match self.store().message(&message.id).await {
            Ok(fresh) => fresh,
            Err(e) => {
                tracing::warn!(message_id = %message.id, error = %e, "message vanished");
                return;
            }
        };
        if !matches!(
            message.user_message_status,
            UserMessageStatus::Pending | UserMessageStatus::Unset
        ) {
            tracing::debug!(message_id = %message.id, "message already claimed");
            return;
        }
        message.user_message_status = UserMessageStatus::Sending;
        if let Err(e) = self.store().save_message(&message).await {
            tracing::error!(message_id = %message.id, error = %e, "failed to claim message");
            return;
        }

        if let Err(e) = self
            .with_chat_lock(&chat_id, |chat| {
                chat.turn = Turn::Assistant;
            })
            .await
        {
            tracing::error!(chat_id = %chat_id, error = %e, "failed to flip turn");
        }

        let session_id = match self.ensure_session(&chat_id).await {
            Ok(session_id) => session_id,
            Err(e) => {
                tracing::error!(chat_id = %chat_id, error = %e, "session provisioning failed");
                self.mark_user_message(&mut message, UserMessageStatus::Failed)
                    .await;
                return;
            }
        };

        if !self.verify_session_persisted(&chat_id, &session_id).await {
            tracing::error!(
                chat_id = %chat_id,
                session_id = %session_id,
                "session id not visible on chat row after retries"
            );
            self.mark_user_message(&mut message, UserMessageStatus::Failed)
                .await;
            return;
        }

        match self.engine().prompt_async(&session_id, &message.parts).await {
            Ok(()) => {
                self.mark_user_message(&mut message, UserMessageStatus::Delivered)
                    .await;
                tracing::info!(message_id = %message.id, "message delivered to engine");
            }
            Err(e) => {
                tracing::error!(message_id = %message.id, error = %e, "engine prompt failed");
                self.mark_user_message(&mut message, UserMessageStatus::Failed)
                    .await;
            }
        }
    }

    /// The engine starts emitting events for a session the moment the
    /// prompt lands; make sure the session id is readable on the chat row
    /// first so those events resolve.
    async fn verify_session_persisted(&self, chat_id: &str, session_id: &str) -> bool {
        for attempt in 0..SESSION_VERIFY_ATTEMPTS {
            if let Ok(chat) = self.store().chat(chat_id).await {
                if chat.engine_session_id == session_id {
                    return true;
                }
            }
            if attempt + 1 < SESSION_VERIFY_ATTEMPTS {
                let delay = Duration::from_millis(SESSION_VERIFY_BASE_DELAY_MS << attempt);
                tracing::warn!(
                    chat_id = %chat_id,
                    attempt = attempt + 1,
                    "session id not persisted yet, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
        false
    }

    async fn mark_user_message(&self, message: &mut Message, status: UserMessageStatus) {
        message.user_message_status = status;
        if let Err(e) = self.store().save_message(message).await {
            tracing::error!(message_id = %message.id, error = %e, "failed to update message status");
        }
    }

    /// Sweep for user messages that never reached the engine and pump each
    /// one in its own task.
    pub async fn recover_missed_messages(self: &Arc<Self>) {
        tracing::info!("recovery pump: checking for unsent user messages");
        let pending = match self.store().pending_user_messages(RECOVERY_BATCH).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "recovery check failed");
                return;
            }
        };

        if pending.is_empty() {
            tracing::debug!("recovery pump: all messages sent");
            return;
        }

        tracing::info!(count = pending.len(), "recovery pump found unsent messages");
        for message in pending {
            let relay = self.clone();
            tokio::spawn(async move {
                relay.process_user_message(message).await;
            });
        }
    }

    /// `session.idle` — the assistant yielded. Hand the turn back unless a
    /// permission draft is still pausing the turn, then drain the queue.
    pub async fn handle_session_idle(self: &Arc<Self>, session_id: &str) {
        tracing::debug!(session_id = %session_id, "session reported idle");
        let chat_id = self.resolve_chat_id(session_id).await;
        if chat_id.is_empty() {
            tracing::warn!(session_id = %session_id, "idle for unresolvable session");
            return;
        }

        let chat = match self.store().chat(&chat_id).await {
            Ok(chat) => chat,
            Err(e) => {
                tracing::warn!(chat_id = %chat_id, error = %e, "idle for missing chat");
                return;
            }
        };
        if chat.turn != Turn::Assistant {
            return;
        }

        // A draft permission means the turn is paused on human input, not
        // finished; keep holding it so the post-approval response lands in
        // the same turn.
        match self.store().draft_permission_for_chat(&chat_id).await {
            Ok(Some(_)) => {
                tracing::info!(chat_id = %chat_id, "idle with pending permission, holding turn");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(chat_id = %chat_id, error = %e, "permission lookup failed");
            }
        }

        tracing::info!(chat_id = %chat_id, "flipping turn to user");
        if let Err(e) = self
            .with_chat_lock(&chat_id, |chat| {
                chat.turn = Turn::User;
            })
            .await
        {
            tracing::error!(chat_id = %chat_id, error = %e, "failed to flip turn");
            return;
        }

        let relay = self.clone();
        tokio::spawn(async move {
            relay.recover_missed_messages().await;
        });
    }
}
