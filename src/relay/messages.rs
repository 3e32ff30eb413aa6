//! Message assembly: parts, deltas, completion, failure.
//!
//! The engine emits message content exclusively as `message.part.updated`
//! (one complete part) and `message.part.delta` (incremental text) events,
//! with `message.updated` carrying metadata and the completion signal.
//! Parts buffer in the cache, snapshots go out debounced, and completion
//! performs the final authoritative flush to the store. All of it is
//! serialized per engine message id.

use super::envelope::ErrorEnvelope;
use super::parts::UpsertOutcome;
use super::Relay;
use crate::engine::events::{MessageInfo, SessionPayload};
use crate::error::Result;
use crate::store::types::{
    EngineMessageStatus, Message, Part, PartKind, Role, Subagent, Turn, UserMessageStatus,
};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Tool names whose output can announce a completed handoff to a subagent.
const HANDOFF_TOOLS: [&str; 4] = ["handoff", "assign", "cao_handoff", "cao_assign"];
/// Marker key inside a handoff tool result (legacy results omit the
/// leading underscore).
const HANDOFF_EVENT_KEYS: [&str; 2] = ["_pocketcoder_sys_event", "pocketcoder_sys_event"];
const HANDOFF_COMPLETE: &str = "handoff_complete";

const PREVIEW_MAX_CHARS: usize = 50;

fn status_label(status: EngineMessageStatus) -> &'static str {
    match status {
        EngineMessageStatus::Completed => "completed",
        EngineMessageStatus::Failed => "failed",
        _ => "processing",
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

/// Upsert `incoming` into `existing` by part id, then restore lexicographic
/// order.
fn merge_parts(existing: &mut Vec<Part>, incoming: Vec<Part>) {
    for part in incoming {
        if let Some(slot) = existing.iter_mut().find(|p| p.id == part.id) {
            *slot = part;
        } else {
            existing.push(part);
        }
    }
    existing.sort_by(|a, b| a.id.cmp(&b.id));
}

/// First non-empty text part, truncated for the chat list.
fn extract_preview(parts: &[Part]) -> String {
    let text = parts
        .iter()
        .filter(|p| p.kind == PartKind::Text)
        .find_map(|p| p.text.as_deref().filter(|t| !t.is_empty()))
        .unwrap_or("");
    if text.chars().count() > PREVIEW_MAX_CHARS {
        let truncated: String = text.chars().take(PREVIEW_MAX_CHARS).collect();
        format!("{truncated}...")
    } else {
        text.to_string()
    }
}

impl Relay {
    // ── part arrival ────────────────────────────────────────────────────

    /// Handle a `message.part.updated` event for a resolved chat.
    pub async fn upsert_message_part(self: &Arc<Self>, chat_id: &str, part: Part) {
        let engine_msg_id = part.message_id.clone().unwrap_or_default();
        if engine_msg_id.is_empty() {
            return;
        }

        if self.completed.contains(&engine_msg_id).await {
            self.handle_late_part(chat_id, &engine_msg_id, part).await;
            return;
        }

        let is_tool = part.kind == PartKind::Tool;
        let tool_name = part.tool.clone();
        let tool_status = part.state.as_ref().and_then(|s| s.status.clone());
        let part_id = part.id.clone();

        {
            let mutex = self.msg_mutexes.entry(&engine_msg_id);
            let _guard = mutex.lock().await;

            match self.parts.upsert(&engine_msg_id, part.clone()).await {
                UpsertOutcome::Unchanged => return,
                UpsertOutcome::Inserted { first_for_message } => {
                    if first_for_message {
                        // Make the row visible on first contact so the UI
                        // sees the processing state without waiting for a
                        // snapshot tick.
                        let role = part
                            .extra
                            .get("role")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        if let Err(e) = self
                            .ensure_message_record(
                                chat_id,
                                &engine_msg_id,
                                role.as_deref(),
                                Some(&part),
                            )
                            .await
                        {
                            tracing::error!(
                                engine_message_id = %engine_msg_id,
                                error = %e,
                                "failed to ensure message record"
                            );
                        }
                    }
                }
            }

            self.schedule_snapshots(chat_id, &engine_msg_id);
        }

        if is_tool {
            if let (Some(tool), Some(status)) = (tool_name.as_deref(), tool_status.as_deref()) {
                self.broadcaster()
                    .tool_status(chat_id, &part_id, tool, status)
                    .await;
            }
            self.check_subagent_handoff(chat_id, &part).await;
        }
    }

    /// Handle a `message.part.delta` event: append to the cached text part,
    /// push the delta straight to listeners, and let the debouncers settle
    /// the authoritative snapshot.
    pub async fn apply_part_delta(
        self: &Arc<Self>,
        chat_id: &str,
        engine_msg_id: &str,
        part_id: &str,
        delta: &str,
    ) {
        if engine_msg_id.is_empty() || part_id.is_empty() || delta.is_empty() {
            return;
        }

        {
            let mutex = self.msg_mutexes.entry(engine_msg_id);
            let _guard = mutex.lock().await;
            self.parts.append_delta(engine_msg_id, part_id, delta).await;
            self.schedule_snapshots(chat_id, engine_msg_id);
        }

        self.broadcaster().text_delta(chat_id, part_id, delta).await;
    }

    /// A part for a message whose final flush already happened: broadcast
    /// immediately, re-buffer it, and catch the database up — without ever
    /// touching the (final) status.
    async fn handle_late_part(self: &Arc<Self>, chat_id: &str, engine_msg_id: &str, part: Part) {
        tracing::info!(
            engine_message_id = %engine_msg_id,
            part_id = %part.id,
            "late-arriving part, resyncing"
        );
        {
            let mutex = self.msg_mutexes.entry(engine_msg_id);
            let _guard = mutex.lock().await;
            self.parts.upsert(engine_msg_id, part).await;
        }
        self.broadcast_snapshot(chat_id, engine_msg_id).await;

        let relay = self.clone();
        let chat_id = chat_id.to_string();
        let engine_msg_id = engine_msg_id.to_string();
        tokio::spawn(async move {
            relay.sync_late_parts(&chat_id, &engine_msg_id).await;
            tokio::time::sleep(relay.config().timing.completed_gc()).await;
            let mutex = relay.msg_mutexes.entry(&engine_msg_id);
            let _guard = mutex.lock().await;
            relay.parts.remove(&engine_msg_id).await;
        });
    }

    // ── snapshots ───────────────────────────────────────────────────────

    fn schedule_snapshots(self: &Arc<Self>, chat_id: &str, engine_msg_id: &str) {
        let relay = self.clone();
        let chat = chat_id.to_string();
        let id = engine_msg_id.to_string();
        self.scheduler.schedule_broadcast(engine_msg_id, async move {
            relay.broadcast_snapshot(&chat, &id).await;
        });

        let relay = self.clone();
        let chat = chat_id.to_string();
        let id = engine_msg_id.to_string();
        self.scheduler
            .schedule_store_write(engine_msg_id, async move {
                relay.write_snapshot(&chat, &id).await;
            });
    }

    /// Emit a sorted snapshot of the buffered parts on the chat stream.
    pub(crate) async fn broadcast_snapshot(&self, chat_id: &str, engine_msg_id: &str) {
        let mutex = self.msg_mutexes.entry(engine_msg_id);
        let _guard = mutex.lock().await;

        let parts = self.parts.snapshot(engine_msg_id).await;
        if parts.is_empty() {
            return;
        }

        let role = match self.store().message_by_engine_id(engine_msg_id).await {
            Ok(Some(message)) => role_label(message.role),
            _ => "assistant",
        };

        self.broadcaster()
            .message_snapshot(chat_id, engine_msg_id, role, &parts)
            .await;
    }

    /// Persist the buffered snapshot, respecting status monotonicity: a
    /// row that already reached a final status is left alone.
    pub(crate) async fn write_snapshot(&self, _chat_id: &str, engine_msg_id: &str) {
        let mutex = self.msg_mutexes.entry(engine_msg_id);
        let _guard = mutex.lock().await;

        let parts = self.parts.snapshot(engine_msg_id).await;
        if parts.is_empty() {
            return;
        }

        let mut record = match self.store().message_by_engine_id(engine_msg_id).await {
            Ok(Some(record)) => record,
            _ => return,
        };
        if record.engine_message_status.is_final() {
            return;
        }

        record.parts = parts;
        if record.engine_message_status == EngineMessageStatus::Unset {
            record.engine_message_status = EngineMessageStatus::Processing;
        }
        record.updated = Some(Utc::now());

        if let Err(e) = self.save_message_with_retry(&record).await {
            tracing::error!(
                engine_message_id = %engine_msg_id,
                error = %e,
                "snapshot write failed"
            );
        }
    }

    /// Merge late-buffered parts into the persisted row. Status is not
    /// touched: the row stays `completed`/`failed`, only its parts catch up.
    async fn sync_late_parts(&self, _chat_id: &str, engine_msg_id: &str) {
        let mutex = self.msg_mutexes.entry(engine_msg_id);
        let _guard = mutex.lock().await;

        let cached = self.parts.snapshot(engine_msg_id).await;
        if cached.is_empty() {
            return;
        }

        let mut record = match self.store().message_by_engine_id(engine_msg_id).await {
            Ok(Some(record)) => record,
            _ => return,
        };

        merge_parts(&mut record.parts, cached);
        record.updated = Some(Utc::now());

        if let Err(e) = self.save_message_with_retry(&record).await {
            tracing::error!(
                engine_message_id = %engine_msg_id,
                error = %e,
                "late part sync failed"
            );
        }
    }

    // ── record resolution ───────────────────────────────────────────────

    /// Find or create the local row for an engine message.
    ///
    /// Engine echoes of user prompts adopt the newest local user message
    /// that has no engine id yet. Otherwise a row is only created once the
    /// evidence says "assistant" (explicit role, `step-start` part, a
    /// parent id, or the chat's turn); ambiguous events return `None` and
    /// are settled by a later part or the completion.
    pub async fn ensure_message_record(
        &self,
        chat_id: &str,
        engine_msg_id: &str,
        role: Option<&str>,
        part: Option<&Part>,
    ) -> Result<Option<Message>> {
        if let Some(existing) = self.store().message_by_engine_id(engine_msg_id).await? {
            return Ok(Some(existing));
        }

        if matches!(role, None | Some("user") | Some("")) {
            if let Some(mut user_msg) = self
                .store()
                .latest_unmapped_user_message(chat_id)
                .await?
            {
                user_msg.engine_message_id = engine_msg_id.to_string();
                user_msg.user_message_status = UserMessageStatus::Delivered;
                if self.save_message_with_retry(&user_msg).await.is_ok() {
                    tracing::info!(
                        engine_message_id = %engine_msg_id,
                        message_id = %user_msg.id,
                        "mapped pending user message"
                    );
                    return Ok(Some(user_msg));
                }
            }
            if role == Some("user") {
                // expected an echo, found nothing — completion will settle it
                return Ok(None);
            }
        }

        let mut is_assistant = role == Some("assistant");
        if let Some(part) = part {
            if part.kind == PartKind::StepStart || part.parent_id.is_some() {
                is_assistant = true;
            }
            if part
                .extra
                .get("metadata")
                .and_then(|m| m.get("parentID"))
                .is_some()
            {
                is_assistant = true;
            }
        }
        if !is_assistant {
            if let Ok(chat) = self.store().chat(chat_id).await {
                if chat.turn == Turn::Assistant {
                    is_assistant = true;
                }
            }
        }
        if !is_assistant {
            // not sure yet — do not hijack a possible user echo
            return Ok(None);
        }

        let created = self
            .create_message_with_retry(Message {
                chat_id: chat_id.to_string(),
                role: Role::Assistant,
                engine_message_id: engine_msg_id.to_string(),
                engine_message_status: EngineMessageStatus::Processing,
                ..Default::default()
            })
            .await?;
        tracing::info!(engine_message_id = %engine_msg_id, "created assistant record");
        Ok(Some(created))
    }

    // ── completion ──────────────────────────────────────────────────────

    /// Handle a `message.updated` event: the final authoritative sync from
    /// the part cache to the store.
    pub async fn handle_message_completion(self: &Arc<Self>, chat_id: &str, info: MessageInfo) {
        let engine_msg_id = info.id.clone();
        if engine_msg_id.is_empty() {
            return;
        }
        if self.completed.contains(&engine_msg_id).await {
            return;
        }

        let completed = info.is_completed();
        let has_error = info.error.is_some();
        let role = info.role.clone().unwrap_or_default();

        let new_status = if completed || role == "user" {
            EngineMessageStatus::Completed
        } else if has_error {
            EngineMessageStatus::Failed
        } else {
            EngineMessageStatus::Processing
        };

        tracing::info!(
            engine_message_id = %engine_msg_id,
            role = %role,
            completed,
            has_error,
            "message update received"
        );

        let mutex = self.msg_mutexes.entry(&engine_msg_id);
        let guard = mutex.lock().await;
        if self.completed.contains(&engine_msg_id).await {
            return;
        }

        // this is the final sync; pending timers would only redo stale work
        self.scheduler.cancel(&engine_msg_id);

        let cached = if new_status == EngineMessageStatus::Processing {
            self.parts.snapshot(&engine_msg_id).await
        } else {
            self.parts.take(&engine_msg_id).await
        };

        let mut record = match self
            .ensure_message_record(
                chat_id,
                &engine_msg_id,
                Some(role.as_str()).filter(|r| !r.is_empty()),
                None,
            )
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(
                    engine_message_id = %engine_msg_id,
                    "completion for unresolvable message, skipping"
                );
                return;
            }
            Err(e) => {
                tracing::error!(
                    engine_message_id = %engine_msg_id,
                    error = %e,
                    "completion failed to ensure record"
                );
                return;
            }
        };

        if !cached.is_empty() {
            merge_parts(&mut record.parts, cached);
        }

        if !record.engine_message_status.is_final() {
            record.engine_message_status = new_status;
        }
        if let Some(parent_id) = info.parent_id.as_deref() {
            if !parent_id.is_empty() {
                record.parent_id = parent_id.to_string();
            }
        }
        if info.cost.is_some() {
            record.cost = info.cost;
        }
        if let Some(tokens) = info.tokens.clone() {
            record.tokens = Some(tokens);
        }
        if let Some(finish) = info.finish.clone() {
            record.finish_reason = finish;
        }
        if let Some(error) = info.error.clone() {
            record.error = Some(Value::Object(error));
        }
        record.updated = Some(Utc::now());

        if let Err(e) = self.save_message_with_retry(&record).await {
            tracing::error!(
                engine_message_id = %engine_msg_id,
                error = %e,
                "failed to save final record"
            );
            return;
        }

        if new_status != EngineMessageStatus::Processing {
            // recorded only after the final write so a concurrent handler
            // re-checking under the mutex sees consistent state
            self.completed.insert(&engine_msg_id).await;
            self.schedule_completion_gc(&engine_msg_id);
        }

        // chat metadata below takes the chat mutex; release the message
        // mutex first to respect the lock hierarchy
        drop(guard);

        tracing::info!(
            engine_message_id = %engine_msg_id,
            status = status_label(record.engine_message_status),
            "final record saved"
        );

        self.broadcaster()
            .message_complete(
                chat_id,
                &engine_msg_id,
                &record.parts,
                status_label(record.engine_message_status),
            )
            .await;

        let preview = extract_preview(&record.parts);
        let result = self
            .with_chat_lock(chat_id, |chat| {
                if !preview.is_empty()
                    && (preview.len() > chat.preview.len()
                        || (preview.len() == chat.preview.len() && preview != chat.preview))
                {
                    chat.preview = preview.clone();
                }
                chat.last_active = Some(Utc::now());
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(chat_id = %chat_id, error = %e, "failed to refresh chat metadata");
        }
    }

    /// Delayed cleanup of tracking state so very late events still find it.
    fn schedule_completion_gc(self: &Arc<Self>, engine_msg_id: &str) {
        let relay = self.clone();
        let id = engine_msg_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(relay.config().timing.completed_gc()).await;
            {
                let mutex = relay.msg_mutexes.entry(&id);
                let _guard = mutex.lock().await;
                relay.completed.remove(&id).await;
                relay.parts.remove(&id).await;
            }
            relay.msg_mutexes.remove(&id);
        });
    }

    // ── failure paths ───────────────────────────────────────────────────

    /// Promote a message to `failed` with a trailing error part, notify the
    /// chat, and hand the turn back to the user.
    pub async fn handle_error_completion(
        &self,
        chat_id: &str,
        message_id: &str,
        envelope: ErrorEnvelope,
    ) {
        let mut record = match self.store().message(message_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(message_id = %message_id, error = %e, "error completion: no row");
                return;
            }
        };
        if record.engine_message_status.is_final() {
            return;
        }

        record.engine_message_status = EngineMessageStatus::Failed;
        record.parts.push(Part::from_envelope(envelope.clone()));
        record.updated = Some(Utc::now());

        if let Err(e) = self.save_message_with_retry(&record).await {
            tracing::error!(message_id = %message_id, error = %e, "failed to persist failure");
        }

        self.broadcaster().error(chat_id, message_id, &envelope).await;

        if let Err(e) = self
            .with_chat_lock(chat_id, |chat| {
                chat.turn = Turn::User;
            })
            .await
        {
            tracing::warn!(chat_id = %chat_id, error = %e, "failed to flip turn after failure");
        }
    }

    /// `message.error` — wrap the engine's error and fail the message.
    pub async fn handle_message_error(&self, payload: SessionPayload) {
        let engine_msg_id = payload.id.clone().unwrap_or_default();
        let session_id = payload.session_id.clone().unwrap_or_default();
        let chat_id = self.resolve_chat_id(&session_id).await;
        if chat_id.is_empty() {
            return;
        }

        let envelope = ErrorEnvelope::provider(&payload.error.clone().unwrap_or_default());
        if let Ok(Some(record)) = self.store().message_by_engine_id(&engine_msg_id).await {
            self.handle_error_completion(&chat_id, &record.id, envelope)
                .await;
        }
    }

    /// `session.error` — no specific message; surface the envelope on the
    /// chat stream.
    pub async fn handle_session_error(&self, payload: SessionPayload) {
        let chat_id = self.resolve_chat_id(payload.sid()).await;
        if chat_id.is_empty() {
            return;
        }
        let envelope = ErrorEnvelope::provider(&payload.error.clone().unwrap_or_default());
        self.broadcaster()
            .broadcast_to_chat(
                &chat_id,
                "error",
                serde_json::json!({ "envelope": envelope }),
            )
            .await;
    }

    // ── subagent lineage ────────────────────────────────────────────────

    /// Inspect a tool part for a completed handoff and persist the
    /// subagent lineage so its session id resolves to this chat.
    pub(crate) async fn check_subagent_handoff(&self, chat_id: &str, part: &Part) {
        if part.kind != PartKind::Tool {
            return;
        }
        let Some(tool) = part.tool.as_deref() else {
            return;
        };
        if !HANDOFF_TOOLS.contains(&tool) {
            return;
        }
        let Some(output) = part.state.as_ref().and_then(|s| s.output.as_ref()) else {
            return;
        };
        let Some(output_str) = output.as_str() else {
            return;
        };
        if output_str.is_empty() {
            return;
        }
        let Ok(result) = serde_json::from_str::<Map<String, Value>>(output_str) else {
            return;
        };

        let sys_event = HANDOFF_EVENT_KEYS
            .iter()
            .find_map(|key| result.get(*key).and_then(Value::as_str))
            .unwrap_or("");
        if sys_event != HANDOFF_COMPLETE {
            return;
        }

        let subagent_id = result
            .get("subagent_id")
            .and_then(Value::as_str)
            .unwrap_or("");
        if subagent_id.is_empty() {
            return;
        }
        let tmux_window_id = result
            .get("tmux_window_id")
            .and_then(Value::as_i64)
            .or_else(|| {
                result
                    .get("tmux_window_id")
                    .and_then(Value::as_f64)
                    .map(|f| f as i64)
            })
            .unwrap_or(0);

        self.register_subagent(chat_id, subagent_id, tmux_window_id)
            .await;
    }

    async fn register_subagent(&self, chat_id: &str, subagent_id: &str, tmux_window_id: i64) {
        match self.store().subagent_by_sid(subagent_id).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(subagent_id = %subagent_id, error = %e, "subagent lookup failed");
                return;
            }
        }

        let chat = match self.store().chat(chat_id).await {
            Ok(chat) => chat,
            Err(_) => return,
        };

        match self
            .store()
            .create_subagent(Subagent {
                subagent_id: subagent_id.to_string(),
                delegating_agent_id: chat.engine_session_id.clone(),
                tmux_window_id,
                chat_id: chat_id.to_string(),
                ..Default::default()
            })
            .await
        {
            Ok(_) => {
                tracing::info!(subagent_id = %subagent_id, chat_id = %chat_id, "persisted subagent lineage");
            }
            Err(e) => {
                tracing::warn!(subagent_id = %subagent_id, error = %e, "failed to persist subagent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_parts_upserts_and_sorts() {
        let mut existing = vec![Part::text("b", "old b"), Part::text("d", "d")];
        merge_parts(
            &mut existing,
            vec![Part::text("c", "c"), Part::text("b", "new b")],
        );
        let ids: Vec<&str> = existing.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "d"]);
        assert_eq!(existing[0].text.as_deref(), Some("new b"));
    }

    #[test]
    fn test_extract_preview_first_text_part() {
        let parts = vec![
            Part {
                id: "a".to_string(),
                kind: PartKind::StepStart,
                ..Default::default()
            },
            Part::text("b", "the answer"),
            Part::text("c", "later text"),
        ];
        assert_eq!(extract_preview(&parts), "the answer");
    }

    #[test]
    fn test_extract_preview_truncates() {
        let long = "x".repeat(80);
        let parts = vec![Part::text("a", long)];
        let preview = extract_preview(&parts);
        assert_eq!(preview.chars().count(), 53);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_extract_preview_empty() {
        assert_eq!(extract_preview(&[]), "");
        let parts = vec![Part {
            id: "a".to_string(),
            kind: PartKind::Tool,
            tool: Some("bash".to_string()),
            ..Default::default()
        }];
        assert_eq!(extract_preview(&parts), "");
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(status_label(EngineMessageStatus::Completed), "completed");
        assert_eq!(status_label(EngineMessageStatus::Failed), "failed");
        assert_eq!(status_label(EngineMessageStatus::Processing), "processing");
        assert_eq!(status_label(EngineMessageStatus::Unset), "processing");
    }
}
