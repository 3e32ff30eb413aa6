//! Engine session provisioning.

use super::Relay;
use crate::engine::SessionProbe;
use crate::error::Result;

impl Relay {
    /// Get a live engine session for a chat, creating one when needed.
    ///
    /// A cached session id is verified against the engine first. On 404 it
    /// is cleared — unless a subagent row carries the same id, because
    /// subagent sessions expire independently of the chat and clearing
    /// would orphan the parent while it is still relaying for the child.
    /// On a network-level probe failure the cached id is kept
    /// optimistically.
    pub async fn ensure_session(&self, chat_id: &str) -> Result<String> {
        let chat = self.store().chat(chat_id).await?;

        let existing = chat.engine_session_id.clone();
        if !existing.is_empty() {
            match self.engine().probe_session(&existing).await {
                SessionProbe::Alive => return Ok(existing),
                SessionProbe::Unknown => return Ok(existing),
                SessionProbe::Missing => {
                    let is_subagent = self
                        .store()
                        .subagent_by_sid(&existing)
                        .await?
                        .is_some();
                    if !is_subagent {
                        tracing::warn!(
                            chat_id = %chat_id,
                            session_id = %existing,
                            "clearing vanished session from chat"
                        );
                        self.with_chat_lock(chat_id, |chat| {
                            chat.engine_session_id.clear();
                        })
                        .await?;
                    }
                }
            }
        }

        let new_id = self.engine().create_session().await?;
        self.with_chat_lock(chat_id, |chat| {
            chat.engine_session_id = new_id.clone();
            chat.engine_type = "opencode".to_string();
        })
        .await?;

        tracing::info!(chat_id = %chat_id, session_id = %new_id, "provisioned engine session");
        Ok(new_id)
    }
}
