//! In-memory record store.
//!
//! Backs embedded deployments and tests. Tables are plain vectors behind a
//! single `RwLock`; hook events fan out through a `tokio::sync::broadcast`
//! channel after the write is committed, mirroring the production store's
//! after-success hooks.

use super::{HookAction, RecordChange, Store, StoreEvent};
use crate::error::{Error, Result};
use crate::store::types::{
    AgentProfile, Chat, HealthStatus, Healthcheck, McpServer, McpStatus, Message, ModelProfile,
    Permission, PermissionRuleRow, PermissionStatus, PromptTemplate, Proposal, Role, Sop, SshKey,
    Subagent, Turn, UserMessageStatus, WhitelistAction, WhitelistTarget,
};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

const HOOK_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Tables {
    chats: Vec<Chat>,
    messages: Vec<Message>,
    permissions: Vec<Permission>,
    whitelist_actions: Vec<WhitelistAction>,
    whitelist_targets: Vec<WhitelistTarget>,
    subagents: Vec<Subagent>,
    ssh_keys: Vec<SshKey>,
    mcp_servers: Vec<McpServer>,
    agents: Vec<AgentProfile>,
    prompts: Vec<PromptTemplate>,
    models: Vec<ModelProfile>,
    permission_rules: Vec<PermissionRuleRow>,
    proposals: Vec<Proposal>,
    sops: Vec<Sop>,
    healthchecks: Vec<Healthcheck>,
}

/// In-memory [`Store`] implementation.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    hooks: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (hooks, _) = broadcast::channel(HOOK_CHANNEL_CAPACITY);
        Self {
            tables: RwLock::new(Tables::default()),
            hooks,
        }
    }

    fn mint_id(prefix: &str) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("{}{}", prefix, &id[..12])
    }

    fn emit(&self, action: HookAction, change: RecordChange) {
        // send only fails when nobody subscribed, which is fine
        let _ = self.hooks.send(StoreEvent { action, change });
    }
}

#[async_trait]
impl Store for MemoryStore {
    // ── chats ───────────────────────────────────────────────────────────

    async fn chat(&self, id: &str) -> Result<Chat> {
        let tables = self.tables.read().await;
        tables
            .chats
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("chat {id}")))
    }

    async fn chat_by_session(&self, session_id: &str) -> Result<Option<Chat>> {
        if session_id.is_empty() {
            return Ok(None);
        }
        let tables = self.tables.read().await;
        Ok(tables
            .chats
            .iter()
            .find(|c| c.engine_session_id == session_id)
            .cloned())
    }

    async fn chats_with_active_session(&self, limit: usize) -> Result<Vec<Chat>> {
        let tables = self.tables.read().await;
        let mut chats: Vec<Chat> = tables
            .chats
            .iter()
            .filter(|c| !c.engine_session_id.is_empty() && c.turn == Turn::Assistant)
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        chats.truncate(limit);
        Ok(chats)
    }

    async fn create_chat(&self, mut chat: Chat) -> Result<Chat> {
        let mut tables = self.tables.write().await;
        if chat.id.is_empty() {
            chat.id = Self::mint_id("cht");
        }
        if chat.created.is_none() {
            chat.created = Some(Utc::now());
        }
        tables.chats.push(chat.clone());
        Ok(chat)
    }

    async fn save_chat(&self, chat: &Chat) -> Result<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .chats
            .iter_mut()
            .find(|c| c.id == chat.id)
            .ok_or_else(|| Error::NotFound(format!("chat {}", chat.id)))?;
        *slot = chat.clone();
        Ok(())
    }

    // ── messages ────────────────────────────────────────────────────────

    async fn message(&self, id: &str) -> Result<Message> {
        let tables = self.tables.read().await;
        tables
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("message {id}")))
    }

    async fn message_by_engine_id(&self, engine_message_id: &str) -> Result<Option<Message>> {
        if engine_message_id.is_empty() {
            return Ok(None);
        }
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .iter()
            .find(|m| m.engine_message_id == engine_message_id)
            .cloned())
    }

    async fn create_message(&self, mut message: Message) -> Result<Message> {
        {
            let mut tables = self.tables.write().await;
            if !tables.chats.iter().any(|c| c.id == message.chat_id) {
                return Err(Error::RelationNotFound(format!(
                    "message references chat {}",
                    message.chat_id
                )));
            }
            if !message.engine_message_id.is_empty()
                && tables
                    .messages
                    .iter()
                    .any(|m| m.engine_message_id == message.engine_message_id)
            {
                return Err(Error::Store(format!(
                    "duplicate engine message id {}",
                    message.engine_message_id
                )));
            }
            if message.id.is_empty() {
                message.id = Self::mint_id("msg");
            }
            if message.created.is_none() {
                message.created = Some(Utc::now());
            }
            tables.messages.push(message.clone());
        }
        self.emit(HookAction::Create, RecordChange::Message(message.clone()));
        Ok(message)
    }

    async fn save_message(&self, message: &Message) -> Result<()> {
        {
            let mut tables = self.tables.write().await;
            if !tables.chats.iter().any(|c| c.id == message.chat_id) {
                return Err(Error::RelationNotFound(format!(
                    "message references chat {}",
                    message.chat_id
                )));
            }
            let slot = tables
                .messages
                .iter_mut()
                .find(|m| m.id == message.id)
                .ok_or_else(|| Error::NotFound(format!("message {}", message.id)))?;
            *slot = message.clone();
        }
        self.emit(HookAction::Update, RecordChange::Message(message.clone()));
        Ok(())
    }

    async fn pending_user_messages(&self, limit: usize) -> Result<Vec<Message>> {
        let tables = self.tables.read().await;
        let mut pending: Vec<Message> = tables
            .messages
            .iter()
            .filter(|m| {
                m.role == Role::User
                    && matches!(
                        m.user_message_status,
                        UserMessageStatus::Pending | UserMessageStatus::Unset
                    )
            })
            .cloned()
            .collect();
        pending.truncate(limit);
        Ok(pending)
    }

    async fn latest_unmapped_user_message(&self, chat_id: &str) -> Result<Option<Message>> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .iter()
            .rev()
            .find(|m| {
                m.chat_id == chat_id && m.role == Role::User && m.engine_message_id.is_empty()
            })
            .cloned())
    }

    async fn processing_messages(&self) -> Result<Vec<Message>> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .iter()
            .filter(|m| m.engine_message_status == crate::store::types::EngineMessageStatus::Processing)
            .cloned()
            .collect())
    }

    // ── permissions ─────────────────────────────────────────────────────

    async fn create_permission(&self, mut permission: Permission) -> Result<Permission> {
        {
            let mut tables = self.tables.write().await;
            if permission.id.is_empty() {
                permission.id = Self::mint_id("prm");
            }
            if permission.created.is_none() {
                permission.created = Some(Utc::now());
            }
            tables.permissions.push(permission.clone());
        }
        self.emit(
            HookAction::Create,
            RecordChange::Permission(permission.clone()),
        );
        Ok(permission)
    }

    async fn save_permission(&self, permission: &Permission) -> Result<()> {
        {
            let mut tables = self.tables.write().await;
            let slot = tables
                .permissions
                .iter_mut()
                .find(|p| p.id == permission.id)
                .ok_or_else(|| Error::NotFound(format!("permission {}", permission.id)))?;
            *slot = permission.clone();
        }
        self.emit(
            HookAction::Update,
            RecordChange::Permission(permission.clone()),
        );
        Ok(())
    }

    async fn permission_by_request_id(
        &self,
        engine_request_id: &str,
    ) -> Result<Option<Permission>> {
        let tables = self.tables.read().await;
        Ok(tables
            .permissions
            .iter()
            .find(|p| p.engine_request_id == engine_request_id)
            .cloned())
    }

    async fn draft_permission_for_chat(&self, chat_id: &str) -> Result<Option<Permission>> {
        let tables = self.tables.read().await;
        Ok(tables
            .permissions
            .iter()
            .find(|p| p.chat_id == chat_id && p.status == PermissionStatus::Draft)
            .cloned())
    }

    // ── whitelists ──────────────────────────────────────────────────────

    async fn active_whitelist_actions(&self, permission: &str) -> Result<Vec<WhitelistAction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .whitelist_actions
            .iter()
            .filter(|a| a.active && a.permission == permission)
            .cloned()
            .collect())
    }

    async fn active_whitelist_targets(&self) -> Result<Vec<WhitelistTarget>> {
        let tables = self.tables.read().await;
        Ok(tables
            .whitelist_targets
            .iter()
            .filter(|t| t.active)
            .cloned()
            .collect())
    }

    async fn create_whitelist_action(&self, mut action: WhitelistAction) -> Result<WhitelistAction> {
        let mut tables = self.tables.write().await;
        if action.id.is_empty() {
            action.id = Self::mint_id("wla");
        }
        tables.whitelist_actions.push(action.clone());
        Ok(action)
    }

    async fn create_whitelist_target(&self, mut target: WhitelistTarget) -> Result<WhitelistTarget> {
        let mut tables = self.tables.write().await;
        if target.id.is_empty() {
            target.id = Self::mint_id("wlt");
        }
        tables.whitelist_targets.push(target.clone());
        Ok(target)
    }

    // ── subagents ───────────────────────────────────────────────────────

    async fn subagent_by_sid(&self, subagent_id: &str) -> Result<Option<Subagent>> {
        if subagent_id.is_empty() {
            return Ok(None);
        }
        let tables = self.tables.read().await;
        Ok(tables
            .subagents
            .iter()
            .find(|s| s.subagent_id == subagent_id)
            .cloned())
    }

    async fn create_subagent(&self, mut subagent: Subagent) -> Result<Subagent> {
        let mut tables = self.tables.write().await;
        if !tables.chats.iter().any(|c| c.id == subagent.chat_id) {
            return Err(Error::RelationNotFound(format!(
                "subagent references chat {}",
                subagent.chat_id
            )));
        }
        if subagent.id.is_empty() {
            subagent.id = Self::mint_id("sub");
        }
        tables.subagents.push(subagent.clone());
        Ok(subagent)
    }

    // ── ssh keys ────────────────────────────────────────────────────────

    async fn active_ssh_keys(&self) -> Result<Vec<SshKey>> {
        let tables = self.tables.read().await;
        Ok(tables
            .ssh_keys
            .iter()
            .filter(|k| k.is_active)
            .cloned()
            .collect())
    }

    async fn create_ssh_key(&self, mut key: SshKey) -> Result<SshKey> {
        {
            let mut tables = self.tables.write().await;
            if key.id.is_empty() {
                key.id = Self::mint_id("key");
            }
            tables.ssh_keys.push(key.clone());
        }
        self.emit(HookAction::Create, RecordChange::SshKey(key.clone()));
        Ok(key)
    }

    async fn save_ssh_key(&self, key: &SshKey) -> Result<()> {
        {
            let mut tables = self.tables.write().await;
            let slot = tables
                .ssh_keys
                .iter_mut()
                .find(|k| k.id == key.id)
                .ok_or_else(|| Error::NotFound(format!("ssh key {}", key.id)))?;
            *slot = key.clone();
        }
        self.emit(HookAction::Update, RecordChange::SshKey(key.clone()));
        Ok(())
    }

    // ── mcp servers ─────────────────────────────────────────────────────

    async fn approved_mcp_servers(&self) -> Result<Vec<McpServer>> {
        let tables = self.tables.read().await;
        Ok(tables
            .mcp_servers
            .iter()
            .filter(|s| s.status == McpStatus::Approved)
            .cloned()
            .collect())
    }

    async fn create_mcp_server(&self, mut server: McpServer) -> Result<McpServer> {
        {
            let mut tables = self.tables.write().await;
            if server.id.is_empty() {
                server.id = Self::mint_id("mcp");
            }
            tables.mcp_servers.push(server.clone());
        }
        self.emit(HookAction::Create, RecordChange::McpServer(server.clone()));
        Ok(server)
    }

    async fn save_mcp_server(&self, server: &McpServer) -> Result<()> {
        {
            let mut tables = self.tables.write().await;
            let slot = tables
                .mcp_servers
                .iter_mut()
                .find(|s| s.id == server.id)
                .ok_or_else(|| Error::NotFound(format!("mcp server {}", server.id)))?;
            *slot = server.clone();
        }
        self.emit(HookAction::Update, RecordChange::McpServer(server.clone()));
        Ok(())
    }

    // ── agent bundles ───────────────────────────────────────────────────

    async fn agent_profiles(&self) -> Result<Vec<AgentProfile>> {
        let tables = self.tables.read().await;
        Ok(tables.agents.clone())
    }

    async fn create_agent_profile(&self, mut agent: AgentProfile) -> Result<AgentProfile> {
        {
            let mut tables = self.tables.write().await;
            if agent.id.is_empty() {
                agent.id = Self::mint_id("agt");
            }
            tables.agents.push(agent.clone());
        }
        self.emit(HookAction::Create, RecordChange::Agent(agent.clone()));
        Ok(agent)
    }

    async fn save_agent_profile(&self, agent: &AgentProfile) -> Result<()> {
        {
            let mut tables = self.tables.write().await;
            let slot = tables
                .agents
                .iter_mut()
                .find(|a| a.id == agent.id)
                .ok_or_else(|| Error::NotFound(format!("agent {}", agent.id)))?;
            *slot = agent.clone();
        }
        self.emit(HookAction::Update, RecordChange::Agent(agent.clone()));
        Ok(())
    }

    async fn prompt_template(&self, id: &str) -> Result<Option<PromptTemplate>> {
        let tables = self.tables.read().await;
        Ok(tables.prompts.iter().find(|p| p.id == id).cloned())
    }

    async fn create_prompt_template(&self, mut prompt: PromptTemplate) -> Result<PromptTemplate> {
        {
            let mut tables = self.tables.write().await;
            if prompt.id.is_empty() {
                prompt.id = Self::mint_id("prt");
            }
            tables.prompts.push(prompt.clone());
        }
        self.emit(HookAction::Create, RecordChange::Prompt(prompt.clone()));
        Ok(prompt)
    }

    async fn model_profile(&self, id: &str) -> Result<Option<ModelProfile>> {
        let tables = self.tables.read().await;
        Ok(tables.models.iter().find(|m| m.id == id).cloned())
    }

    async fn create_model_profile(&self, mut model: ModelProfile) -> Result<ModelProfile> {
        {
            let mut tables = self.tables.write().await;
            if model.id.is_empty() {
                model.id = Self::mint_id("mdl");
            }
            tables.models.push(model.clone());
        }
        self.emit(HookAction::Create, RecordChange::Model(model.clone()));
        Ok(model)
    }

    async fn permission_rules_for_agent(&self, agent_id: &str) -> Result<Vec<PermissionRuleRow>> {
        let tables = self.tables.read().await;
        Ok(tables
            .permission_rules
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn create_permission_rule(
        &self,
        mut rule: PermissionRuleRow,
    ) -> Result<PermissionRuleRow> {
        {
            let mut tables = self.tables.write().await;
            if rule.id.is_empty() {
                rule.id = Self::mint_id("rul");
            }
            tables.permission_rules.push(rule.clone());
        }
        self.emit(
            HookAction::Create,
            RecordChange::PermissionRule(rule.clone()),
        );
        Ok(rule)
    }

    // ── proposals and sops ──────────────────────────────────────────────

    async fn proposals(&self) -> Result<Vec<Proposal>> {
        let tables = self.tables.read().await;
        Ok(tables.proposals.clone())
    }

    async fn create_proposal(&self, mut proposal: Proposal) -> Result<Proposal> {
        {
            let mut tables = self.tables.write().await;
            if proposal.id.is_empty() {
                proposal.id = Self::mint_id("prp");
            }
            tables.proposals.push(proposal.clone());
        }
        self.emit(HookAction::Create, RecordChange::Proposal(proposal.clone()));
        Ok(proposal)
    }

    async fn save_proposal(&self, proposal: &Proposal) -> Result<()> {
        {
            let mut tables = self.tables.write().await;
            let slot = tables
                .proposals
                .iter_mut()
                .find(|p| p.id == proposal.id)
                .ok_or_else(|| Error::NotFound(format!("proposal {}", proposal.id)))?;
            *slot = proposal.clone();
        }
        self.emit(HookAction::Update, RecordChange::Proposal(proposal.clone()));
        Ok(())
    }

    async fn sops(&self) -> Result<Vec<Sop>> {
        let tables = self.tables.read().await;
        Ok(tables.sops.clone())
    }

    async fn upsert_sop(&self, name: &str, content: &str, signature: &str) -> Result<Sop> {
        let (sop, action) = {
            let mut tables = self.tables.write().await;
            if let Some(slot) = tables.sops.iter_mut().find(|s| s.name == name) {
                slot.content = content.to_string();
                slot.signature = signature.to_string();
                (slot.clone(), HookAction::Update)
            } else {
                let sop = Sop {
                    id: Self::mint_id("sop"),
                    name: name.to_string(),
                    content: content.to_string(),
                    signature: signature.to_string(),
                };
                tables.sops.push(sop.clone());
                (sop, HookAction::Create)
            }
        };
        self.emit(action, RecordChange::Sop(sop.clone()));
        Ok(sop)
    }

    // ── healthchecks ────────────────────────────────────────────────────

    async fn healthcheck(&self, name: &str) -> Result<Option<Healthcheck>> {
        let tables = self.tables.read().await;
        Ok(tables.healthchecks.iter().find(|h| h.name == name).cloned())
    }

    async fn upsert_healthcheck(&self, name: &str, status: HealthStatus) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(slot) = tables.healthchecks.iter_mut().find(|h| h.name == name) {
            slot.status = status;
            slot.last_ping = Some(Utc::now());
        } else {
            tables.healthchecks.push(Healthcheck {
                id: Self::mint_id("hlt"),
                name: name.to_string(),
                status,
                last_ping: Some(Utc::now()),
            });
        }
        Ok(())
    }

    // ── hooks ───────────────────────────────────────────────────────────

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.hooks.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::EngineMessageStatus;

    #[tokio::test]
    async fn test_message_requires_chat() {
        let store = MemoryStore::new();
        let result = store
            .create_message(Message {
                chat_id: "missing".to_string(),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(Error::RelationNotFound(_))));
    }

    #[tokio::test]
    async fn test_create_and_find_by_engine_id() {
        let store = MemoryStore::new();
        let chat = store.create_chat(Chat::default()).await.unwrap();
        let created = store
            .create_message(Message {
                chat_id: chat.id.clone(),
                role: Role::Assistant,
                engine_message_id: "msg_A".to_string(),
                engine_message_status: EngineMessageStatus::Processing,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!created.id.is_empty());

        let found = store.message_by_engine_id("msg_A").await.unwrap().unwrap();
        assert_eq!(found.id, created.id);

        let dup = store
            .create_message(Message {
                chat_id: chat.id,
                engine_message_id: "msg_A".to_string(),
                ..Default::default()
            })
            .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn test_hook_events_fire_after_commit() {
        let store = MemoryStore::new();
        let mut events = store.subscribe();
        let chat = store.create_chat(Chat::default()).await.unwrap();
        store
            .create_message(Message {
                chat_id: chat.id,
                role: Role::User,
                user_message_status: UserMessageStatus::Pending,
                ..Default::default()
            })
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.action, HookAction::Create);
        match event.change {
            RecordChange::Message(m) => {
                assert_eq!(m.role, Role::User);
                // the row is visible to readers by the time the hook fires
                assert!(store.message(&m.id).await.is_ok());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_latest_unmapped_user_message_prefers_newest() {
        let store = MemoryStore::new();
        let chat = store.create_chat(Chat::default()).await.unwrap();
        for n in 0..3 {
            store
                .create_message(Message {
                    chat_id: chat.id.clone(),
                    role: Role::User,
                    parts: vec![crate::store::types::Part::text(format!("p{n}"), "hi")],
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let latest = store
            .latest_unmapped_user_message(&chat.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.parts[0].id, "p2");
    }

    #[tokio::test]
    async fn test_upsert_sop_by_name() {
        let store = MemoryStore::new();
        let first = store.upsert_sop("deploy", "v1", "sig1").await.unwrap();
        let second = store.upsert_sop("deploy", "v2", "sig2").await.unwrap();
        assert_eq!(first.id, second.id);
        let sops = store.sops().await.unwrap();
        assert_eq!(sops.len(), 1);
        assert_eq!(sops[0].content, "v2");
    }

    #[tokio::test]
    async fn test_upsert_healthcheck() {
        let store = MemoryStore::new();
        store
            .upsert_healthcheck("opencode", HealthStatus::Ready)
            .await
            .unwrap();
        store
            .upsert_healthcheck("opencode", HealthStatus::Offline)
            .await
            .unwrap();
        let row = store.healthcheck("opencode").await.unwrap().unwrap();
        assert_eq!(row.status, HealthStatus::Offline);
    }
}
