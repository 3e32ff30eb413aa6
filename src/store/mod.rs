//! Record-store port.
//!
//! The persistent store (chats, messages, permissions, keys, servers,
//! proposals) is an external collaborator. The relay talks to it through the
//! narrow [`Store`] trait: typed finders and writers per collection, plus a
//! broadcast subscription that surfaces row changes as [`StoreEvent`]s for
//! the hook router. Everything access-rule- or migration-related belongs to
//! the collaborator, not to this crate.
//!
//! [`MemoryStore`] is the bundled implementation backing embedded
//! deployments and every test.

pub mod memory;
pub mod types;

pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use types::{
    AgentProfile, Chat, Healthcheck, HealthStatus, McpServer, Message, ModelProfile, Permission,
    PermissionRuleRow, PromptTemplate, Proposal, Sop, SshKey, Subagent, WhitelistAction,
    WhitelistTarget,
};

/// What happened to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Create,
    Update,
    Delete,
}

/// The row a [`StoreEvent`] refers to, typed by collection. Collections the
/// relay never reacts to (whitelists, subagents, healthchecks) do not emit
/// events.
#[derive(Debug, Clone)]
pub enum RecordChange {
    Message(Message),
    Permission(Permission),
    McpServer(McpServer),
    SshKey(SshKey),
    Agent(AgentProfile),
    Prompt(PromptTemplate),
    Model(ModelProfile),
    PermissionRule(PermissionRuleRow),
    Proposal(Proposal),
    Sop(Sop),
}

/// A row change delivered to hook subscribers after the write committed.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub action: HookAction,
    pub change: RecordChange,
}

/// Typed access to the record store.
///
/// Writers fire a [`StoreEvent`] to subscribers after the row is committed,
/// mirroring the store's after-success hook semantics.
#[async_trait]
pub trait Store: Send + Sync {
    // ── chats ───────────────────────────────────────────────────────────

    async fn chat(&self, id: &str) -> Result<Chat>;
    async fn chat_by_session(&self, session_id: &str) -> Result<Option<Chat>>;
    /// Chats with a provisioned session and the assistant holding the turn,
    /// most recently active first.
    async fn chats_with_active_session(&self, limit: usize) -> Result<Vec<Chat>>;
    async fn create_chat(&self, chat: Chat) -> Result<Chat>;
    async fn save_chat(&self, chat: &Chat) -> Result<()>;

    // ── messages ────────────────────────────────────────────────────────

    async fn message(&self, id: &str) -> Result<Message>;
    async fn message_by_engine_id(&self, engine_message_id: &str) -> Result<Option<Message>>;
    async fn create_message(&self, message: Message) -> Result<Message>;
    async fn save_message(&self, message: &Message) -> Result<()>;
    /// User messages never handed to the engine, oldest first.
    async fn pending_user_messages(&self, limit: usize) -> Result<Vec<Message>>;
    /// Newest user message in a chat that has no engine message id yet.
    async fn latest_unmapped_user_message(&self, chat_id: &str) -> Result<Option<Message>>;
    /// Assistant messages still streaming.
    async fn processing_messages(&self) -> Result<Vec<Message>>;

    // ── permissions ─────────────────────────────────────────────────────

    async fn create_permission(&self, permission: Permission) -> Result<Permission>;
    async fn save_permission(&self, permission: &Permission) -> Result<()>;
    async fn permission_by_request_id(&self, engine_request_id: &str)
        -> Result<Option<Permission>>;
    /// Any permission for the chat still awaiting a human decision.
    async fn draft_permission_for_chat(&self, chat_id: &str) -> Result<Option<Permission>>;

    // ── whitelists ──────────────────────────────────────────────────────

    async fn active_whitelist_actions(&self, permission: &str) -> Result<Vec<WhitelistAction>>;
    async fn active_whitelist_targets(&self) -> Result<Vec<WhitelistTarget>>;
    async fn create_whitelist_action(&self, action: WhitelistAction) -> Result<WhitelistAction>;
    async fn create_whitelist_target(&self, target: WhitelistTarget) -> Result<WhitelistTarget>;

    // ── subagents ───────────────────────────────────────────────────────

    async fn subagent_by_sid(&self, subagent_id: &str) -> Result<Option<Subagent>>;
    async fn create_subagent(&self, subagent: Subagent) -> Result<Subagent>;

    // ── ssh keys ────────────────────────────────────────────────────────

    async fn active_ssh_keys(&self) -> Result<Vec<SshKey>>;
    async fn create_ssh_key(&self, key: SshKey) -> Result<SshKey>;
    async fn save_ssh_key(&self, key: &SshKey) -> Result<()>;

    // ── mcp servers ─────────────────────────────────────────────────────

    async fn approved_mcp_servers(&self) -> Result<Vec<McpServer>>;
    async fn create_mcp_server(&self, server: McpServer) -> Result<McpServer>;
    async fn save_mcp_server(&self, server: &McpServer) -> Result<()>;

    // ── agent bundles ───────────────────────────────────────────────────

    async fn agent_profiles(&self) -> Result<Vec<AgentProfile>>;
    async fn create_agent_profile(&self, agent: AgentProfile) -> Result<AgentProfile>;
    async fn save_agent_profile(&self, agent: &AgentProfile) -> Result<()>;
    async fn prompt_template(&self, id: &str) -> Result<Option<PromptTemplate>>;
    async fn create_prompt_template(&self, prompt: PromptTemplate) -> Result<PromptTemplate>;
    async fn model_profile(&self, id: &str) -> Result<Option<ModelProfile>>;
    async fn create_model_profile(&self, model: ModelProfile) -> Result<ModelProfile>;
    async fn permission_rules_for_agent(&self, agent_id: &str) -> Result<Vec<PermissionRuleRow>>;
    async fn create_permission_rule(&self, rule: PermissionRuleRow) -> Result<PermissionRuleRow>;

    // ── proposals and sops ──────────────────────────────────────────────

    async fn proposals(&self) -> Result<Vec<Proposal>>;
    async fn create_proposal(&self, proposal: Proposal) -> Result<Proposal>;
    async fn save_proposal(&self, proposal: &Proposal) -> Result<()>;
    async fn sops(&self) -> Result<Vec<Sop>>;
    async fn upsert_sop(&self, name: &str, content: &str, signature: &str) -> Result<Sop>;

    // ── healthchecks ────────────────────────────────────────────────────

    async fn healthcheck(&self, name: &str) -> Result<Option<Healthcheck>>;
    async fn upsert_healthcheck(&self, name: &str, status: HealthStatus) -> Result<()>;

    // ── hooks ───────────────────────────────────────────────────────────

    /// Subscribe to row-change events. Each subscriber gets every event;
    /// slow subscribers may observe `Lagged` and should resynchronize from
    /// the store itself.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}
