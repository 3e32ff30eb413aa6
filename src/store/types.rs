//! Typed rows for every collection the relay touches.
//!
//! The record store itself is a collaborator behind the [`Store`](super::Store)
//! port; these are the shapes the relay reads and writes. JSON field names
//! follow the store's wire format (snake_case columns, camelCase for the
//! engine-originated part payloads).

use crate::relay::envelope::ErrorEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Chats
// =============================================================================

/// Whose turn it is in a chat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Turn {
    #[default]
    User,
    Assistant,
}

/// A user↔assistant conversation, mapping 1:1 to an engine session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Chat {
    pub id: String,

    /// Engine session id, cached on the row once provisioned. Empty until
    /// the first user message forces a session, cleared again if the engine
    /// reports the session gone (and it is not a known subagent session).
    pub engine_session_id: String,

    /// Which engine provisioned the session (`opencode`)
    pub engine_type: String,

    pub turn: Turn,

    /// Owning user id
    pub user_id: String,

    /// Short preview of the latest assistant output (high-water-mark)
    pub preview: String,

    pub title: String,

    pub last_active: Option<DateTime<Utc>>,

    pub created: Option<DateTime<Utc>>,
}

// =============================================================================
// Messages and parts
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Assistant,
    System,
}

/// Delivery state of a user message on its way to the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserMessageStatus {
    #[default]
    #[serde(rename = "")]
    Unset,
    Pending,
    Sending,
    Delivered,
    Failed,
}

/// Engine-side lifecycle of an assistant message.
///
/// Monotonic: once `Completed` or `Failed` the status never returns to
/// `Processing`. Enforcement happens under the per-message mutex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMessageStatus {
    #[default]
    #[serde(rename = "")]
    Unset,
    Processing,
    Completed,
    Failed,
}

impl EngineMessageStatus {
    /// True once the status may no longer change.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A single message row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    pub id: String,

    pub chat_id: String,

    pub role: Role,

    /// Join key for engine SSE events. Set at most once per row; unique
    /// across rows when non-empty.
    pub engine_message_id: String,

    pub user_message_status: UserMessageStatus,

    pub engine_message_status: EngineMessageStatus,

    pub parts: Vec<Part>,

    pub parent_id: String,

    pub tokens: Option<Value>,

    pub cost: Option<f64>,

    pub error: Option<Value>,

    pub finish_reason: String,

    pub created: Option<DateTime<Utc>>,

    pub updated: Option<DateTime<Utc>>,
}

/// Kind discriminator of a message part. Unknown kinds produced by newer
/// engine versions round-trip through `Other`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartKind {
    #[default]
    Text,
    Tool,
    StepStart,
    Error,
    #[serde(untagged)]
    Other(String),
}

/// A typed fragment of a message.
///
/// Parts arrive from the engine as `message.part.updated` payloads and are
/// stored verbatim inside the message row's `parts` array, ordered
/// lexicographically by `id`. Fields the relay does not model are preserved
/// in `extra` so nothing the engine sends is dropped on the floor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type", default)]
    pub kind: PartKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ToolState>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,

    #[serde(rename = "messageID", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    #[serde(rename = "sessionID", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(rename = "parentID", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Part {
    /// A plain text part.
    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: PartKind::Text,
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// The trailing part appended to a message that failed, carrying the
    /// error envelope for the UI.
    pub fn from_envelope(envelope: ErrorEnvelope) -> Self {
        Self {
            id: format!("err_{}", uuid::Uuid::new_v4().simple()),
            kind: PartKind::Error,
            source: Some(envelope.source().to_string()),
            error: Some(envelope),
            ..Default::default()
        }
    }
}

/// Execution state embedded in a `tool` part.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// =============================================================================
// Permissions and whitelists
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    #[default]
    Draft,
    Authorized,
    Denied,
}

/// An engine-issued request to run a privileged operation, gated by the
/// whitelist evaluator and (when not auto-authorized) by a human.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Permission {
    pub id: String,

    /// Opaque request id minted by the engine; the reply round-trip is
    /// addressed with it.
    pub engine_request_id: String,

    pub session_id: String,

    pub chat_id: String,

    /// The verb being requested (`bash`, `edit`, `read`, ...)
    pub permission: String,

    /// Noun patterns the verb applies to (file paths, globs)
    pub patterns: Vec<String>,

    /// Free-form request metadata; for `bash` carries `command`
    pub metadata: Map<String, Value>,

    pub status: PermissionStatus,

    /// Human-readable description supplied by the engine
    pub message: String,

    /// Component that created the row
    pub source: String,

    pub message_id: String,

    pub call_id: String,

    /// Random uuid reserved for cryptographic confirmation
    pub challenge: String,

    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhitelistKind {
    #[default]
    Pattern,
    Strict,
}

/// A verb rule. `pattern` rules glob-match, `strict` rules require exact
/// command equality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WhitelistAction {
    pub id: String,
    pub permission: String,
    pub kind: WhitelistKind,
    pub value: String,
    pub active: bool,
}

/// A noun rule: a glob every requested path must satisfy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WhitelistTarget {
    pub id: String,
    pub pattern: String,
    pub active: bool,
}

// =============================================================================
// MCP servers
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpStatus {
    #[default]
    Pending,
    Approved,
    Denied,
    Revoked,
}

/// An MCP server requested by the assistant and vetted by a human.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServer {
    pub id: String,
    pub name: String,
    pub status: McpStatus,
    pub image: String,
    pub config: Map<String, Value>,
    pub requested_by: String,
    pub approved_by: String,
    pub approved_at: Option<DateTime<Utc>>,
    pub reason: String,
    pub catalog: String,
}

// =============================================================================
// Subagents
// =============================================================================

/// Lineage record for a secondary engine session spawned by a handoff tool.
/// Once present, the subagent's session id resolves to the parent's chat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Subagent {
    pub id: String,
    pub subagent_id: String,
    pub delegating_agent_id: String,
    pub tmux_window_id: i64,
    pub chat_id: String,
}

// =============================================================================
// SSH keys
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SshKey {
    pub id: String,
    pub user: String,
    pub public_key: String,
    pub fingerprint: String,
    pub is_active: bool,
    pub last_used: Option<DateTime<Utc>>,
}

// =============================================================================
// Agent bundles
// =============================================================================

/// An agent profile; the bundler joins it with its prompt, model, and
/// permission rules into a deployable markdown bundle cached on `config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub description: String,
    pub mode: String,
    /// Initial agents deploy into the engine's own agents directory
    pub is_init: bool,
    pub steps: Vec<String>,
    pub prompt_id: String,
    pub model_id: String,
    /// Cached rendered bundle
    pub config: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplate {
    pub id: String,
    pub name: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelProfile {
    pub id: String,
    pub name: String,
    pub identifier: String,
}

/// One `pattern → action` entry in an agent's permission map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionRuleRow {
    pub id: String,
    pub agent_id: String,
    pub pattern: String,
    pub action: String,
}

// =============================================================================
// Proposals and SOPs
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthoredBy {
    #[default]
    Human,
    Poco,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    #[default]
    Draft,
    Approved,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Proposal {
    pub id: String,
    pub name: String,
    pub description: String,
    pub content: String,
    pub authored_by: AuthoredBy,
    pub status: ProposalStatus,
}

/// A sealed standard operating procedure. `signature` is the SHA-256 of the
/// approved proposal content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Sop {
    pub id: String,
    pub name: String,
    pub content: String,
    pub signature: String,
}

// =============================================================================
// Healthchecks
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Starting,
    Ready,
    Degraded,
    Offline,
    Error,
}

/// One row per monitored component; the health watchdog is its only writer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Healthcheck {
    pub id: String,
    pub name: String,
    pub status: HealthStatus,
    pub last_ping: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&PartKind::StepStart).unwrap(),
            "\"step-start\""
        );
        let parsed: PartKind = serde_json::from_str("\"tool\"").unwrap();
        assert_eq!(parsed, PartKind::Tool);
    }

    #[test]
    fn test_part_kind_unknown_roundtrip() {
        let parsed: PartKind = serde_json::from_str("\"reasoning\"").unwrap();
        assert_eq!(parsed, PartKind::Other("reasoning".to_string()));
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"reasoning\"");
    }

    #[test]
    fn test_part_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "id": "prt_1",
            "type": "text",
            "text": "hello",
            "synthetic": true,
            "time": {"start": 12}
        });
        let part: Part = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(part.extra.get("synthetic"), Some(&serde_json::json!(true)));
        let back = serde_json::to_value(&part).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_engine_message_status_finality() {
        assert!(!EngineMessageStatus::Processing.is_final());
        assert!(!EngineMessageStatus::Unset.is_final());
        assert!(EngineMessageStatus::Completed.is_final());
        assert!(EngineMessageStatus::Failed.is_final());
    }

    #[test]
    fn test_user_message_status_empty_string() {
        let parsed: UserMessageStatus = serde_json::from_str("\"\"").unwrap();
        assert_eq!(parsed, UserMessageStatus::Unset);
        let parsed: UserMessageStatus = serde_json::from_str("\"pending\"").unwrap();
        assert_eq!(parsed, UserMessageStatus::Pending);
    }
}
