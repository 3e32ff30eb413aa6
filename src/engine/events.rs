//! Typed payloads for the engine's SSE firehose.
//!
//! Every frame is `{"type": "...", "properties": {...}}`. The ingest loop
//! decodes the outer frame, then deserializes `properties` into the typed
//! payload for the event kind it dispatches. Unknown kinds are ignored so a
//! newer engine never wedges the stream.

use crate::store::types::Part;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Outer SSE frame.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: Value,
}

impl EngineEvent {
    /// Deserialize `properties` into the payload type for this event.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_value(self.properties.clone())?)
    }
}

/// `permission.asked`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PermissionAskedPayload {
    pub id: String,
    pub permission: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub patterns: Vec<String>,
    pub metadata: Map<String, Value>,
    pub message: String,
    pub tool: Option<ToolRef>,
}

/// Tool context nested inside a permission request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolRef {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "callID")]
    pub call_id: String,
}

/// `message.part.updated`
#[derive(Debug, Clone, Deserialize)]
pub struct PartUpdatedPayload {
    pub part: Part,
}

/// `message.part.delta`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PartDeltaPayload {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "partID")]
    pub part_id: String,
    pub delta: String,
    #[serde(rename = "sessionID")]
    pub session_id: Option<String>,
}

/// `message.updated`
#[derive(Debug, Clone, Deserialize)]
pub struct MessageUpdatedPayload {
    pub info: MessageInfo,
}

/// Message-level metadata carried by `message.updated`. Contains no parts;
/// those arrive exclusively through part events.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageInfo {
    pub id: String,
    pub role: Option<String>,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "parentID")]
    pub parent_id: Option<String>,
    pub time: Option<MessageTime>,
    pub cost: Option<f64>,
    pub tokens: Option<Value>,
    pub error: Option<Map<String, Value>>,
    pub finish: Option<String>,
}

impl MessageInfo {
    pub fn is_completed(&self) -> bool {
        self.time
            .as_ref()
            .and_then(|t| t.completed.as_ref())
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageTime {
    pub completed: Option<Value>,
}

/// `message.error` / `session.error` / `session.idle` / `session.updated`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionPayload {
    pub id: Option<String>,
    #[serde(rename = "sessionID")]
    pub session_id: Option<String>,
    pub status: Option<String>,
    pub error: Option<Map<String, Value>>,
}

impl SessionPayload {
    /// The session id, whichever field it arrived under.
    pub fn sid(&self) -> &str {
        self.id
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.session_id.as_deref())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_and_payload_decode() {
        let frame: EngineEvent = serde_json::from_str(
            r#"{"type":"message.part.delta","properties":{"messageID":"m1","partID":"p1","delta":"he"}}"#,
        )
        .unwrap();
        assert_eq!(frame.kind, "message.part.delta");
        let payload: PartDeltaPayload = frame.payload().unwrap();
        assert_eq!(payload.message_id, "m1");
        assert_eq!(payload.delta, "he");
    }

    #[test]
    fn test_message_info_completion() {
        let info: MessageInfo =
            serde_json::from_str(r#"{"id":"m1","time":{"completed":1712345678}}"#).unwrap();
        assert!(info.is_completed());

        let info: MessageInfo = serde_json::from_str(r#"{"id":"m1","time":{}}"#).unwrap();
        assert!(!info.is_completed());

        let info: MessageInfo = serde_json::from_str(r#"{"id":"m1"}"#).unwrap();
        assert!(!info.is_completed());
    }

    #[test]
    fn test_session_payload_sid_fallback() {
        let payload: SessionPayload = serde_json::from_str(r#"{"sessionID":"ses_1"}"#).unwrap();
        assert_eq!(payload.sid(), "ses_1");

        let payload: SessionPayload =
            serde_json::from_str(r#"{"id":"ses_2","sessionID":"ignored"}"#).unwrap();
        assert_eq!(payload.sid(), "ses_2");

        let payload: SessionPayload = serde_json::from_str("{}").unwrap();
        assert_eq!(payload.sid(), "");
    }

    #[test]
    fn test_permission_payload_with_tool_ref() {
        let payload: PermissionAskedPayload = serde_json::from_str(
            r#"{"id":"perm1","permission":"bash","sessionID":"ses_1",
                "patterns":["/workspace/a.go"],
                "metadata":{"command":"git status"},
                "message":"Run git status",
                "tool":{"messageID":"m1","callID":"c1"}}"#,
        )
        .unwrap();
        assert_eq!(payload.permission, "bash");
        assert_eq!(payload.tool.as_ref().unwrap().call_id, "c1");
        assert_eq!(
            payload.metadata.get("command").and_then(|v| v.as_str()),
            Some("git status")
        );
    }
}
