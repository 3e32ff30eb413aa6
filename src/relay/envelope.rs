//! Error envelope model.
//!
//! Failures surfaced to the UI come in exactly two shapes, discriminated by
//! `source` on the wire:
//!
//! - `relay` — an infrastructure failure in the relay's own plumbing
//!   (connection loss, heartbeat silence, stream teardown). Carries a
//!   machine code plus its canonical human message.
//! - `opencode` — whatever the engine reported about a provider/LLM
//!   failure, passed through with its original `name`, `message`, optional
//!   stringified `responseBody`, and `isRetryable` flag.
//!
//! Both variants round-trip losslessly through JSON; `validate` enforces
//! the required fields after deserialization from untrusted input.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Machine codes for infrastructure failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfraCode {
    ConnectionFailed,
    NetworkTimeout,
    ContainerUnreachable,
    HeartbeatTimeout,
    DockerNetworkTimeout,
    StreamClosed,
    InternalError,
}

impl InfraCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "connection_failed",
            Self::NetworkTimeout => "network_timeout",
            Self::ContainerUnreachable => "container_unreachable",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::DockerNetworkTimeout => "docker_network_timeout",
            Self::StreamClosed => "stream_closed",
            Self::InternalError => "internal_error",
        }
    }

    /// Canonical human-readable message for a code string. Unknown codes get
    /// a generic message rather than an error.
    pub fn message_for(code: &str) -> &'static str {
        match code {
            "connection_failed" => "Failed to connect to OpenCode container",
            "network_timeout" => "Network request to OpenCode timed out",
            "container_unreachable" => "OpenCode container is unreachable",
            "heartbeat_timeout" => "No heartbeat received from OpenCode for 45+ seconds",
            "docker_network_timeout" => "Docker network connection failed",
            "stream_closed" => "SSE stream from OpenCode closed unexpectedly",
            "internal_error" => "Internal relay error occurred",
            _ => "Unknown infrastructure error",
        }
    }
}

/// Detail payload of an infrastructure envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureDetail {
    pub code: String,
    pub message: String,
}

/// Detail payload of a provider envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDetail {
    pub name: String,
    pub message: String,
    /// Always a string on the wire; structured bodies are JSON-encoded
    /// first so the engine's own schema survives storage round-trips.
    #[serde(rename = "responseBody", skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(rename = "isRetryable", skip_serializing_if = "Option::is_none")]
    pub is_retryable: Option<bool>,
}

/// Tagged union of the two failure shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source")]
pub enum ErrorEnvelope {
    #[serde(rename = "relay")]
    Infrastructure { error: InfrastructureDetail },
    #[serde(rename = "opencode")]
    Provider { error: ProviderDetail },
}

impl ErrorEnvelope {
    /// Build an infrastructure envelope with its canonical message.
    pub fn infrastructure(code: InfraCode) -> Self {
        Self::Infrastructure {
            error: InfrastructureDetail {
                code: code.as_str().to_string(),
                message: InfraCode::message_for(code.as_str()).to_string(),
            },
        }
    }

    /// Build an infrastructure envelope from a raw code string (used when
    /// codes travel through config or the wire).
    pub fn infrastructure_from_code(code: &str) -> Self {
        Self::Infrastructure {
            error: InfrastructureDetail {
                code: code.to_string(),
                message: InfraCode::message_for(code).to_string(),
            },
        }
    }

    /// Wrap an engine-reported error object into a provider envelope.
    ///
    /// `responseBody` is normalized to a string: the engine sometimes sends
    /// it structured, and downstream consumers expect the stringified form.
    pub fn provider(error: &Map<String, Value>) -> Self {
        let name = error
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let response_body = error.get("responseBody").and_then(|body| match body {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => serde_json::to_string(other).ok(),
        });
        let is_retryable = error.get("isRetryable").and_then(Value::as_bool);

        Self::Provider {
            error: ProviderDetail {
                name,
                message,
                response_body,
                is_retryable,
            },
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            Self::Infrastructure { .. } => "relay",
            Self::Provider { .. } => "opencode",
        }
    }

    /// The infrastructure code, when this is an infrastructure envelope.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Infrastructure { error } => Some(&error.code),
            Self::Provider { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Infrastructure { error } => &error.message,
            Self::Provider { error } => &error.message,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Infrastructure { .. } => false,
            Self::Provider { error } => error.is_retryable.unwrap_or(false),
        }
    }

    /// Enforce required fields. Deserialization alone accepts empty strings;
    /// callers handling untrusted envelopes validate before acting on them.
    pub fn validate(&self) -> crate::Result<()> {
        match self {
            Self::Infrastructure { error } => {
                if error.code.is_empty() {
                    return Err(crate::Error::Internal(
                        "infrastructure envelope missing error.code".to_string(),
                    ));
                }
                if error.message.is_empty() {
                    return Err(crate::Error::Internal(
                        "infrastructure envelope missing error.message".to_string(),
                    ));
                }
                Ok(())
            }
            Self::Provider { error } => {
                if error.name.is_empty() {
                    return Err(crate::Error::Internal(
                        "provider envelope missing error.name".to_string(),
                    ));
                }
                if error.message.is_empty() {
                    return Err(crate::Error::Internal(
                        "provider envelope missing error.message".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}
