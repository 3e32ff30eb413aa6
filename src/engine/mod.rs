//! HTTP client for the engine (OpenCode).
//!
//! Covers the four REST calls the relay makes plus the long-lived event
//! stream. POSTs use a 10 s timeout, liveness GETs 5 s; the stream client
//! carries no overall timeout (it lives for hours) but bounds the initial
//! connect.

pub mod events;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::store::types::Part;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Result of probing a cached session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProbe {
    /// Engine confirmed the session exists.
    Alive,
    /// Engine returned 404; the session is gone.
    Missing,
    /// Network-level failure; liveness is unknown, keep the id optimistically.
    Unknown,
}

/// How to answer a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionReply {
    Once,
    Reject,
}

#[derive(Debug, Deserialize)]
struct CreatedSession {
    #[serde(default)]
    id: String,
}

/// Engine REST client.
pub struct EngineClient {
    config: EngineConfig,
    post_client: reqwest::Client,
    get_client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl EngineClient {
    pub fn new(config: EngineConfig) -> Self {
        let post_client = reqwest::Client::builder()
            .timeout(config.post_timeout())
            .build()
            .unwrap_or_default();
        let get_client = reqwest::Client::builder()
            .timeout(config.get_timeout())
            .build()
            .unwrap_or_default();
        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            config,
            post_client,
            get_client,
            stream_client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.config.url
    }

    /// Open the long-lived `GET /event` firehose.
    pub async fn open_event_stream(&self) -> Result<reqwest::Response> {
        let url = format!("{}/event", self.config.url);
        let response = self.stream_client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Engine(format!(
                "event stream rejected: {}",
                response.status()
            )));
        }
        Ok(response)
    }

    /// `POST /session` — create a session for the configured workspace and
    /// agent, returning the minted session id.
    pub async fn create_session(&self) -> Result<String> {
        let url = format!("{}/session", self.config.url);
        let body = json!({
            "directory": self.config.session_directory,
            "agent": self.config.session_agent,
        });
        let response = self.post_client.post(&url).json(&body).send().await?;
        if response.status().as_u16() >= 400 {
            return Err(Error::Engine(format!(
                "session creation rejected: {}",
                response.status()
            )));
        }
        let created: CreatedSession = response.json().await?;
        if created.id.is_empty() {
            return Err(Error::Engine("session response missing id".to_string()));
        }
        Ok(created.id)
    }

    /// `GET /session/<sid>` liveness probe.
    pub async fn probe_session(&self, session_id: &str) -> SessionProbe {
        let url = format!("{}/session/{}", self.config.url, session_id);
        match self.get_client.get(&url).send().await {
            Ok(response) if response.status() == StatusCode::OK => SessionProbe::Alive,
            Ok(response) if response.status() == StatusCode::NOT_FOUND => SessionProbe::Missing,
            Ok(_) => SessionProbe::Unknown,
            Err(_) => SessionProbe::Unknown,
        }
    }

    /// `POST /session/<sid>/prompt_async` — fire-and-forget prompt; the SSE
    /// listener picks up the response stream.
    pub async fn prompt_async(&self, session_id: &str, parts: &[Part]) -> Result<()> {
        let url = format!("{}/session/{}/prompt_async", self.config.url, session_id);
        let response = self
            .post_client
            .post(&url)
            .json(&json!({ "parts": parts }))
            .send()
            .await?;
        if response.status().as_u16() >= 400 {
            return Err(Error::Engine(format!(
                "prompt rejected: {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// `POST /permission/<pid>/reply`.
    pub async fn permission_reply(&self, request_id: &str, reply: PermissionReply) -> Result<()> {
        let url = format!("{}/permission/{}/reply", self.config.url, request_id);
        let body = match reply {
            PermissionReply::Once => json!({ "reply": "once" }),
            PermissionReply::Reject => json!({
                "reply": "reject",
                "message": "User denied permission.",
            }),
        };
        let response = self.post_client.post(&url).json(&body).send().await?;
        if response.status().as_u16() >= 400 {
            return Err(Error::Engine(format!(
                "permission reply rejected: {}",
                response.status()
            )));
        }
        Ok(())
    }
}
