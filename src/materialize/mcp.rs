//! MCP catalog rendering and gateway lifecycle.
//!
//! The gateway boots with `--catalog` pointing at the rendered YAML; on
//! every approval/revocation the catalog is rewritten, the gateway is
//! restarted through the Docker socket proxy, and active chats get a
//! `[SYSTEM]` note so the assistant knows its toolbox changed.

use super::Materializer;
use crate::error::{Error, Result};
use crate::store::types::{McpServer, McpStatus, Part};
use reqwest::StatusCode;
use serde::Serialize;
use std::collections::BTreeMap;

/// Gateway SSE endpoint subagents connect to (compiled into the sandbox
/// topology, referenced in notifications).
const GATEWAY_SSE_URL: &str = "http://mcp-gateway:8811/sse";

#[derive(Serialize)]
struct CatalogDocument {
    name: String,
    #[serde(rename = "displayName")]
    display_name: String,
    registry: BTreeMap<String, CatalogEntry>,
}

#[derive(Serialize)]
struct CatalogEntry {
    title: String,
    description: String,
    #[serde(rename = "type")]
    kind: String,
    image: String,
    #[serde(rename = "longLived")]
    long_lived: bool,
}

impl Materializer {
    /// Rewrite the gateway catalog from the approved server set.
    pub async fn render_mcp_catalog(&self) -> Result<()> {
        let servers = self.store.approved_mcp_servers().await?;

        let registry: BTreeMap<String, CatalogEntry> = servers
            .iter()
            .filter(|s| !s.name.is_empty())
            .map(|s| {
                (
                    s.name.clone(),
                    CatalogEntry {
                        title: s.name.clone(),
                        description: "Approved by user".to_string(),
                        kind: "server".to_string(),
                        image: format!("mcp/{}", s.name),
                        // ephemeral containers: die after each tool result
                        long_lived: false,
                    },
                )
            })
            .collect();

        let document = CatalogDocument {
            name: "docker-mcp".to_string(),
            display_name: "Dynamic Catalog".to_string(),
            registry,
        };

        if let Some(dir) = self.paths.mcp_config_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let yaml = serde_yaml::to_string(&document)?;
        let content = format!("# MCP gateway catalog (auto-generated)\n{yaml}");
        tokio::fs::write(&self.paths.mcp_config_path, content).await?;

        tracing::info!(
            count = servers.len(),
            path = %self.paths.mcp_config_path.display(),
            "rendered mcp catalog"
        );
        Ok(())
    }

    /// Restart the gateway container through the socket proxy. A missing
    /// container (404) is not an error — the gateway is optional in dev
    /// topologies.
    pub async fn restart_gateway(&self) -> Result<()> {
        let addr = self
            .docker
            .host
            .strip_prefix("tcp://")
            .unwrap_or(&self.docker.host);
        let url = format!(
            "http://{}/containers/{}/restart",
            addr, self.docker.gateway_container
        );

        let response = self.docker_client.post(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::warn!(
                container = %self.docker.gateway_container,
                "gateway container not found, skipping restart"
            );
            return Ok(());
        }
        if response.status().as_u16() >= 400 {
            return Err(Error::Engine(format!(
                "docker restart rejected: {}",
                response.status()
            )));
        }

        tracing::info!(container = %self.docker.gateway_container, "gateway restart sent");
        Ok(())
    }

    /// Tell the assistant (in every chat it currently holds) about a server
    /// status change, via a synthetic system prompt.
    pub async fn notify_mcp_change(&self, server_name: &str, status: McpStatus) {
        let message = match status {
            McpStatus::Approved => format!(
                "[SYSTEM] MCP server '{server_name}' is now available. Subagents can connect to the gateway at {GATEWAY_SSE_URL}."
            ),
            McpStatus::Revoked => format!(
                "[SYSTEM] MCP server '{server_name}' has been revoked and is no longer available to subagents."
            ),
            McpStatus::Denied => {
                format!("[SYSTEM] MCP server '{server_name}' request was denied by the user.")
            }
            McpStatus::Pending => return,
        };

        let chats = match self.store.chats_with_active_session(10).await {
            Ok(chats) => chats,
            Err(e) => {
                tracing::warn!(error = %e, "could not find chats for mcp notification");
                return;
            }
        };

        for chat in chats {
            let part = Part::text(format!("sys_{}", uuid::Uuid::new_v4().simple()), &message);
            match self
                .engine
                .prompt_async(&chat.engine_session_id, &[part])
                .await
            {
                Ok(()) => {
                    tracing::info!(chat_id = %chat.id, "mcp notification sent");
                }
                Err(e) => {
                    tracing::warn!(chat_id = %chat.id, error = %e, "mcp notification failed");
                }
            }
        }
    }

    /// Record-hook entry point for `mcp_servers` updates.
    pub async fn handle_mcp_status_change(&self, server: &McpServer) {
        tracing::info!(server = %server.name, status = ?server.status, "mcp server status changed");
        match server.status {
            McpStatus::Approved | McpStatus::Revoked => {
                if let Err(e) = self.render_mcp_catalog().await {
                    tracing::error!(error = %e, "mcp catalog render failed");
                    return;
                }
                if let Err(e) = self.restart_gateway().await {
                    // notify regardless; the gateway may come back on its own
                    tracing::error!(error = %e, "gateway restart failed");
                }
                self.notify_mcp_change(&server.name, server.status).await;
            }
            McpStatus::Denied => {
                self.notify_mcp_change(&server.name, server.status).await;
            }
            McpStatus::Pending => {}
        }
    }
}
