//! Filesystem materializers.
//!
//! Other containers consume selected store rows as plain files: the sandbox
//! sshd reads `authorized_keys`, the engine loads agent bundles and skill
//! files from the workspace, the MCP gateway boots from a rendered catalog.
//! Each materializer is hook-driven and idempotent — it rewrites its target
//! from the current store state, never diffs.

mod agents;
mod mcp;
mod sops;
mod ssh;

use crate::config::{DockerConfig, MaterializePaths};
use crate::engine::EngineClient;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;

pub struct Materializer {
    store: Arc<dyn Store>,
    engine: Arc<EngineClient>,
    paths: MaterializePaths,
    docker: DockerConfig,
    docker_client: reqwest::Client,
}

impl Materializer {
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<EngineClient>,
        paths: MaterializePaths,
        docker: DockerConfig,
    ) -> Self {
        let docker_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            store,
            engine,
            paths,
            docker,
            docker_client,
        }
    }

    /// Initial sync on startup: every materialized artifact is rebuilt from
    /// store state so a restart converges regardless of what was missed.
    pub async fn sync_all(&self) {
        if let Err(e) = self.sync_ssh_keys().await {
            tracing::warn!(error = %e, "initial ssh key sync failed");
        }
        self.sync_all_agents().await;
        if let Err(e) = self.render_mcp_catalog().await {
            tracing::warn!(error = %e, "initial mcp catalog render failed");
        }
        self.sync_all_proposals().await;
        self.sync_all_sops().await;
    }
}
