//! Proposal mirroring and SOP sealing.
//!
//! Proposals are collaborative drafts mirrored into the workspace. When one
//! is approved its content is sealed — SHA-256 over the exact bytes — into
//! a SOP row, which materializes as a skill file the engine loads natively.

use super::Materializer;
use crate::error::Result;
use crate::store::types::{Proposal, ProposalStatus, Sop};
use sha2::{Digest, Sha256};

/// Hex SHA-256 of content bytes.
pub fn seal_signature(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl Materializer {
    /// Mirror a proposal draft into the workspace.
    pub async fn deploy_proposal(&self, proposal: &Proposal) {
        if proposal.name.is_empty() {
            return;
        }
        let dir = self.paths.workspace_dir.join(".opencode/proposals");
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            tracing::warn!(error = %e, "proposal dir create failed");
            return;
        }
        let target = dir.join(format!("{}.md", proposal.name));
        if let Err(e) = tokio::fs::write(&target, &proposal.content).await {
            tracing::warn!(proposal = %proposal.name, error = %e, "proposal mirror failed");
        }
    }

    /// Seal an approved proposal into a SOP row (the SOP hook then writes
    /// the skill file).
    pub async fn seal_proposal(&self, proposal: &Proposal) -> Result<Option<Sop>> {
        if proposal.status != ProposalStatus::Approved {
            return Ok(None);
        }
        let signature = seal_signature(&proposal.content);
        let sop = self
            .store
            .upsert_sop(&proposal.name, &proposal.content, &signature)
            .await?;
        tracing::info!(name = %proposal.name, signature = %signature, "sealed proposal into sop");
        Ok(Some(sop))
    }

    /// Write a sealed SOP to its skill location.
    pub async fn deploy_sop(&self, sop: &Sop) {
        if sop.name.is_empty() {
            return;
        }
        let dir = self
            .paths
            .workspace_dir
            .join(".opencode/skills")
            .join(&sop.name);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            tracing::warn!(error = %e, "sop dir create failed");
            return;
        }
        let target = dir.join("SKILL.md");
        match tokio::fs::write(&target, &sop.content).await {
            Ok(()) => {
                tracing::info!(name = %sop.name, "materialized sop");
            }
            Err(e) => {
                tracing::warn!(name = %sop.name, error = %e, "sop write failed");
            }
        }
    }

    pub async fn sync_all_proposals(&self) {
        if let Ok(proposals) = self.store.proposals().await {
            for proposal in &proposals {
                self.deploy_proposal(proposal).await;
            }
        }
    }

    pub async fn sync_all_sops(&self) {
        if let Ok(sops) = self.store.sops().await {
            for sop in &sops {
                self.deploy_sop(sop).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DockerConfig, EngineConfig, MaterializePaths};
    use crate::engine::EngineClient;
    use crate::store::{MemoryStore, Store};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn materializer(store: Arc<MemoryStore>, dir: &TempDir) -> Materializer {
        let engine = Arc::new(EngineClient::new(EngineConfig {
            url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        }));
        let paths = MaterializePaths {
            ssh_keys_dir: dir.path().join("ssh"),
            mcp_config_path: dir.path().join("mcp/docker-mcp.yaml"),
            workspace_dir: dir.path().join("workspace"),
            agent_store_dir: dir.path().join("agent_store"),
        };
        Materializer::new(store, engine, paths, DockerConfig::default())
    }

    #[test]
    fn test_signature_is_sha256_hex() {
        // echo -n "hello" | sha256sum
        assert_eq!(
            seal_signature("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn test_draft_proposal_not_sealed() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let materializer = materializer(store.clone(), &dir);

        let proposal = Proposal {
            name: "deploy-runbook".to_string(),
            content: "steps...".to_string(),
            status: ProposalStatus::Draft,
            ..Default::default()
        };
        let sealed = materializer.seal_proposal(&proposal).await.unwrap();
        assert!(sealed.is_none());
        assert!(store.sops().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_approval_seals_and_deploys() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let materializer = materializer(store.clone(), &dir);

        let proposal = Proposal {
            name: "deploy-runbook".to_string(),
            content: "1. build\n2. ship\n".to_string(),
            status: ProposalStatus::Approved,
            ..Default::default()
        };
        let sop = materializer
            .seal_proposal(&proposal)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sop.signature, seal_signature("1. build\n2. ship\n"));

        materializer.deploy_sop(&sop).await;
        let skill = std::fs::read_to_string(
            dir.path()
                .join("workspace/.opencode/skills/deploy-runbook/SKILL.md"),
        )
        .unwrap();
        assert_eq!(skill, "1. build\n2. ship\n");
    }

    #[tokio::test]
    async fn test_reapproval_updates_same_sop() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let materializer = materializer(store.clone(), &dir);

        let mut proposal = Proposal {
            name: "runbook".to_string(),
            content: "v1".to_string(),
            status: ProposalStatus::Approved,
            ..Default::default()
        };
        let first = materializer.seal_proposal(&proposal).await.unwrap().unwrap();

        proposal.content = "v2".to_string();
        let second = materializer.seal_proposal(&proposal).await.unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert_ne!(first.signature, second.signature);
        assert_eq!(store.sops().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_proposal_mirrored() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let materializer = materializer(store, &dir);

        let proposal = Proposal {
            name: "idea".to_string(),
            content: "draft text".to_string(),
            ..Default::default()
        };
        materializer.deploy_proposal(&proposal).await;

        let mirrored =
            std::fs::read_to_string(dir.path().join("workspace/.opencode/proposals/idea.md"))
                .unwrap();
        assert_eq!(mirrored, "draft text");
    }
}
