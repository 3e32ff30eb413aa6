//! Agent bundle assembly and deployment.
//!
//! A bundle is YAML frontmatter (description, mode, model, steps,
//! permission map) followed by the prompt body:
//!
//! ```text
//! ---
//! description: Reviews pull requests
//! model: anthropic/claude-sonnet-4
//! permission:
//!   "bash(git *)": allow
//! ---
//!
//! You are a meticulous reviewer...
//! ```
//!
//! The rendered bundle is cached on the agent row (`config`) so repeated
//! hook firings without an actual change do not re-save (which would fire
//! the hook again).

use super::Materializer;
use crate::error::Result;
use crate::store::types::AgentProfile;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Serialize)]
struct BundleFrontmatter {
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    steps: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    permission: BTreeMap<String, String>,
}

impl Materializer {
    /// Assemble the bundle text for an agent from its prompt, model, and
    /// permission rules.
    pub async fn build_agent_bundle(&self, agent: &AgentProfile) -> Result<String> {
        let model = if agent.model_id.is_empty() {
            None
        } else {
            self.store
                .model_profile(&agent.model_id)
                .await?
                .map(|m| m.identifier)
                .filter(|id| !id.is_empty())
        };

        let body = if agent.prompt_id.is_empty() {
            String::new()
        } else {
            self.store
                .prompt_template(&agent.prompt_id)
                .await?
                .map(|p| p.body)
                .unwrap_or_default()
        };

        let rules = self.store.permission_rules_for_agent(&agent.id).await?;
        let permission: BTreeMap<String, String> = rules
            .into_iter()
            .filter(|r| !r.pattern.is_empty())
            .map(|r| (r.pattern, r.action))
            .collect();

        let frontmatter = BundleFrontmatter {
            description: Some(agent.description.clone()).filter(|d| !d.is_empty()),
            mode: Some(agent.mode.clone()).filter(|m| !m.is_empty()),
            model,
            steps: agent.steps.clone(),
            permission,
        };

        let yaml = serde_yaml::to_string(&frontmatter)?;
        Ok(format!("---\n{yaml}---\n\n{body}"))
    }

    /// Rebuild an agent's bundle, persist it when it changed, and deploy.
    pub async fn refresh_agent(&self, agent: &AgentProfile) -> Result<()> {
        let bundle = self.build_agent_bundle(agent).await?;
        if agent.config != bundle {
            let mut updated = agent.clone();
            updated.config = bundle;
            self.store.save_agent_profile(&updated).await?;
            self.deploy_agent(&updated).await;
        } else {
            self.deploy_agent(agent).await;
        }
        Ok(())
    }

    /// Write an agent's cached bundle to its deployment directory.
    pub async fn deploy_agent(&self, agent: &AgentProfile) {
        if agent.name.is_empty() || agent.config.is_empty() {
            return;
        }

        let target_dir = if agent.is_init {
            self.paths.workspace_dir.join(".opencode/agents")
        } else {
            self.paths.agent_store_dir.clone()
        };

        if let Err(e) = tokio::fs::create_dir_all(&target_dir).await {
            tracing::error!(dir = %target_dir.display(), error = %e, "agent dir create failed");
            return;
        }

        let target = target_dir.join(format!("{}.md", agent.name));
        match tokio::fs::write(&target, &agent.config).await {
            Ok(()) => {
                tracing::info!(agent = %agent.name, path = %target.display(), "deployed agent");
            }
            Err(e) => {
                tracing::error!(agent = %agent.name, error = %e, "agent deploy failed");
            }
        }
    }

    /// Rebuild and deploy every agent in the registry.
    pub async fn sync_all_agents(&self) {
        let agents = match self.store.agent_profiles().await {
            Ok(agents) => agents,
            Err(e) => {
                tracing::warn!(error = %e, "agent sync query failed");
                return;
            }
        };
        for agent in &agents {
            if let Err(e) = self.refresh_agent(agent).await {
                tracing::warn!(agent = %agent.name, error = %e, "agent refresh failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{DockerConfig, EngineConfig, MaterializePaths};
    use crate::engine::EngineClient;
    use crate::materialize::Materializer;
    use crate::store::types::{AgentProfile, ModelProfile, PermissionRuleRow, PromptTemplate};
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
            mcp_config_path: dir.path().join("docker-mcp.yaml"),
            workspace_dir: dir.path().join("workspace"),
            agent_store_dir: dir.path().join("agent_store"),
        };
        Materializer::new(store, engine, paths, DockerConfig::default())
    }

    async fn seed_agent(store: &MemoryStore, is_init: bool) -> AgentProfile {
        let prompt = store
            .create_prompt_template(PromptTemplate {
                body: "You are a meticulous reviewer.".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let model = store
            .create_model_profile(ModelProfile {
                identifier: "anthropic/claude-sonnet-4".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let agent = store
            .create_agent_profile(AgentProfile {
                name: "reviewer".to_string(),
                description: "Reviews pull requests".to_string(),
                mode: "subagent".to_string(),
                is_init,
                prompt_id: prompt.id,
                model_id: model.id,
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .create_permission_rule(PermissionRuleRow {
                agent_id: agent.id.clone(),
                pattern: "bash(git *)".to_string(),
                action: "allow".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        agent
    }

    #[tokio::test]
    async fn test_bundle_shape() {
        let store = Arc::new(MemoryStore::new());
        let agent = seed_agent(&store, false).await;
        let dir = TempDir::new().unwrap();
        let materializer = materializer(store, &dir);

        let bundle = materializer.build_agent_bundle(&agent).await.unwrap();
        assert!(bundle.starts_with("---\n"));
        assert!(bundle.contains("description: Reviews pull requests"));
        assert!(bundle.contains("model: anthropic/claude-sonnet-4"));
        assert!(bundle.contains("bash(git *)"));
        assert!(bundle.contains("---\n\nYou are a meticulous reviewer."));
    }

    #[tokio::test]
    async fn test_refresh_caches_bundle_and_deploys() {
        let store = Arc::new(MemoryStore::new());
        let agent = seed_agent(&store, false).await;
        let dir = TempDir::new().unwrap();
        let materializer = materializer(store.clone(), &dir);

        materializer.refresh_agent(&agent).await.unwrap();

        let stored = store.agent_profiles().await.unwrap().remove(0);
        assert!(stored.config.contains("Reviews pull requests"));

        let deployed =
            std::fs::read_to_string(dir.path().join("agent_store").join("reviewer.md")).unwrap();
        assert_eq!(deployed, stored.config);

        // second refresh with unchanged inputs must not rewrite the row
        materializer.refresh_agent(&stored).await.unwrap();
        let again = store.agent_profiles().await.unwrap().remove(0);
        assert_eq!(again.config, stored.config);
    }

    #[tokio::test]
    async fn test_init_agents_deploy_into_workspace() {
        let store = Arc::new(MemoryStore::new());
        let agent = seed_agent(&store, true).await;
        let dir = TempDir::new().unwrap();
        let materializer = materializer(store, &dir);

        materializer.refresh_agent(&agent).await.unwrap();
        assert!(dir
            .path()
            .join("workspace/.opencode/agents/reviewer.md")
            .exists());
    }

    #[tokio::test]
    async fn test_agent_without_name_not_deployed() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let materializer = materializer(store, &dir);

        let agent = AgentProfile {
            config: "---\n---\n\nbody".to_string(),
            ..Default::default()
        };
        materializer.deploy_agent(&agent).await;
        assert!(!dir.path().join("agent_store").exists());
    }
}
