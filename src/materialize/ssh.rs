//! SSH authorized-keys distribution.

use super::Materializer;
use crate::error::Result;

impl Materializer {
    /// Rewrite `authorized_keys` from every active key row.
    pub async fn sync_ssh_keys(&self) -> Result<()> {
        let keys = self.store.active_ssh_keys().await?;

        let mut content = String::new();
        for key in &keys {
            if !key.public_key.is_empty() {
                content.push_str(&key.public_key);
                content.push('\n');
            }
        }

        // The volume only exists inside the container; outside it, skip
        // rather than litter the host.
        if !self.paths.ssh_keys_dir.exists() {
            tracing::warn!(
                dir = %self.paths.ssh_keys_dir.display(),
                "ssh volume missing, skipping key sync"
            );
            return Ok(());
        }

        let target = self.paths.ssh_keys_dir.join("authorized_keys");
        tokio::fs::write(&target, content).await?;
        tracing::info!(count = keys.len(), path = %target.display(), "synced ssh keys");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{DockerConfig, EngineConfig, MaterializePaths};
    use crate::engine::EngineClient;
    use crate::materialize::Materializer;
    use crate::store::types::SshKey;
    use crate::store::{MemoryStore, Store};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn materializer(store: Arc<MemoryStore>, dir: &TempDir) -> Materializer {
        let engine = Arc::new(EngineClient::new(EngineConfig {
            url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        }));
        let paths = MaterializePaths {
            ssh_keys_dir: dir.path().to_path_buf(),
            mcp_config_path: dir.path().join("docker-mcp.yaml"),
            workspace_dir: dir.path().join("workspace"),
            agent_store_dir: dir.path().join("agent_store"),
        };
        Materializer::new(store, engine, paths, DockerConfig::default())
    }

    #[tokio::test]
    async fn test_writes_active_keys_only() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_ssh_key(SshKey {
                public_key: "ssh-ed25519 AAAA1 user@laptop".to_string(),
                is_active: true,
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .create_ssh_key(SshKey {
                public_key: "ssh-ed25519 AAAA2 user@old".to_string(),
                is_active: false,
                ..Default::default()
            })
            .await
            .unwrap();

        let dir = TempDir::new().unwrap();
        let materializer = materializer(store, &dir);
        materializer.sync_ssh_keys().await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("authorized_keys")).unwrap();
        assert_eq!(content, "ssh-ed25519 AAAA1 user@laptop\n");
    }

    #[tokio::test]
    async fn test_rewrite_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_ssh_key(SshKey {
                public_key: "ssh-ed25519 AAAA1 a".to_string(),
                is_active: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let dir = TempDir::new().unwrap();
        let materializer = materializer(store, &dir);
        materializer.sync_ssh_keys().await.unwrap();
        materializer.sync_ssh_keys().await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("authorized_keys")).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_missing_volume_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let materializer = materializer(store, &dir);
        drop(dir); // volume gone
        assert!(materializer.sync_ssh_keys().await.is_ok());
    }
}
