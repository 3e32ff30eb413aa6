//! Sovereign Authority — the permission gate between the engine and the
//! sandbox.
//!
//! Every `permission.asked` event is evaluated against two whitelist tables:
//! verb rules (`whitelist_actions`) decide whether the requested operation
//! is trusted at all, noun rules (`whitelist_targets`) then require every
//! requested path to match at least one target glob. A fully whitelisted
//! request is recorded `authorized` and answered immediately; anything else
//! is recorded as a `draft` and waits for a human decision, which the
//! permission update hook relays back to the engine.
//!
//! ```text
//! (engine event) ─► draft ─► authorized ──► reply "once"   (terminal)
//!                     │
//!                     └────► denied ──────► reply "reject" (terminal)
//! ```

pub mod wildcard;

use crate::engine::events::PermissionAskedPayload;
use crate::engine::{EngineClient, PermissionReply};
use crate::error::Result;
use crate::store::types::{Permission, PermissionStatus, WhitelistKind};
use crate::store::Store;
use serde_json::{Map, Value};
use std::sync::Arc;
use wildcard::match_wildcard;

/// Component tag recorded on permission rows this service creates.
const PERMISSION_SOURCE: &str = "relay";

/// A permission request reduced to the inputs evaluation cares about.
#[derive(Debug, Clone, Default)]
pub struct EvaluationInput {
    /// The verb: `bash`, `edit`, `read`, ...
    pub permission: String,
    /// Noun patterns (file paths) the verb applies to
    pub patterns: Vec<String>,
    /// Request metadata; `command` for bash
    pub metadata: Map<String, Value>,
}

impl EvaluationInput {
    fn command(&self) -> &str {
        self.metadata
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("")
    }
}

/// Whitelist evaluator plus the engine reply round-trip.
pub struct Authority {
    store: Arc<dyn Store>,
    engine: Arc<EngineClient>,
}

impl Authority {
    pub fn new(store: Arc<dyn Store>, engine: Arc<EngineClient>) -> Self {
        Self { store, engine }
    }

    /// Evaluate a request against the active whitelist rows.
    ///
    /// Pure with respect to its inputs: the same request against the same
    /// rows always yields the same verdict.
    pub async fn evaluate(&self, input: &EvaluationInput) -> Result<(bool, PermissionStatus)> {
        tracing::debug!(
            verb = %input.permission,
            nouns = ?input.patterns,
            "evaluating permission request"
        );

        let mut whitelisted = false;

        let actions = self
            .store
            .active_whitelist_actions(&input.permission)
            .await?;
        for rule in &actions {
            let matched = if input.permission == "bash" {
                match rule.kind {
                    WhitelistKind::Strict => {
                        !rule.value.is_empty() && input.command() == rule.value
                    }
                    WhitelistKind::Pattern => {
                        !rule.value.is_empty() && match_wildcard(input.command(), &rule.value)
                    }
                }
            } else {
                // Non-bash verbs are all-or-nothing: a pattern rule of "*"
                // (or blank) trusts the verb, path scoping happens below.
                rule.kind == WhitelistKind::Pattern
                    && (rule.value == "*" || rule.value.is_empty())
            };
            if matched {
                whitelisted = true;
                break;
            }
        }

        // Every non-empty noun must land inside at least one target glob.
        if whitelisted && !input.patterns.is_empty() {
            let targets = self.store.active_whitelist_targets().await?;
            for noun in input.patterns.iter().filter(|n| !n.is_empty()) {
                let covered = targets.iter().any(|t| match_wildcard(noun, &t.pattern));
                if !covered {
                    tracing::info!(noun = %noun, "path not covered by whitelist targets");
                    whitelisted = false;
                    break;
                }
            }
        }

        let status = if whitelisted {
            PermissionStatus::Authorized
        } else {
            PermissionStatus::Draft
        };
        Ok((whitelisted, status))
    }

    /// Handle a `permission.asked` event: record the request and auto-reply
    /// when the whitelist authorizes it.
    pub async fn handle_asked(
        &self,
        payload: PermissionAskedPayload,
        chat_id: String,
    ) -> Result<Permission> {
        if payload.id.is_empty() {
            return Err(crate::Error::Engine(
                "permission request missing id".to_string(),
            ));
        }

        // the engine may re-emit a request; request ids are unique
        if let Some(existing) = self.store.permission_by_request_id(&payload.id).await? {
            tracing::debug!(request_id = %payload.id, "permission request already recorded");
            return Ok(existing);
        }

        if chat_id.is_empty() {
            tracing::warn!(
                session_id = %payload.session_id,
                "no chat context for permission request, recording it unrouted"
            );
        }

        let input = EvaluationInput {
            permission: payload.permission.clone(),
            patterns: payload.patterns.clone(),
            metadata: payload.metadata.clone(),
        };
        let (whitelisted, status) = self.evaluate(&input).await?;

        let (message_id, call_id) = payload
            .tool
            .map(|t| (t.message_id, t.call_id))
            .unwrap_or_default();

        let record = self
            .store
            .create_permission(Permission {
                engine_request_id: payload.id.clone(),
                session_id: payload.session_id,
                chat_id,
                permission: payload.permission,
                patterns: payload.patterns,
                metadata: payload.metadata,
                status,
                message: payload.message,
                source: PERMISSION_SOURCE.to_string(),
                message_id,
                call_id,
                challenge: uuid::Uuid::new_v4().to_string(),
                ..Default::default()
            })
            .await?;

        if whitelisted {
            tracing::info!(request_id = %payload.id, "auto-authorized permission");
            if let Err(e) = self
                .engine
                .permission_reply(&payload.id, PermissionReply::Once)
                .await
            {
                tracing::error!(request_id = %payload.id, error = %e, "auto-reply failed");
            }
        } else {
            tracing::info!(request_id = %payload.id, "permission gated as draft");
        }

        Ok(record)
    }

    /// Relay a human decision back to the engine. Fired by the record hook
    /// whenever a permission row is updated.
    pub async fn handle_permission_update(&self, permission: &Permission) {
        let request_id = &permission.engine_request_id;
        match permission.status {
            PermissionStatus::Authorized => {
                tracing::info!(request_id = %request_id, "permission authorized, replying");
                if let Err(e) = self
                    .engine
                    .permission_reply(request_id, PermissionReply::Once)
                    .await
                {
                    tracing::error!(request_id = %request_id, error = %e, "reply failed");
                }
            }
            PermissionStatus::Denied => {
                tracing::info!(request_id = %request_id, "permission denied, replying");
                if let Err(e) = self
                    .engine
                    .permission_reply(request_id, PermissionReply::Reject)
                    .await
                {
                    tracing::error!(request_id = %request_id, error = %e, "reply failed");
                }
            }
            PermissionStatus::Draft => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::types::{WhitelistAction, WhitelistTarget};
    use crate::store::MemoryStore;

    fn authority(store: Arc<MemoryStore>) -> Authority {
        // points at a closed port; evaluation tests never hit the engine
        let engine = Arc::new(EngineClient::new(EngineConfig {
            url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        }));
        Authority::new(store, engine)
    }

    fn bash_input(command: &str, patterns: &[&str]) -> EvaluationInput {
        let mut metadata = Map::new();
        metadata.insert("command".into(), Value::String(command.to_string()));
        EvaluationInput {
            permission: "bash".to_string(),
            patterns: patterns.iter().map(|s| s.to_string()).collect(),
            metadata,
        }
    }

    async fn seed_git_rule(store: &MemoryStore) {
        store
            .create_whitelist_action(WhitelistAction {
                permission: "bash".to_string(),
                kind: WhitelistKind::Pattern,
                value: "git *".to_string(),
                active: true,
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .create_whitelist_target(WhitelistTarget {
                pattern: "/workspace/**".to_string(),
                active: true,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bash_pattern_rule_authorizes() {
        let store = Arc::new(MemoryStore::new());
        seed_git_rule(&store).await;
        let authority = authority(store);

        let (ok, status) = authority
            .evaluate(&bash_input("git status", &["/workspace/a.go"]))
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(status, PermissionStatus::Authorized);
    }

    #[tokio::test]
    async fn test_noun_outside_targets_drafts() {
        let store = Arc::new(MemoryStore::new());
        seed_git_rule(&store).await;
        let authority = authority(store);

        let (ok, status) = authority
            .evaluate(&bash_input("git status", &["/etc/passwd"]))
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(status, PermissionStatus::Draft);
    }

    #[tokio::test]
    async fn test_unlisted_command_drafts() {
        let store = Arc::new(MemoryStore::new());
        seed_git_rule(&store).await;
        let authority = authority(store);

        let (ok, _) = authority
            .evaluate(&bash_input("rm -rf /", &[]))
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_inactive_rules_ignored() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_whitelist_action(WhitelistAction {
                permission: "bash".to_string(),
                kind: WhitelistKind::Pattern,
                value: "git *".to_string(),
                active: false,
                ..Default::default()
            })
            .await
            .unwrap();
        let authority = authority(store);

        let (ok, _) = authority
            .evaluate(&bash_input("git status", &[]))
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_strict_rule_requires_exact_command() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_whitelist_action(WhitelistAction {
                permission: "bash".to_string(),
                kind: WhitelistKind::Strict,
                value: "cargo fmt".to_string(),
                active: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let authority = authority(store);

        let (ok, _) = authority
            .evaluate(&bash_input("cargo fmt", &[]))
            .await
            .unwrap();
        assert!(ok);

        let (ok, _) = authority
            .evaluate(&bash_input("cargo fmt --check", &[]))
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_non_bash_star_rule() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_whitelist_action(WhitelistAction {
                permission: "read".to_string(),
                kind: WhitelistKind::Pattern,
                value: "*".to_string(),
                active: true,
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .create_whitelist_target(WhitelistTarget {
                pattern: "/workspace/**".to_string(),
                active: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let authority = authority(store);

        let (ok, _) = authority
            .evaluate(&EvaluationInput {
                permission: "read".to_string(),
                patterns: vec!["/workspace/src/lib.rs".to_string()],
                metadata: Map::new(),
            })
            .await
            .unwrap();
        assert!(ok);

        let (ok, _) = authority
            .evaluate(&EvaluationInput {
                permission: "read".to_string(),
                patterns: vec!["/root/.ssh/id_ed25519".to_string()],
                metadata: Map::new(),
            })
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_evaluate_is_deterministic() {
        let store = Arc::new(MemoryStore::new());
        seed_git_rule(&store).await;
        let authority = authority(store);

        let input = bash_input("git log", &["/workspace/x"]);
        let first = authority.evaluate(&input).await.unwrap();
        let second = authority.evaluate(&input).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_nouns_skipped() {
        let store = Arc::new(MemoryStore::new());
        seed_git_rule(&store).await;
        let authority = authority(store);

        // empty-string nouns do not veto an otherwise-authorized request
        let (ok, _) = authority
            .evaluate(&bash_input("git status", &[""]))
            .await
            .unwrap();
        assert!(ok);
    }
}
