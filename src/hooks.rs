//! Record-hook router.
//!
//! One subscriber task drains the store's change feed and fans each event
//! out to the component that reacts to it. Handlers run in their own tasks
//! so a slow materializer never backs up the feed; a lagged receiver just
//! resynchronizes (every materializer rebuilds from store state anyway).

use crate::relay::Relay;
use crate::store::types::{Role, UserMessageStatus};
use crate::store::{HookAction, RecordChange, StoreEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub fn spawn_hook_router(relay: Arc<Relay>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = relay.store().subscribe();
        loop {
            match events.recv().await {
                Ok(event) => route(&relay, event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "hook router lagged behind store events");
                }
                Err(RecvError::Closed) => {
                    tracing::info!("store event feed closed, hook router exiting");
                    break;
                }
            }
        }
    })
}

fn route(relay: &Arc<Relay>, event: StoreEvent) {
    let StoreEvent { action, change } = event;
    match change {
        RecordChange::Message(message) => {
            // new user messages feed the pump; everything else about
            // messages is relay-written state
            if action == HookAction::Create
                && message.role == Role::User
                && matches!(
                    message.user_message_status,
                    UserMessageStatus::Pending | UserMessageStatus::Unset
                )
            {
                tracing::info!(message_id = %message.id, "intercepted user message");
                let relay = relay.clone();
                tokio::spawn(async move {
                    relay.process_user_message(message).await;
                });
            }
        }

        RecordChange::Permission(permission) => {
            if action == HookAction::Update {
                let relay = relay.clone();
                tokio::spawn(async move {
                    relay
                        .authority()
                        .handle_permission_update(&permission)
                        .await;
                });
            }
        }

        RecordChange::McpServer(server) => {
            if action == HookAction::Update {
                let relay = relay.clone();
                tokio::spawn(async move {
                    relay.materializer().handle_mcp_status_change(&server).await;
                });
            }
        }

        RecordChange::SshKey(_) => {
            let relay = relay.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.materializer().sync_ssh_keys().await {
                    tracing::warn!(error = %e, "hook-driven ssh sync failed");
                }
            });
        }

        RecordChange::Agent(agent) => {
            if matches!(action, HookAction::Create | HookAction::Update) {
                let relay = relay.clone();
                tokio::spawn(async move {
                    if let Err(e) = relay.materializer().refresh_agent(&agent).await {
                        tracing::warn!(agent = %agent.name, error = %e, "agent refresh failed");
                    }
                });
            }
        }

        // a prompt, model, or rule change can affect any number of bundles
        RecordChange::Prompt(_) | RecordChange::Model(_) | RecordChange::PermissionRule(_) => {
            let relay = relay.clone();
            tokio::spawn(async move {
                relay.materializer().sync_all_agents().await;
            });
        }

        RecordChange::Proposal(proposal) => {
            let relay = relay.clone();
            tokio::spawn(async move {
                relay.materializer().deploy_proposal(&proposal).await;
                if action == HookAction::Update {
                    match relay.materializer().seal_proposal(&proposal).await {
                        Ok(Some(_)) => {}
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(
                                proposal = %proposal.name,
                                error = %e,
                                "proposal sealing failed"
                            );
                        }
                    }
                }
            });
        }

        RecordChange::Sop(sop) => {
            let relay = relay.clone();
            tokio::spawn(async move {
                relay.materializer().deploy_sop(&sop).await;
            });
        }
    }
}
