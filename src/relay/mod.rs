//! The relay core.
//!
//! [`Relay`] owns every piece of shared state — part cache, completed set,
//! per-chat and per-message mutexes, resolver cache, snapshot timers,
//! heartbeat bookkeeping — and every handler runs against it. The record
//! store remains the system of record: all in-memory state here is
//! reconstructible and cleared on restart without loss.
//!
//! Lock hierarchy (never taken out of order):
//! 1. `chat_mutexes[chat_id]` — multi-field chat updates
//! 2. `msg_mutexes[engine_message_id]` — cache mutation, snapshot, completion
//! 3. part cache / connection registry / completed set internals (brief)

pub mod envelope;
pub mod health;
pub mod ingest;
pub mod messages;
pub mod parts;
pub mod pump;
pub mod resolver;
pub mod scheduler;
pub mod session;

use crate::authority::Authority;
use crate::broadcast::ChatBroadcaster;
use crate::config::RelayConfig;
use crate::engine::EngineClient;
use crate::error::{Error, Result};
use crate::materialize::Materializer;
use crate::store::types::{Chat, Message};
use crate::store::Store;
use envelope::ErrorEnvelope;
use parts::{CompletedSet, KeyedMutexes, PartCache};
use scheduler::SnapshotScheduler;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Attempts for store saves racing a relation commit.
const SAVE_RETRY_ATTEMPTS: u32 = 20;
/// Linear backoff step between save retries.
const SAVE_RETRY_STEP_MS: u64 = 50;

/// Orchestrates event ingestion, message assembly, permission gating,
/// dispatch, health, and fan-out against one engine and one store.
pub struct Relay {
    config: RelayConfig,
    store: Arc<dyn Store>,
    engine: Arc<EngineClient>,
    broadcaster: Arc<ChatBroadcaster>,
    authority: Arc<Authority>,
    materializer: Arc<Materializer>,

    pub(crate) chat_mutexes: KeyedMutexes,
    pub(crate) msg_mutexes: KeyedMutexes,
    pub(crate) parts: PartCache,
    pub(crate) completed: CompletedSet,
    pub(crate) session_chat_cache: RwLock<HashMap<String, String>>,
    pub(crate) scheduler: SnapshotScheduler,

    /// Unix millis of the last engine heartbeat (0 = none yet).
    pub(crate) last_heartbeat: AtomicI64,
    pub(crate) is_ready: AtomicBool,
}

impl Relay {
    pub fn new(config: RelayConfig, store: Arc<dyn Store>) -> Arc<Self> {
        let engine = Arc::new(EngineClient::new(config.engine.clone()));
        let broadcaster = Arc::new(ChatBroadcaster::new());
        let authority = Arc::new(Authority::new(store.clone(), engine.clone()));
        let materializer = Arc::new(Materializer::new(
            store.clone(),
            engine.clone(),
            config.paths.clone(),
            config.docker.clone(),
        ));
        let scheduler = SnapshotScheduler::new(
            config.timing.broadcast_debounce(),
            config.timing.store_debounce(),
        );

        Arc::new(Self {
            config,
            store,
            engine,
            broadcaster,
            authority,
            materializer,
            chat_mutexes: KeyedMutexes::new(),
            msg_mutexes: KeyedMutexes::new(),
            parts: PartCache::new(),
            completed: CompletedSet::new(),
            session_chat_cache: RwLock::new(HashMap::new()),
            scheduler,
            last_heartbeat: AtomicI64::new(0),
            is_ready: AtomicBool::new(false),
        })
    }

    // ── accessors ───────────────────────────────────────────────────────

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<EngineClient> {
        &self.engine
    }

    pub fn broadcaster(&self) -> &Arc<ChatBroadcaster> {
        &self.broadcaster
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    pub fn materializer(&self) -> &Arc<Materializer> {
        &self.materializer
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    /// Start every background process: the SSE listener, the record-hook
    /// router, the recovery pump, the health watchdog, and the initial
    /// filesystem syncs.
    pub fn start(self: &Arc<Self>) {
        tracing::info!("starting relay service");

        tracing::info!("starting engine event listener");
        tokio::spawn(self.clone().run_event_loop());

        tracing::info!("starting record hook router");
        crate::hooks::spawn_hook_router(self.clone());

        tracing::info!("starting message recovery pump");
        let relay = self.clone();
        tokio::spawn(async move { relay.recover_missed_messages().await });

        tracing::info!("starting health watchdog");
        tokio::spawn(self.clone().run_watchdog());

        tracing::info!("running initial materializer sync");
        let materializer = self.materializer.clone();
        tokio::spawn(async move { materializer.sync_all().await });

        tracing::info!("relay service started");
    }

    // ── shared helpers ──────────────────────────────────────────────────

    /// Run a multi-field chat update atomically: lock the chat's mutex,
    /// re-read the row, apply the mutation, save.
    pub async fn with_chat_lock<F>(&self, chat_id: &str, mutate: F) -> Result<Chat>
    where
        F: FnOnce(&mut Chat),
    {
        if chat_id.is_empty() {
            return Err(Error::Internal("empty chat id".to_string()));
        }
        let mutex = self.chat_mutexes.entry(chat_id);
        let _guard = mutex.lock().await;

        let mut chat = self.store.chat(chat_id).await?;
        mutate(&mut chat);
        self.store.save_chat(&chat).await?;
        Ok(chat)
    }

    /// Save a message, retrying when the store reports a relation that is
    /// not committed yet (row created before a referenced row landed).
    pub async fn save_message_with_retry(&self, message: &Message) -> Result<()> {
        let mut last = None;
        for attempt in 0..SAVE_RETRY_ATTEMPTS {
            match self.store.save_message(message).await {
                Ok(()) => return Ok(()),
                Err(Error::RelationNotFound(detail)) => {
                    tracing::warn!(
                        message_id = %message.id,
                        attempt = attempt + 1,
                        "relation not committed yet, retrying save"
                    );
                    last = Some(Error::RelationNotFound(detail));
                    tokio::time::sleep(Duration::from_millis(
                        SAVE_RETRY_STEP_MS * (attempt as u64 + 1),
                    ))
                    .await;
                }
                Err(other) => return Err(other),
            }
        }
        tracing::error!(message_id = %message.id, "save retries exhausted");
        Err(last.unwrap_or_else(|| Error::Internal("save retries exhausted".to_string())))
    }

    /// Create a message with the same relation-race retry policy.
    pub async fn create_message_with_retry(&self, message: Message) -> Result<Message> {
        let mut last = None;
        for attempt in 0..SAVE_RETRY_ATTEMPTS {
            match self.store.create_message(message.clone()).await {
                Ok(created) => return Ok(created),
                Err(Error::RelationNotFound(detail)) => {
                    last = Some(Error::RelationNotFound(detail));
                    tokio::time::sleep(Duration::from_millis(
                        SAVE_RETRY_STEP_MS * (attempt as u64 + 1),
                    ))
                    .await;
                }
                Err(other) => return Err(other),
            }
        }
        Err(last.unwrap_or_else(|| Error::Internal("create retries exhausted".to_string())))
    }

    /// Fail every message still `processing` with the given envelope.
    ///
    /// Used when the connection to the engine is lost as a whole
    /// (heartbeat timeout, stream closed): each message gets a trailing
    /// error part, a failure broadcast, and its chat's turn handed back to
    /// the user.
    pub async fn fail_all_active_sessions(&self, env: ErrorEnvelope) {
        let processing = match self.store.processing_messages().await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!(error = %e, "failed to query active messages");
                return;
            }
        };

        let mut failed = 0usize;
        for message in processing {
            if message.chat_id.is_empty() {
                tracing::warn!(message_id = %message.id, "skipping message without chat");
                continue;
            }
            self.handle_error_completion(&message.chat_id, &message.id, env.clone())
                .await;
            failed += 1;
        }

        tracing::info!(count = failed, code = ?env.code(), "failed all active sessions");
    }
}
