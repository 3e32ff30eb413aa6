//! Service wiring.
//!
//! Builds the relay against a store, starts the background loops, and
//! serves the HTTP surface (health + per-chat streams). The embedded
//! in-memory store backs the standalone binary; a deployment embedding the
//! relay next to a real record store passes its own [`Store`].

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::relay::health::HEALTHCHECK_COMPONENT;
use crate::relay::Relay;
use crate::store::{MemoryStore, Store};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

/// HTTP surface for a running relay.
pub fn api_router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/chats/:id/stream", get(crate::broadcast::stream_chat))
        .with_state(relay)
}

async fn get_health(State(relay): State<Arc<Relay>>) -> Json<Value> {
    let engine = relay
        .store()
        .healthcheck(HEALTHCHECK_COMPONENT)
        .await
        .ok()
        .flatten();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "engine_ready": relay.is_engine_ready(),
        "engine": engine,
    }))
}

/// Build a relay on the given store and start its background processes.
pub fn start_relay(config: RelayConfig, store: Arc<dyn Store>) -> Arc<Relay> {
    let relay = Relay::new(config, store);
    relay.start();
    relay
}

/// Bind and serve until Ctrl-C. The standalone entry point.
pub async fn run_server(config: RelayConfig, host: &str, port: u16) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let relay = start_relay(config, store);
    let app = api_router(relay);

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address: {e}")))?;
    tracing::info!(%addr, "relay listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    tracing::info!("shutting down");
    Ok(())
}
