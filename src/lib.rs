//! Sovereign Relay — the orchestration layer between a persistent record
//! store and the OpenCode execution engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         Record Store                           │
//! │   chats · messages · permissions · whitelists · ssh keys       │
//! │   mcp servers · agents · proposals · sops · healthchecks       │
//! └───────────────┬──────────────────────────────▲─────────────────┘
//!                 │ row-change hooks             │ typed writes
//! ┌───────────────▼──────────────────────────────┴─────────────────┐
//! │                          Relay core                            │
//! │  ┌──────────────┐ ┌───────────────┐ ┌───────────────────────┐  │
//! │  │ Message pump │ │   Sovereign   │ │   Part assembly       │  │
//! │  │ (user → eng) │ │   Authority   │ │   cache · debounce    │  │
//! │  └──────┬───────┘ │  (whitelist)  │ │   completion flush    │  │
//! │         │         └───────▲───────┘ └──────────┬────────────┘  │
//! │  ┌──────▼─────────────────┴────────────────────▼────────────┐  │
//! │  │        SSE ingestion · health watchdog · resolver        │  │
//! │  └──────────────────────────┬───────────────────────────────┘  │
//! │  ┌────────────────┐  ┌──────▼──────────┐  ┌────────────────┐   │
//! │  │ Materializers  │  │  Engine client  │  │ Chat broadcast │   │
//! │  │ ssh/agents/mcp │  │  (REST + SSE)   │  │ (UI SSE feeds) │   │
//! │  └────────────────┘  └─────────────────┘  └────────────────┘   │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`relay`]: the core — event ingestion, part assembly, completion,
//!   dispatch pump, session management, health watchdog
//! - [`authority`]: whitelist evaluation and the permission reply loop
//! - [`broadcast`]: per-chat SSE fan-out to UI clients
//! - [`store`]: the record-store port and its in-memory implementation
//! - [`engine`]: OpenCode REST client and event payload types
//! - [`materialize`]: hook-driven filesystem writers
//! - [`hooks`]: routes store change events into the components above
//! - [`config`] / [`bootstrap`]: settings and service wiring

pub mod authority;
pub mod bootstrap;
pub mod broadcast;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod materialize;
pub mod relay;
pub mod store;

pub use authority::Authority;
pub use broadcast::ChatBroadcaster;
pub use config::RelayConfig;
pub use engine::EngineClient;
pub use error::{Error, Result};
pub use materialize::Materializer;
pub use relay::envelope::{ErrorEnvelope, InfraCode};
pub use relay::Relay;
pub use store::{MemoryStore, Store};
