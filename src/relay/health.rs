//! Engine health tracking.
//!
//! The engine heartbeats over its event stream; the watchdog declares it
//! offline after sustained silence and fails everything in flight so users
//! are not left staring at a spinner. The next heartbeat recovers.

use super::envelope::{ErrorEnvelope, InfraCode};
use super::Relay;
use crate::store::types::HealthStatus;
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Name of the healthcheck row owned by the watchdog.
pub const HEALTHCHECK_COMPONENT: &str = "opencode";

impl Relay {
    /// Note a heartbeat. The first one promotes health to `ready`.
    pub fn record_heartbeat(self: &Arc<Self>) {
        self.last_heartbeat
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        if !self.is_ready.swap(true, Ordering::SeqCst) {
            tracing::info!("first heartbeat received, engine ready");
            let relay = self.clone();
            tokio::spawn(async move {
                relay.update_healthcheck(HealthStatus::Ready).await;
            });
        }
    }

    pub fn is_engine_ready(&self) -> bool {
        self.is_ready.load(Ordering::SeqCst)
    }

    pub(crate) async fn update_healthcheck(&self, status: HealthStatus) {
        if let Err(e) = self
            .store()
            .upsert_healthcheck(HEALTHCHECK_COMPONENT, status)
            .await
        {
            tracing::warn!(error = %e, "healthcheck upsert failed");
        }
    }

    /// Watchdog loop: compare heartbeat age against the timeout every tick.
    pub async fn run_watchdog(self: Arc<Self>) {
        let interval = self.config().timing.watchdog_interval();
        let timeout_ms = self.config().timing.heartbeat_timeout_ms as i64;

        loop {
            tokio::time::sleep(interval).await;

            let last = self.last_heartbeat.load(Ordering::SeqCst);
            if last == 0 {
                continue;
            }

            let silence = Utc::now().timestamp_millis() - last;
            if silence > timeout_ms {
                if self.is_ready.swap(false, Ordering::SeqCst) {
                    tracing::warn!(silence_ms = silence, "engine responsiveness lost");
                    self.update_healthcheck(HealthStatus::Offline).await;
                    self.fail_all_active_sessions(ErrorEnvelope::infrastructure(
                        InfraCode::HeartbeatTimeout,
                    ))
                    .await;
                }
            } else if !self.is_ready.swap(true, Ordering::SeqCst) {
                tracing::info!("engine responsiveness recovered");
                self.update_healthcheck(HealthStatus::Ready).await;
            }
        }
    }

    /// The event stream dropped mid-flight: everything processing is dead.
    pub async fn handle_stream_closed(&self) {
        tracing::warn!("engine event stream closed unexpectedly");
        self.fail_all_active_sessions(ErrorEnvelope::infrastructure(InfraCode::StreamClosed))
            .await;
    }
}
