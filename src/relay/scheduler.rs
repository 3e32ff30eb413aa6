//! Snapshot debouncing.
//!
//! Per engine message id the relay keeps at most one pending broadcast
//! timer (fast, keeps the UI at a smooth frame rate) and one pending
//! store-write timer (slow, bounds database churn during streaming). A new
//! part resets both; completion cancels both and flushes synchronously.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Which of the two debouncers a timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Broadcast,
    StoreWrite,
}

/// Two-lane per-key debouncer.
pub struct SnapshotScheduler {
    broadcast_delay: Duration,
    store_delay: Duration,
    broadcast_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    store_timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SnapshotScheduler {
    pub fn new(broadcast_delay: Duration, store_delay: Duration) -> Self {
        Self {
            broadcast_delay,
            store_delay,
            broadcast_timers: Mutex::new(HashMap::new()),
            store_timers: Mutex::new(HashMap::new()),
        }
    }

    fn arm(
        &self,
        lane: Lane,
        key: &str,
        task: impl std::future::Future<Output = ()> + Send + 'static,
    ) {
        let (timers, delay) = match lane {
            Lane::Broadcast => (&self.broadcast_timers, self.broadcast_delay),
            Lane::StoreWrite => (&self.store_timers, self.store_delay),
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        let mut timers = timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = timers.insert(key.to_string(), handle) {
            previous.abort();
        }
    }

    /// (Re)arm the broadcast timer for a key.
    pub fn schedule_broadcast(
        &self,
        key: &str,
        task: impl std::future::Future<Output = ()> + Send + 'static,
    ) {
        self.arm(Lane::Broadcast, key, task);
    }

    /// (Re)arm the store-write timer for a key.
    pub fn schedule_store_write(
        &self,
        key: &str,
        task: impl std::future::Future<Output = ()> + Send + 'static,
    ) {
        self.arm(Lane::StoreWrite, key, task);
    }

    /// Cancel both timers for a key (completion is the final sync).
    pub fn cancel(&self, key: &str) {
        for timers in [&self.broadcast_timers, &self.store_timers] {
            let mut timers = timers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = timers.remove(key) {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_debounce_collapses_bursts() {
        let scheduler = SnapshotScheduler::new(Duration::from_millis(20), Duration::from_secs(5));
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let fired = fired.clone();
            scheduler.schedule_broadcast("msg_A", async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lanes_are_independent() {
        let scheduler =
            SnapshotScheduler::new(Duration::from_millis(10), Duration::from_millis(10));
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        scheduler.schedule_broadcast("msg_A", async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let f = fired.clone();
        scheduler.schedule_store_write("msg_A", async move {
            f.fetch_add(10, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_timers() {
        let scheduler =
            SnapshotScheduler::new(Duration::from_millis(30), Duration::from_millis(30));
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        scheduler.schedule_broadcast("msg_A", async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let f = fired.clone();
        scheduler.schedule_store_write("msg_A", async move {
            f.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.cancel("msg_A");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_keys_do_not_interfere() {
        let scheduler =
            SnapshotScheduler::new(Duration::from_millis(10), Duration::from_millis(10));
        let fired = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b", "c"] {
            let f = fired.clone();
            scheduler.schedule_broadcast(key, async move {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        scheduler.cancel("b");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
