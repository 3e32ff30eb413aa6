//! In-memory part staging.
//!
//! Parts stream in out of order and in duplicate; this module is the
//! authoritative staging buffer between the SSE firehose and the store.
//! Three structures cooperate:
//!
//! - [`PartCache`]: `engine message id → part id → part`, deduplicating
//!   upserts (an identical payload must not trigger downstream snapshots).
//! - [`CompletedSet`]: engine message ids whose final flush already
//!   happened — late arrivals for them take the catch-up path.
//! - [`KeyedMutexes`]: lazily-built per-key async mutexes serializing all
//!   cache mutation, snapshotting, and completion per engine message id
//!   (and, separately, multi-field chat updates per chat id).

use crate::store::types::{Part, PartKind};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Lazily-populated map of per-key mutexes.
#[derive(Default)]
pub struct KeyedMutexes {
    inner: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedMutexes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (or create) the mutex for a key. Lock it outside this call.
    pub fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entry(key.to_string()).or_default().clone()
    }

    /// Drop a key's mutex (garbage collection after completion).
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(key);
    }
}

/// Result of a cache upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New or changed payload; `first_for_message` is true when this is the
    /// first part seen for the engine message.
    Inserted { first_for_message: bool },
    /// Byte-identical to the cached payload; no downstream work.
    Unchanged,
}

/// Two-level concurrent part buffer.
#[derive(Default)]
pub struct PartCache {
    inner: RwLock<HashMap<String, HashMap<String, Part>>>,
}

impl PartCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize an incoming part: engine text parts sometimes carry their
    /// payload under `content` instead of `text`.
    pub fn normalize(part: &mut Part) {
        if part.kind == PartKind::Text
            && part.text.as_deref().unwrap_or("").is_empty()
            && !part.content.as_deref().unwrap_or("").is_empty()
        {
            part.text = part.content.clone();
        }
    }

    /// Upsert a (normalized) part, deduplicating identical payloads.
    pub async fn upsert(&self, engine_message_id: &str, mut part: Part) -> UpsertOutcome {
        Self::normalize(&mut part);
        let mut inner = self.inner.write().await;
        let first_for_message = !inner.contains_key(engine_message_id);
        let parts = inner.entry(engine_message_id.to_string()).or_default();

        if let Some(existing) = parts.get(&part.id) {
            if *existing == part {
                return UpsertOutcome::Unchanged;
            }
        }
        parts.insert(part.id.clone(), part);
        UpsertOutcome::Inserted { first_for_message }
    }

    /// Append a streaming delta to a text part, creating a stub when the
    /// full part has not arrived yet.
    pub async fn append_delta(&self, engine_message_id: &str, part_id: &str, delta: &str) {
        let mut inner = self.inner.write().await;
        let parts = inner.entry(engine_message_id.to_string()).or_default();
        let part = parts.entry(part_id.to_string()).or_insert_with(|| Part {
            id: part_id.to_string(),
            kind: PartKind::Text,
            text: Some(String::new()),
            ..Default::default()
        });
        let mut text = part.text.take().unwrap_or_default();
        text.push_str(delta);
        part.text = Some(text);
    }

    /// Sorted snapshot of everything buffered for a message.
    pub async fn snapshot(&self, engine_message_id: &str) -> Vec<Part> {
        let inner = self.inner.read().await;
        let mut parts: Vec<Part> = inner
            .get(engine_message_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        parts.sort_by(|a, b| a.id.cmp(&b.id));
        parts
    }

    /// Remove and return everything buffered for a message (final flush).
    pub async fn take(&self, engine_message_id: &str) -> Vec<Part> {
        let mut inner = self.inner.write().await;
        let mut parts: Vec<Part> = inner
            .remove(engine_message_id)
            .map(|m| m.into_values().collect())
            .unwrap_or_default();
        parts.sort_by(|a, b| a.id.cmp(&b.id));
        parts
    }

    pub async fn remove(&self, engine_message_id: &str) {
        self.inner.write().await.remove(engine_message_id);
    }

    pub async fn is_empty(&self, engine_message_id: &str) -> bool {
        self.inner
            .read()
            .await
            .get(engine_message_id)
            .map(|m| m.is_empty())
            .unwrap_or(true)
    }
}

/// Engine message ids whose final flush already happened.
#[derive(Default)]
pub struct CompletedSet {
    inner: RwLock<HashSet<String>>,
}

impl CompletedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, engine_message_id: &str) -> bool {
        self.inner.read().await.contains(engine_message_id)
    }

    pub async fn insert(&self, engine_message_id: &str) {
        self.inner
            .write()
            .await
            .insert(engine_message_id.to_string());
    }

    pub async fn remove(&self, engine_message_id: &str) {
        self.inner.write().await.remove(engine_message_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_part(id: &str, text: &str) -> Part {
        Part::text(id, text)
    }

    #[tokio::test]
    async fn test_upsert_dedupes_identical_payloads() {
        let cache = PartCache::new();
        let first = cache.upsert("msg_A", text_part("p1", "hello")).await;
        assert_eq!(
            first,
            UpsertOutcome::Inserted {
                first_for_message: true
            }
        );

        let dup = cache.upsert("msg_A", text_part("p1", "hello")).await;
        assert_eq!(dup, UpsertOutcome::Unchanged);

        let changed = cache.upsert("msg_A", text_part("p1", "hello world")).await;
        assert_eq!(
            changed,
            UpsertOutcome::Inserted {
                first_for_message: false
            }
        );
    }

    #[tokio::test]
    async fn test_snapshot_sorted_lexicographically() {
        let cache = PartCache::new();
        for id in ["prt_tool2", "prt_text1", "prt_tool1", "prt_text3", "prt_text2"] {
            cache.upsert("msg_A", text_part(id, "x")).await;
        }
        let snapshot = cache.snapshot("msg_A").await;
        let ids: Vec<&str> = snapshot.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["prt_text1", "prt_text2", "prt_text3", "prt_tool1", "prt_tool2"]
        );
    }

    #[tokio::test]
    async fn test_last_value_wins_per_part_id() {
        let cache = PartCache::new();
        cache.upsert("msg_A", text_part("p1", "first")).await;
        cache.upsert("msg_A", text_part("p1", "second")).await;
        let snapshot = cache.snapshot("msg_A").await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].text.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_normalization_copies_content_into_text() {
        let cache = PartCache::new();
        let part = Part {
            id: "p1".to_string(),
            kind: PartKind::Text,
            content: Some("from content".to_string()),
            ..Default::default()
        };
        cache.upsert("msg_A", part).await;
        let snapshot = cache.snapshot("msg_A").await;
        assert_eq!(snapshot[0].text.as_deref(), Some("from content"));
    }

    #[tokio::test]
    async fn test_normalized_duplicate_is_unchanged() {
        let cache = PartCache::new();
        let with_content = Part {
            id: "p1".to_string(),
            kind: PartKind::Text,
            text: Some("same".to_string()),
            content: Some("same".to_string()),
            ..Default::default()
        };
        cache.upsert("msg_A", with_content.clone()).await;
        assert_eq!(
            cache.upsert("msg_A", with_content).await,
            UpsertOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn test_append_delta_builds_stub() {
        let cache = PartCache::new();
        cache.append_delta("msg_A", "p1", "hel").await;
        cache.append_delta("msg_A", "p1", "lo").await;
        let snapshot = cache.snapshot("msg_A").await;
        assert_eq!(snapshot[0].text.as_deref(), Some("hello"));
        assert_eq!(snapshot[0].kind, PartKind::Text);
    }

    #[tokio::test]
    async fn test_take_drains_message() {
        let cache = PartCache::new();
        cache.upsert("msg_A", text_part("p1", "x")).await;
        let taken = cache.take("msg_A").await;
        assert_eq!(taken.len(), 1);
        assert!(cache.is_empty("msg_A").await);
    }

    #[tokio::test]
    async fn test_keyed_mutexes_same_instance_per_key() {
        let mutexes = KeyedMutexes::new();
        let a = mutexes.entry("k");
        let b = mutexes.entry("k");
        assert!(Arc::ptr_eq(&a, &b));

        mutexes.remove("k");
        let c = mutexes.entry("k");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_completed_set() {
        let set = CompletedSet::new();
        assert!(!set.contains("m").await);
        set.insert("m").await;
        assert!(set.contains("m").await);
        set.remove("m").await;
        assert!(!set.contains("m").await);
    }
}
