//! `FingerprintStore`: the record-aware layer on top of the bare LSH index,
//! operating on `FingerprintRecord` rather than raw u64s.
//!
//! Defined as a trait so a future durable-backed store can stand in for
//! the in-memory one used here, as long as both honor these contracts.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::model::{CcSignal, FingerprintRecord};

use super::hasher::SimHasher;
use super::lsh::{LshIndex, Match};

#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn insert(&self, record: FingerprintRecord, content: &str);
    async fn remove(&self, id: Uuid);
    async fn query(&self, fingerprint: u64) -> Vec<Match>;
    async fn query_best(&self, fingerprint: u64) -> Option<Match>;
    async fn record(&self, id: Uuid) -> Option<FingerprintRecord>;

    /// Update a record's content, skipping the rehash when the edit is
    /// trivial — keeps frequent autosaves cheap without losing correctness.
    async fn update_from_content(&self, id: Uuid, new_content: &str);
}

struct Entry {
    record: FingerprintRecord,
    content: String,
    line_count: usize,
}

pub struct InMemoryFingerprintStore {
    index: LshIndex,
    hasher: SimHasher,
    entries: RwLock<HashMap<Uuid, Entry>>,
}

impl InMemoryFingerprintStore {
    pub fn new(bands: u32, hamming_threshold: u32) -> Self {
        Self {
            index: LshIndex::new(bands, hamming_threshold),
            hasher: SimHasher::default(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn line_count(content: &str) -> usize {
        content.lines().count()
    }
}

#[async_trait]
impl FingerprintStore for InMemoryFingerprintStore {
    async fn insert(&self, record: FingerprintRecord, content: &str) {
        let fingerprint = record.fingerprint;
        let id = record.id;
        let line_count = Self::line_count(content);
        self.entries.write().insert(
            id,
            Entry {
                record,
                content: content.to_string(),
                line_count,
            },
        );
        self.index.insert(id, fingerprint);
    }

    async fn remove(&self, id: Uuid) {
        self.entries.write().remove(&id);
        self.index.remove(id);
    }

    async fn query(&self, fingerprint: u64) -> Vec<Match> {
        self.index.query(fingerprint)
    }

    async fn query_best(&self, fingerprint: u64) -> Option<Match> {
        self.index.query_best(fingerprint)
    }

    async fn record(&self, id: Uuid) -> Option<FingerprintRecord> {
        self.entries.read().get(&id).map(|e| e.record.clone())
    }

    async fn update_from_content(&self, id: Uuid, new_content: &str) {
        let new_line_count = Self::line_count(new_content);

        let skip = {
            let entries = self.entries.read();
            match entries.get(&id) {
                Some(entry) => {
                    entry.content == new_content || entry.line_count == new_line_count
                }
                None => false,
            }
        };
        if skip {
            return;
        }

        let mut record = {
            let entries = self.entries.read();
            match entries.get(&id) {
                Some(entry) => entry.record.clone(),
                None => return,
            }
        };

        let new_fingerprint = self.hasher.fingerprint(new_content);
        record.fingerprint = new_fingerprint;
        record.content_length = new_content.len();

        self.index.remove(id);
        self.entries.write().insert(
            id,
            Entry {
                record: record.clone(),
                content: new_content.to_string(),
                line_count: new_line_count,
            },
        );
        self.index.insert(id, new_fingerprint);
    }
}

/// Only `no-ai` content of at least 200 chars is indexed. This is the
/// gate the ingestion path should apply before calling `insert`.
pub fn should_index(cc_signal: CcSignal, content_length: usize) -> bool {
    FingerprintRecord::should_index(cc_signal, content_length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CcSignal;

    fn record(id: Uuid, fingerprint: u64) -> FingerprintRecord {
        FingerprintRecord {
            id,
            fingerprint,
            work_id: Uuid::new_v4(),
            creator_id: Some(Uuid::new_v4()),
            cc_signal: CcSignal::NoAi,
            content_length: 200,
        }
    }

    #[tokio::test]
    async fn trivial_edit_skips_rehash() {
        let store = InMemoryFingerprintStore::new(4, 10);
        let id = Uuid::new_v4();
        let hasher = SimHasher::default();
        let content = "x".repeat(250);
        let fp = hasher.fingerprint(&content);
        store.insert(record(id, fp), &content).await;

        // Identical content: content_length differs in the record we pass,
        // but update_from_content should leave the fingerprint untouched.
        store.update_from_content(id, &content).await;
        let stored = store.record(id).await.unwrap();
        assert_eq!(stored.fingerprint, fp);
    }

    #[tokio::test]
    async fn unchanged_line_count_skips_rehash_even_with_different_chars() {
        let store = InMemoryFingerprintStore::new(4, 10);
        let id = Uuid::new_v4();
        let hasher = SimHasher::default();
        let content = "alpha beta gamma";
        let fp = hasher.fingerprint(content);
        store.insert(record(id, fp), content).await;

        // Same single-line shape, different words: line count (1) is
        // unchanged, so this should be treated as a trivial autosave edit.
        store.update_from_content(id, "alpha beta delta").await;
        let stored = store.record(id).await.unwrap();
        assert_eq!(stored.fingerprint, fp);
    }

    #[tokio::test]
    async fn line_count_change_triggers_reindex() {
        let store = InMemoryFingerprintStore::new(4, 10);
        let id = Uuid::new_v4();
        let hasher = SimHasher::default();
        let content = "alpha beta gamma";
        let fp = hasher.fingerprint(content);
        store.insert(record(id, fp), content).await;

        let new_content = "alpha beta gamma\nanother line entirely here";
        store.update_from_content(id, new_content).await;
        let stored = store.record(id).await.unwrap();
        assert_ne!(stored.fingerprint, fp);
        assert_eq!(stored.fingerprint, hasher.fingerprint(new_content));
    }
}
