//! Locality-sensitive hashing over 64-bit SimHash fingerprints.
//!
//! The fingerprint space is split into `B` equal bands; each record is
//! indexed by every one of its band values. A query only has to scan the
//! union of the buckets matching its own bands, then verify each candidate
//! by exact Hamming distance — sub-linear in the common case where most
//! records don't share a band with the query.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use uuid::Uuid;

use super::hasher::hamming_distance;

pub const DEFAULT_BANDS: u32 = 4;
pub const DEFAULT_HAMMING_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub id: Uuid,
    pub distance: u32,
}

struct Inner {
    bands: u32,
    bits_per_band: u32,
    threshold: u32,
    /// One hashmap per band: band value -> candidate ids.
    buckets: Vec<HashMap<u16, HashSet<Uuid>>>,
    /// id -> fingerprint, so `remove` and `query` verification don't need
    /// the caller to carry the fingerprint around.
    fingerprints: HashMap<Uuid, u64>,
}

impl Inner {
    fn band_value(&self, fingerprint: u64, band: u32) -> u16 {
        let shift = band * self.bits_per_band;
        ((fingerprint >> shift) & ((1u64 << self.bits_per_band) - 1)) as u16
    }
}

/// Concurrent LSH index: inserts/removes take the write lock, queries take
/// the read lock.
pub struct LshIndex {
    inner: RwLock<Inner>,
}

impl LshIndex {
    pub fn new(bands: u32, threshold: u32) -> Self {
        assert!((4..=8).contains(&bands), "LSH bands must be in [4, 8]");
        let bits_per_band = 64 / bands;
        Self {
            inner: RwLock::new(Inner {
                bands,
                bits_per_band,
                threshold,
                buckets: (0..bands).map(|_| HashMap::new()).collect(),
                fingerprints: HashMap::new(),
            }),
        }
    }

    /// Insert (or re-insert) a fingerprint under `id`. O(B).
    pub fn insert(&self, id: Uuid, fingerprint: u64) {
        let mut inner = self.inner.write();
        for band in 0..inner.bands {
            let value = inner.band_value(fingerprint, band);
            inner.buckets[band as usize]
                .entry(value)
                .or_default()
                .insert(id);
        }
        inner.fingerprints.insert(id, fingerprint);
    }

    /// Remove `id` from every band bucket. O(B). Idempotent.
    pub fn remove(&self, id: Uuid) {
        let mut inner = self.inner.write();
        let Some(fingerprint) = inner.fingerprints.remove(&id) else {
            return;
        };
        for band in 0..inner.bands {
            let value = inner.band_value(fingerprint, band);
            if let Some(bucket) = inner.buckets[band as usize].get_mut(&value) {
                bucket.remove(&id);
                if bucket.is_empty() {
                    inner.buckets[band as usize].remove(&value);
                }
            }
        }
    }

    /// All indexed matches within the configured Hamming threshold,
    /// nearest first.
    pub fn query(&self, fingerprint: u64) -> Vec<Match> {
        let inner = self.inner.read();
        let mut candidates: HashSet<Uuid> = HashSet::new();
        for band in 0..inner.bands {
            let value = inner.band_value(fingerprint, band);
            if let Some(bucket) = inner.buckets[band as usize].get(&value) {
                candidates.extend(bucket.iter().copied());
            }
        }

        let mut matches: Vec<Match> = candidates
            .into_iter()
            .filter_map(|id| {
                let candidate_fp = *inner.fingerprints.get(&id)?;
                let distance = hamming_distance(fingerprint, candidate_fp);
                (distance <= inner.threshold).then_some(Match { id, distance })
            })
            .collect();
        matches.sort_by_key(|m| m.distance);
        matches
    }

    /// argmin over `query`.
    pub fn query_best(&self, fingerprint: u64) -> Option<Match> {
        self.query(fingerprint).into_iter().next()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.read().fingerprints.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
