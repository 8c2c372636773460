//! CC-Signals detector: decides whether a code delta should engage the
//! paste lock, and when edits have earned an unlock.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::lock::{LockStore, LOCK_TTL_SECS};
use crate::model::{allows_ai_permissive_default, allows_ai_restrictive_default};
use crate::simhash::{FingerprintStore, SimHasher};

use super::levenshtein::normalized_distance;
use super::validator::ContentValidator;

/// Large-delta paste threshold, in chars.
pub const PASTE_DELTA_THRESHOLD: i64 = 200;
/// Large-delta paste threshold, in added newlines.
pub const PASTE_LINE_THRESHOLD: i64 = 50;
/// Normalized-distance threshold past which an edit counts as "enough
/// editing happened" to release the lock.
pub const UNLOCK_THRESHOLD: f64 = 0.30;

#[derive(Debug, Clone, Default)]
pub struct DetectionResult {
    pub should_lock: bool,
    pub reason: String,
    /// Matched a user's own existing work (ownership check).
    pub matched: Option<Uuid>,
    /// Matched via LSH similarity, carrying the matched fingerprint id.
    pub fingerprint_match: Option<Uuid>,
}

impl DetectionResult {
    fn unlocked(reason: &str) -> Self {
        Self {
            should_lock: false,
            reason: reason.to_string(),
            ..Default::default()
        }
    }

    fn locked(reason: &str) -> Self {
        Self {
            should_lock: true,
            reason: reason.to_string(),
            ..Default::default()
        }
    }
}

pub struct Detector {
    /// `None` is a caller bug — surfaced as a distinct error rather than a
    /// panic.
    lock_store: Option<Arc<dyn LockStore>>,
    fingerprint_store: Option<Arc<dyn FingerprintStore>>,
    validator: Option<Arc<dyn ContentValidator>>,
    hasher: SimHasher,
}

impl Detector {
    pub fn new(
        lock_store: Arc<dyn LockStore>,
        fingerprint_store: Option<Arc<dyn FingerprintStore>>,
        validator: Option<Arc<dyn ContentValidator>>,
    ) -> Self {
        Self {
            lock_store: Some(lock_store),
            fingerprint_store,
            validator,
            hasher: SimHasher::default(),
        }
    }

    /// Construct a detector with no lock store configured, to exercise the
    /// "nil lock store is a caller bug" failure path in tests.
    #[cfg(test)]
    pub fn without_lock_store(
        fingerprint_store: Option<Arc<dyn FingerprintStore>>,
        validator: Option<Arc<dyn ContentValidator>>,
    ) -> Self {
        Self {
            lock_store: None,
            fingerprint_store,
            validator,
            hasher: SimHasher::default(),
        }
    }

    fn lock_store(&self) -> CoreResult<&Arc<dyn LockStore>> {
        self.lock_store
            .as_ref()
            .ok_or_else(|| CoreError::Server("lock store not configured".to_string()))
    }

    /// The five-step short-circuit algorithm.
    pub async fn detect_paste(
        &self,
        user_id: Option<Uuid>,
        previous_code: &str,
        new_code: &str,
    ) -> DetectionResult {
        // Step 1: large-delta test.
        let char_delta = new_code.chars().count() as i64 - previous_code.chars().count() as i64;
        let added_newlines =
            new_code.matches('\n').count() as i64 - previous_code.matches('\n').count() as i64;
        if char_delta < PASTE_DELTA_THRESHOLD && added_newlines < PASTE_LINE_THRESHOLD {
            return DetectionResult::unlocked("no_large_delta");
        }

        // Step 2: ownership check.
        if let (Some(user_id), Some(validator)) = (user_id, &self.validator) {
            match validator.validate_ownership(user_id, new_code).await {
                Ok(result) if result.found => {
                    return DetectionResult {
                        should_lock: false,
                        reason: "own_work".to_string(),
                        matched: result.owner_id,
                        fingerprint_match: None,
                    };
                }
                Ok(_) => {}
                Err(_) => {
                    // Validator failures are non-fatal; proceed to the next check.
                }
            }
        }

        // Step 3: public exact-match check.
        if let Some(validator) = &self.validator {
            match validator.validate_public_content(new_code).await {
                Ok(result) if result.found => {
                    return if allows_ai_restrictive_default(result.cc_signal) {
                        DetectionResult::unlocked("public_ai_permissive_match")
                    } else {
                        DetectionResult::locked("public_no_ai_match")
                    };
                }
                Ok(_) => {}
                Err(_) => {}
            }
        }

        // Step 4: similarity check.
        if let Some(store) = &self.fingerprint_store {
            let fingerprint = self.hasher.fingerprint(new_code);
            if let Some(best) = store.query_best(fingerprint).await {
                if let Some(record) = store.record(best.id).await {
                    return if allows_ai_permissive_default(Some(record.cc_signal)) {
                        DetectionResult {
                            should_lock: false,
                            reason: "similarity_ai_permissive_match".to_string(),
                            matched: None,
                            fingerprint_match: Some(best.id),
                        }
                    } else {
                        DetectionResult {
                            should_lock: true,
                            reason: "similarity_no_ai_match".to_string(),
                            matched: None,
                            fingerprint_match: Some(best.id),
                        }
                    };
                }
            }
        }

        // Step 5: default.
        DetectionResult::locked("external paste")
    }

    /// Runs `detect_paste` and applies its result: engage a new lock (only
    /// if not already locked, to preserve the original baseline), or check
    /// whether the current edit has earned an unlock.
    pub async fn process_code_update(
        &self,
        session_id: Uuid,
        user_id: Option<Uuid>,
        previous_code: &str,
        new_code: &str,
    ) -> CoreResult<DetectionResult> {
        let lock_store = self.lock_store()?;
        let result = self.detect_paste(user_id, previous_code, new_code).await;

        if result.should_lock {
            if lock_store.get_lock(session_id).await?.is_none() {
                lock_store
                    .set_lock(session_id, new_code.to_string(), LOCK_TTL_SECS)
                    .await?;
            }
        } else {
            self.check_unlock(session_id, new_code).await?;
        }

        Ok(result)
    }

    /// Current lock state for a session, for callers that need to report
    /// it without running a full detection pass (e.g. on client register).
    pub async fn lock_status(&self, session_id: Uuid) -> CoreResult<Option<crate::model::PasteLock>> {
        self.lock_store()?.get_lock(session_id).await
    }

    /// Compares `current` against the stored baseline; releases the lock
    /// on a significant edit, otherwise refreshes its TTL.
    pub async fn check_unlock(&self, session_id: Uuid, current: &str) -> CoreResult<()> {
        let lock_store = self.lock_store()?;
        let Some(lock) = lock_store.get_lock(session_id).await? else {
            return Ok(());
        };

        let distance = normalized_distance(&lock.baseline_code, current);
        if distance >= UNLOCK_THRESHOLD {
            lock_store.remove_lock(session_id).await?;
        } else {
            lock_store.refresh_ttl(session_id, LOCK_TTL_SECS).await?;
        }
        Ok(())
    }
}
