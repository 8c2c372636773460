//! `ContentValidator`: the out-of-core collaborator boundary for ownership
//! and public-content checks. Failures are recoverable — the detector
//! falls through to the next check.

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::CcSignal;

#[derive(Debug, Clone)]
pub struct OwnershipResult {
    pub found: bool,
    pub owner_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct PublicContentResult {
    pub found: bool,
    pub is_public: bool,
    pub cc_signal: Option<CcSignal>,
}

#[async_trait]
pub trait ContentValidator: Send + Sync {
    async fn validate_ownership(&self, user_id: Uuid, code: &str) -> anyhow::Result<OwnershipResult>;
    async fn validate_public_content(&self, code: &str) -> anyhow::Result<PublicContentResult>;
}

/// A validator that never finds anything — used when no content validator
/// is configured, so the detector degrades straight to the similarity and
/// default checks, skipping ownership and public-content checks gracefully.
pub struct NullValidator;

#[async_trait]
impl ContentValidator for NullValidator {
    async fn validate_ownership(&self, _user_id: Uuid, _code: &str) -> anyhow::Result<OwnershipResult> {
        Ok(OwnershipResult {
            found: false,
            owner_id: None,
        })
    }

    async fn validate_public_content(&self, _code: &str) -> anyhow::Result<PublicContentResult> {
        Ok(PublicContentResult {
            found: false,
            is_public: false,
            cc_signal: None,
        })
    }
}
