use crate::domain::NormalizeError;
use crate::infrastructure::store::StoreError;
use crate::infrastructure::upstream::UpstreamError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Normalization failed: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("Tenant not found: {0}")]
    TenantNotFound(String),
    #[error("Tenant is inactive: {0}")]
    TenantInactive(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Normalize(NormalizeError::InvalidPayload(e))
    }
}
