//! Error taxonomy surfaced by the pod reconciler and stream router.

use thiserror::Error;

use crate::backend::BackendError;
use crate::pod::PodKey;

/// Errors returned by provider operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Spec does not fit this node. Permanent; the control plane should
    /// schedule the pod elsewhere.
    #[error("pod {pod} rejected: {reason}")]
    AdmissionRejected { pod: PodKey, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    /// Transient. Retried with backoff by the reconciler.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Teardown was never confirmed; the record is kept with a warning condition.
    #[error("teardown of {pod} not confirmed after {attempts} attempts")]
    OrphanTimeout { pod: PodKey, attempts: u32 },

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        ProviderError::NotFound(what.to_string())
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::BackendUnavailable(_) | ProviderError::QuotaExceeded(_)
        )
    }
}

impl From<BackendError> for ProviderError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) => ProviderError::BackendUnavailable(msg),
            BackendError::QuotaExceeded(msg) => ProviderError::QuotaExceeded(msg),
            BackendError::NotFound(what) => ProviderError::NotFound(what),
            BackendError::Unsupported(op) => ProviderError::Unsupported(op),
        }
    }
}
