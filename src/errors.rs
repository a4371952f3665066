// Error taxonomy for onboarding orchestration
// Domain failures are terminal, infrastructure failures are transient.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure a forward step, compensation or serialized handler can raise.
///
/// Variants are plain data so results and failures can cross task
/// boundaries and be written into progress events verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum OnboardingError {
    /// Bad input or business-rule violation
    #[error("{0}")]
    Validation(String),

    /// Referenced entity absent
    #[error("{entity} with id {id} not found")]
    NotFound { entity: String, id: String },

    /// Uniqueness violation on a trial/site relationship
    #[error("Site {site_id} is already linked to trial {trial_id}")]
    DuplicateLink { trial_id: u64, site_id: u64 },

    /// Optimistic-concurrency conflict
    #[error("{0}")]
    StaleData(String),

    /// Server-side or infrastructure failure that may clear up on retry
    #[error("Transient failure: {0}")]
    Transient(String),

    /// External call answered with a non-success status
    #[error("HTTP {status}: {message}")]
    External { status: u16, message: String },

    /// External call never produced a response
    #[error("Network error: {0}")]
    Network(String),

    /// Anything we did not anticipate
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl OnboardingError {
    pub fn validation(message: impl Into<String>) -> Self {
        OnboardingError::Validation(message.into())
    }

    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        OnboardingError::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        OnboardingError::Unexpected(message.into())
    }

    /// Short machine-friendly name of the variant, used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            OnboardingError::Validation(_) => "validation",
            OnboardingError::NotFound { .. } => "not_found",
            OnboardingError::DuplicateLink { .. } => "duplicate_link",
            OnboardingError::StaleData(_) => "stale_data",
            OnboardingError::Transient(_) => "transient",
            OnboardingError::External { .. } => "external",
            OnboardingError::Network(_) => "network",
            OnboardingError::Unexpected(_) => "unexpected",
        }
    }
}

impl From<serde_json::Error> for OnboardingError {
    fn from(err: serde_json::Error) -> Self {
        OnboardingError::Unexpected(format!("serialization failed: {err}"))
    }
}

/// Failures of the journal persistence layer
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Journal corruption detected for workflow {workflow_id}: {reason}")]
    Corruption { workflow_id: String, reason: String },

    #[error("Journal backend error: {0}")]
    Backend(String),
}

impl From<JournalError> for OnboardingError {
    fn from(err: JournalError) -> Self {
        match err {
            // Storage hiccups are worth another invocation; a corrupt journal is not.
            JournalError::IoError(e) => OnboardingError::Transient(format!("journal I/O failed: {e}")),
            JournalError::Backend(msg) => OnboardingError::Transient(msg),
            other => OnboardingError::Unexpected(other.to_string()),
        }
    }
}
