// Terminal vs transient classification for retry decisions
// The only retry policy owned here is the decision; scheduling belongs to the runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::OnboardingError;

/// Whether re-invoking the same operation can possibly succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Do not retry: the same input fails the same way
    Terminal,
    /// Safe to retry from the last memoized point
    Transient,
}

/// An error tagged with its retry class.
///
/// Workflow code returns `Result<T, Classified<E>>` so the retry decision is
/// a match on a value instead of a type test on a caught exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified<E> {
    Terminal(E),
    Transient(E),
}

impl<E> Classified<E> {
    pub fn class(&self) -> ErrorClass {
        match self {
            Classified::Terminal(_) => ErrorClass::Terminal,
            Classified::Transient(_) => ErrorClass::Transient,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Classified::Terminal(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Classified::Transient(_))
    }

    pub fn inner(&self) -> &E {
        match self {
            Classified::Terminal(e) | Classified::Transient(e) => e,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            Classified::Terminal(e) | Classified::Transient(e) => e,
        }
    }
}

impl<E: fmt::Display> fmt::Display for Classified<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classified::Terminal(e) => write!(f, "terminal: {e}"),
            Classified::Transient(e) => write!(f, "transient: {e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Classified<E> {}

impl From<OnboardingError> for Classified<OnboardingError> {
    fn from(error: OnboardingError) -> Self {
        match classify(&error) {
            ErrorClass::Terminal => Classified::Terminal(error),
            ErrorClass::Transient => Classified::Transient(error),
        }
    }
}

/// Classify a failure. Total and deterministic; unknown failures fail closed.
pub fn classify(error: &OnboardingError) -> ErrorClass {
    match error {
        // Domain failures: retrying with the same input fails identically
        OnboardingError::Validation(_)
        | OnboardingError::NotFound { .. }
        | OnboardingError::DuplicateLink { .. }
        | OnboardingError::StaleData(_) => ErrorClass::Terminal,

        OnboardingError::External { status, .. } => classify_status(*status),

        OnboardingError::Network(_) | OnboardingError::Transient(_) => ErrorClass::Transient,

        // Avoids retry loops on bugs we did not foresee
        OnboardingError::Unexpected(_) => ErrorClass::Terminal,
    }
}

/// Classify an external call's HTTP-equivalent status code.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        400 | 401 | 403 | 404 | 422 => ErrorClass::Terminal,
        408 | 429 => ErrorClass::Transient,
        500..=599 => ErrorClass::Transient,
        400..=499 => ErrorClass::Terminal,
        // A "failure" outside the error ranges is not something we understand
        _ => ErrorClass::Terminal,
    }
}

/// Convenience for `?`-style propagation into classified results.
pub trait ClassifyExt<T> {
    fn classified(self) -> Result<T, Classified<OnboardingError>>;
}

impl<T> ClassifyExt<T> for Result<T, OnboardingError> {
    fn classified(self) -> Result<T, Classified<OnboardingError>> {
        self.map_err(Classified::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn external(status: u16) -> OnboardingError {
        OnboardingError::External {
            status,
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_domain_errors_are_terminal() {
        assert_eq!(classify(&OnboardingError::validation("bad phase")), ErrorClass::Terminal);
        assert_eq!(classify(&OnboardingError::not_found("Trial", 1)), ErrorClass::Terminal);
        assert_eq!(
            classify(&OnboardingError::DuplicateLink { trial_id: 1, site_id: 2 }),
            ErrorClass::Terminal
        );
        assert_eq!(classify(&OnboardingError::StaleData("old".into())), ErrorClass::Terminal);
    }

    #[test]
    fn test_status_codes() {
        for status in [400, 401, 403, 404, 422, 409, 418] {
            assert_eq!(classify(&external(status)), ErrorClass::Terminal, "status {status}");
        }
        for status in [408, 429, 500, 502, 503, 504] {
            assert_eq!(classify(&external(status)), ErrorClass::Transient, "status {status}");
        }
    }

    #[test]
    fn test_network_is_transient_and_unknown_fails_closed() {
        assert_eq!(classify(&OnboardingError::Network("connection refused".into())), ErrorClass::Transient);
        assert_eq!(classify(&OnboardingError::unexpected("who knows")), ErrorClass::Terminal);
        assert_eq!(classify_status(302), ErrorClass::Terminal);
    }

    #[test]
    fn test_classified_wraps_by_class() {
        let classified: Classified<OnboardingError> = external(503).into();
        assert!(classified.is_transient());
        assert_eq!(classified.inner().kind(), "external");

        let classified: Result<(), _> = Err(OnboardingError::StaleData("v1".into())).classified();
        assert!(classified.unwrap_err().is_terminal());
    }
}
