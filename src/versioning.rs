// Optimistic concurrency for versioned records
//
// Serialization prevents two writers from interleaving; the version check
// prevents a slow client from overwriting state it never saw. Both are needed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::OnboardingError;

/// A mutable record with a monotonically advancing version marker.
pub trait Versioned {
    fn version(&self) -> u64;

    fn updated_at(&self) -> DateTime<Utc>;

    /// Advance both markers. Must be called on every successful mutation.
    fn advance_version(&mut self, now: DateTime<Utc>);
}

/// What the caller believes the record looked like when it read it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectation {
    pub version: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Expectation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn version(version: u64) -> Self {
        Self {
            version: Some(version),
            updated_at: None,
        }
    }

    pub fn updated_at(updated_at: DateTime<Utc>) -> Self {
        Self {
            version: None,
            updated_at: Some(updated_at),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.version.is_none() && self.updated_at.is_none()
    }
}

/// Reject the request if a supplied marker differs from the stored one.
///
/// Runs before any mutation so a stale request has no side effects.
pub fn check_expectation<V: Versioned>(
    entity_name: &str,
    current: &V,
    expected: &Expectation,
) -> Result<(), OnboardingError> {
    if let Some(expected_version) = expected.version {
        if current.version() != expected_version {
            return Err(OnboardingError::StaleData(format!(
                "{entity_name} version mismatch: expected {expected_version}, current is {}. \
                 Please refresh and try again.",
                current.version()
            )));
        }
    }

    if let Some(expected_updated_at) = expected.updated_at {
        if current.updated_at() != expected_updated_at {
            return Err(OnboardingError::StaleData(format!(
                "{entity_name} was modified at {}, expected {}. Please refresh and try again.",
                current.updated_at().to_rfc3339(),
                expected_updated_at.to_rfc3339()
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Counter {
        version: u64,
        updated_at: DateTime<Utc>,
    }

    impl Versioned for Counter {
        fn version(&self) -> u64 {
            self.version
        }

        fn updated_at(&self) -> DateTime<Utc> {
            self.updated_at
        }

        fn advance_version(&mut self, now: DateTime<Utc>) {
            self.version += 1;
            self.updated_at = now;
        }
    }

    #[test]
    fn test_matching_version_passes() {
        let counter = Counter { version: 3, updated_at: Utc::now() };
        assert!(check_expectation("Counter", &counter, &Expectation::version(3)).is_ok());
        assert!(check_expectation("Counter", &counter, &Expectation::none()).is_ok());
    }

    #[test]
    fn test_stale_version_rejected() {
        let mut counter = Counter { version: 1, updated_at: Utc::now() };
        counter.advance_version(Utc::now());

        let err = check_expectation("Counter", &counter, &Expectation::version(1)).unwrap_err();
        assert!(matches!(err, OnboardingError::StaleData(_)));
        assert!(err.to_string().contains("expected 1, current is 2"));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let read_at = Utc::now();
        let counter = Counter {
            version: 1,
            updated_at: read_at + chrono::Duration::seconds(5),
        };
        let err = check_expectation("Counter", &counter, &Expectation::updated_at(read_at)).unwrap_err();
        assert!(matches!(err, OnboardingError::StaleData(_)));
    }
}
