use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::versioning::Versioned;

pub type TrialId = u64;
pub type SiteId = u64;
pub type ProtocolId = u64;

/// Clinical trial entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub name: String,
    pub phase: String,
    pub status: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Versioned for Trial {
    fn version(&self) -> u64 {
        self.version
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn advance_version(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        // Strictly increasing even when the clock stalls or steps backwards
        let floor = self.updated_at + chrono::Duration::microseconds(1);
        self.updated_at = if now > self.updated_at { now } else { floor };
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub name: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub id: ProtocolId,
    pub trial_id: TrialId,
    pub version: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Association between a trial and a site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialSite {
    pub trial_id: TrialId,
    pub site_id: SiteId,
    pub status: String,
}

/// Site as supplied by the caller of an onboarding run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInput {
    pub name: String,
    pub country: String,
}

impl SiteInput {
    pub fn new(name: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            country: country.into(),
        }
    }
}

/// Input shared by the blocking saga path and the durable workflow path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardTrialInput {
    pub name: String,
    pub phase: String,
    pub initial_protocol_version: String,
    pub sites: Vec<SiteInput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRegistration {
    pub trial_id: TrialId,
    pub site_id: SiteId,
    pub site_name: String,
    pub country: String,
    pub link_status: String,
}

/// Metadata update request; absent fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTrialMetadata {
    pub name: Option<String>,
    pub phase: Option<String>,
    pub expected_version: Option<u64>,
    pub expected_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTrialMetadataResponse {
    pub id: TrialId,
    pub name: String,
    pub phase: String,
    pub status: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub changes: String,
}

/// Row counts, used to verify that compensation left nothing behind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub trials: usize,
    pub protocols: usize,
    pub sites: usize,
    pub trial_sites: usize,
}
