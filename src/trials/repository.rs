// Storage boundary for trial payload records
//
// The orchestration core only needs narrow reads and writes. The in-memory
// store below enforces the same foreign keys as the relational schema, so a
// compensation that deletes a parent before its children fails loudly.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::errors::OnboardingError;
use crate::trials::types::{
    ProtocolId, ProtocolVersion, Site, SiteId, StoreCounts, Trial, TrialId, TrialSite,
};

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TrialRepository: Send + Sync {
    /// Insert a new trial with status `draft` and version 1
    async fn insert_trial(&self, name: &str, phase: &str) -> Result<Trial, OnboardingError>;

    async fn get_trial(&self, id: TrialId) -> Result<Option<Trial>, OnboardingError>;

    /// Overwrite an existing trial row
    async fn save_trial(&self, trial: &Trial) -> Result<(), OnboardingError>;

    /// Hard delete. Fails while protocol versions or site links still reference the trial.
    async fn delete_trial(&self, id: TrialId) -> Result<bool, OnboardingError>;

    async fn insert_protocol(
        &self,
        trial_id: TrialId,
        version: &str,
        notes: Option<String>,
    ) -> Result<ProtocolVersion, OnboardingError>;

    async fn delete_protocol(&self, id: ProtocolId) -> Result<bool, OnboardingError>;

    /// Find a site by name and country, creating it when absent
    async fn upsert_site(&self, name: &str, country: &str) -> Result<Site, OnboardingError>;

    async fn link_site(&self, trial_id: TrialId, site_id: SiteId) -> Result<TrialSite, OnboardingError>;

    async fn unlink_site(&self, trial_id: TrialId, site_id: SiteId) -> Result<bool, OnboardingError>;

    async fn counts(&self) -> Result<StoreCounts, OnboardingError>;
}

#[derive(Debug, Default)]
struct Tables {
    next_trial_id: TrialId,
    next_protocol_id: ProtocolId,
    next_site_id: SiteId,
    trials: BTreeMap<TrialId, Trial>,
    protocols: BTreeMap<ProtocolId, ProtocolVersion>,
    sites: BTreeMap<SiteId, Site>,
    trial_sites: BTreeMap<(TrialId, SiteId), TrialSite>,
}

/// Process-local store with relational semantics
#[derive(Debug, Default)]
pub struct InMemoryTrialStore {
    tables: Mutex<Tables>,
}

impl InMemoryTrialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn protocols_for(&self, trial_id: TrialId) -> Vec<ProtocolVersion> {
        self.tables()
            .protocols
            .values()
            .filter(|p| p.trial_id == trial_id)
            .cloned()
            .collect()
    }

    pub fn sites_for(&self, trial_id: TrialId) -> Vec<TrialSite> {
        self.tables()
            .trial_sites
            .values()
            .filter(|link| link.trial_id == trial_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TrialRepository for InMemoryTrialStore {
    async fn insert_trial(&self, name: &str, phase: &str) -> Result<Trial, OnboardingError> {
        let mut tables = self.tables();
        tables.next_trial_id += 1;
        let now = Utc::now();
        let trial = Trial {
            id: tables.next_trial_id,
            name: name.to_string(),
            phase: phase.to_string(),
            status: "draft".to_string(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        tables.trials.insert(trial.id, trial.clone());
        debug!(trial_id = trial.id, "Inserted trial");
        Ok(trial)
    }

    async fn get_trial(&self, id: TrialId) -> Result<Option<Trial>, OnboardingError> {
        Ok(self.tables().trials.get(&id).cloned())
    }

    async fn save_trial(&self, trial: &Trial) -> Result<(), OnboardingError> {
        let mut tables = self.tables();
        match tables.trials.get_mut(&trial.id) {
            Some(existing) => {
                *existing = trial.clone();
                Ok(())
            }
            None => Err(OnboardingError::not_found("Trial", trial.id)),
        }
    }

    async fn delete_trial(&self, id: TrialId) -> Result<bool, OnboardingError> {
        let mut tables = self.tables();
        let dependent_protocols = tables.protocols.values().filter(|p| p.trial_id == id).count();
        let dependent_links = tables.trial_sites.keys().filter(|(t, _)| *t == id).count();
        if dependent_protocols > 0 || dependent_links > 0 {
            return Err(OnboardingError::unexpected(format!(
                "foreign key violation: trial {id} still referenced by {dependent_protocols} protocol \
                 version(s) and {dependent_links} site link(s)"
            )));
        }
        Ok(tables.trials.remove(&id).is_some())
    }

    async fn insert_protocol(
        &self,
        trial_id: TrialId,
        version: &str,
        notes: Option<String>,
    ) -> Result<ProtocolVersion, OnboardingError> {
        let mut tables = self.tables();
        if !tables.trials.contains_key(&trial_id) {
            return Err(OnboardingError::not_found("Trial", trial_id));
        }
        tables.next_protocol_id += 1;
        let protocol = ProtocolVersion {
            id: tables.next_protocol_id,
            trial_id,
            version: version.to_string(),
            notes,
            created_at: Utc::now(),
        };
        tables.protocols.insert(protocol.id, protocol.clone());
        Ok(protocol)
    }

    async fn delete_protocol(&self, id: ProtocolId) -> Result<bool, OnboardingError> {
        Ok(self.tables().protocols.remove(&id).is_some())
    }

    async fn upsert_site(&self, name: &str, country: &str) -> Result<Site, OnboardingError> {
        let mut tables = self.tables();
        if let Some(site) = tables
            .sites
            .values()
            .find(|s| s.name == name && s.country == country)
        {
            return Ok(site.clone());
        }
        tables.next_site_id += 1;
        let site = Site {
            id: tables.next_site_id,
            name: name.to_string(),
            country: country.to_string(),
        };
        tables.sites.insert(site.id, site.clone());
        Ok(site)
    }

    async fn link_site(&self, trial_id: TrialId, site_id: SiteId) -> Result<TrialSite, OnboardingError> {
        let mut tables = self.tables();
        if !tables.trials.contains_key(&trial_id) {
            return Err(OnboardingError::not_found("Trial", trial_id));
        }
        if !tables.sites.contains_key(&site_id) {
            return Err(OnboardingError::not_found("Site", site_id));
        }
        if tables.trial_sites.contains_key(&(trial_id, site_id)) {
            return Err(OnboardingError::DuplicateLink { trial_id, site_id });
        }
        let link = TrialSite {
            trial_id,
            site_id,
            status: "pending".to_string(),
        };
        tables.trial_sites.insert((trial_id, site_id), link.clone());
        Ok(link)
    }

    async fn unlink_site(&self, trial_id: TrialId, site_id: SiteId) -> Result<bool, OnboardingError> {
        Ok(self.tables().trial_sites.remove(&(trial_id, site_id)).is_some())
    }

    async fn counts(&self) -> Result<StoreCounts, OnboardingError> {
        let tables = self.tables();
        Ok(StoreCounts {
            trials: tables.trials.len(),
            protocols: tables.protocols.len(),
            sites: tables.sites.len(),
            trial_sites: tables.trial_sites.len(),
        })
    }
}
