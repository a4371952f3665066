// Trial management command handlers
// Each handler validates, then writes through the repository. None of them
// swallow errors: classification happens upstream.

use chrono::Utc;
use tracing::info;

use crate::errors::OnboardingError;
use crate::trials::repository::TrialRepository;
use crate::trials::types::{
    ProtocolVersion, SiteRegistration, Trial, TrialId, UpdateTrialMetadata,
    UpdateTrialMetadataResponse,
};
use crate::trials::validation::{validate_phase, validate_phase_transition};
use crate::versioning::{check_expectation, Expectation, Versioned};

pub async fn create_trial(
    repo: &dyn TrialRepository,
    name: &str,
    phase: &str,
) -> Result<Trial, OnboardingError> {
    validate_phase(phase)?;
    if name.trim().is_empty() {
        return Err(OnboardingError::validation("Trial name must not be empty"));
    }

    let trial = repo.insert_trial(name, phase).await?;
    info!(trial_id = trial.id, name = %trial.name, phase = %trial.phase, "Trial created");
    Ok(trial)
}

pub async fn add_protocol(
    repo: &dyn TrialRepository,
    trial_id: TrialId,
    version: &str,
    trial_name: &str,
) -> Result<ProtocolVersion, OnboardingError> {
    if version.trim().is_empty() {
        return Err(OnboardingError::validation("Protocol version must not be empty"));
    }
    if repo.get_trial(trial_id).await?.is_none() {
        return Err(OnboardingError::not_found("Trial", trial_id));
    }

    let protocol = repo
        .insert_protocol(trial_id, version, Some(format!("Initial protocol for {trial_name}")))
        .await?;
    info!(trial_id, protocol_id = protocol.id, version = %protocol.version, "Protocol version added");
    Ok(protocol)
}

/// Upsert the site by name and country, then link it to the trial as `pending`.
pub async fn register_site(
    repo: &dyn TrialRepository,
    trial_id: TrialId,
    site_name: &str,
    country: &str,
) -> Result<SiteRegistration, OnboardingError> {
    if repo.get_trial(trial_id).await?.is_none() {
        return Err(OnboardingError::not_found("Trial", trial_id));
    }

    let site = repo.upsert_site(site_name, country).await?;
    let link = repo.link_site(trial_id, site.id).await?;
    info!(trial_id, site_id = site.id, site = %site.name, "Site registered to trial");

    Ok(SiteRegistration {
        trial_id,
        site_id: site.id,
        site_name: site.name,
        country: site.country,
        link_status: link.status,
    })
}

/// Apply a metadata update after the optimistic-concurrency check.
///
/// The check runs before validation and before any write; a successful call
/// always advances the trial's version, even when no field changed.
pub async fn update_trial_metadata(
    repo: &dyn TrialRepository,
    trial_id: TrialId,
    update: &UpdateTrialMetadata,
) -> Result<UpdateTrialMetadataResponse, OnboardingError> {
    let mut trial = repo
        .get_trial(trial_id)
        .await?
        .ok_or_else(|| OnboardingError::not_found("Trial", trial_id))?;

    let expectation = Expectation {
        version: update.expected_version,
        updated_at: update.expected_updated_at,
    };
    check_expectation("Trial", &trial, &expectation)?;

    let mut changes = Vec::new();

    if let Some(name) = update.name.as_deref() {
        if name != trial.name {
            if name.trim().is_empty() {
                return Err(OnboardingError::validation("Trial name must not be empty"));
            }
            changes.push(format!("name: '{}' -> '{}'", trial.name, name));
            trial.name = name.to_string();
        }
    }

    if let Some(phase) = update.phase.as_deref() {
        if phase != trial.phase {
            validate_phase(phase)?;
            validate_phase_transition(&trial.phase, phase)?;
            changes.push(format!("phase: '{}' -> '{}'", trial.phase, phase));
            trial.phase = phase.to_string();
        }
    }

    trial.advance_version(Utc::now());
    repo.save_trial(&trial).await?;

    let changes = if changes.is_empty() {
        "no changes".to_string()
    } else {
        changes.join("; ")
    };
    info!(trial_id, version = trial.version, changes = %changes, "Trial metadata updated");

    Ok(UpdateTrialMetadataResponse {
        id: trial.id,
        name: trial.name,
        phase: trial.phase,
        status: trial.status,
        version: trial.version,
        updated_at: trial.updated_at,
        changes,
    })
}
