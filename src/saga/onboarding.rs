// Blocking trial onboarding saga
//
// create_trial -> add_protocol -> register_site_1..n, each pushing a value
// compensation that carries the ids it needs. Sites themselves are shared
// reference data; only the trial, its protocol and its site links are undone.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use statig::prelude::*;
use std::sync::{Arc, Mutex};
use tracing::{error, info, Instrument};

use crate::errors::OnboardingError;
use crate::saga::compensation::Compensate;
use crate::saga::executor::{SagaExecutor, SagaObserver, Step};
use crate::saga::record::{SagaEvent, SagaId, SagaLifecycle, SagaRecord, SagaRecordStore};
use crate::telemetry::create_saga_span;
use crate::trials::commands;
use crate::trials::repository::TrialRepository;
use crate::trials::types::{OnboardTrialInput, ProtocolId, SiteId, SiteInput, TrialId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardTrialSyncResponse {
    pub success: bool,
    pub saga_id: SagaId,
    pub trial_id: Option<TrialId>,
    pub message: String,
    pub steps_completed: Vec<String>,
}

/// Ids produced by forward steps, read by later steps.
pub struct OnboardingContext {
    repo: Arc<dyn TrialRepository>,
    input: OnboardTrialInput,
    trial_id: Option<TrialId>,
    protocol_id: Option<ProtocolId>,
    site_ids: Vec<SiteId>,
}

impl OnboardingContext {
    pub fn new(repo: Arc<dyn TrialRepository>, input: OnboardTrialInput) -> Self {
        Self {
            repo,
            input,
            trial_id: None,
            protocol_id: None,
            site_ids: Vec::new(),
        }
    }

    pub fn trial_id(&self) -> Option<TrialId> {
        self.trial_id
    }

    pub fn protocol_id(&self) -> Option<ProtocolId> {
        self.protocol_id
    }

    pub fn site_ids(&self) -> &[SiteId] {
        &self.site_ids
    }

    fn require_trial(&self, step: &str) -> Result<TrialId, OnboardingError> {
        self.trial_id
            .ok_or_else(|| OnboardingError::unexpected(format!("{step} ran before create_trial")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnboardingStep {
    CreateTrial,
    AddProtocol,
    /// `index` is 1-based
    RegisterSite { index: usize, site: SiteInput },
}

impl OnboardingStep {
    /// The fixed step sequence for one onboarding input.
    pub fn plan(input: &OnboardTrialInput) -> Vec<OnboardingStep> {
        let mut steps = vec![OnboardingStep::CreateTrial, OnboardingStep::AddProtocol];
        steps.extend(
            input
                .sites
                .iter()
                .enumerate()
                .map(|(i, site)| OnboardingStep::RegisterSite {
                    index: i + 1,
                    site: site.clone(),
                }),
        );
        steps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    DeleteTrial { trial_id: TrialId },
    DeleteProtocol { protocol_id: ProtocolId },
    UnregisterSite { index: usize, trial_id: TrialId, site_id: SiteId },
}

#[async_trait]
impl Step<OnboardingContext> for OnboardingStep {
    type Compensation = Compensation;

    fn name(&self) -> String {
        match self {
            OnboardingStep::CreateTrial => "create_trial".to_string(),
            OnboardingStep::AddProtocol => "add_protocol".to_string(),
            OnboardingStep::RegisterSite { index, .. } => format!("register_site_{index}"),
        }
    }

    async fn execute(&self, ctx: &mut OnboardingContext) -> Result<Option<Compensation>, OnboardingError> {
        match self {
            OnboardingStep::CreateTrial => {
                let trial = commands::create_trial(ctx.repo.as_ref(), &ctx.input.name, &ctx.input.phase).await?;
                ctx.trial_id = Some(trial.id);
                Ok(Some(Compensation::DeleteTrial { trial_id: trial.id }))
            }
            OnboardingStep::AddProtocol => {
                let trial_id = ctx.require_trial("add_protocol")?;
                let protocol = commands::add_protocol(
                    ctx.repo.as_ref(),
                    trial_id,
                    &ctx.input.initial_protocol_version,
                    &ctx.input.name,
                )
                .await?;
                ctx.protocol_id = Some(protocol.id);
                Ok(Some(Compensation::DeleteProtocol { protocol_id: protocol.id }))
            }
            OnboardingStep::RegisterSite { index, site } => {
                let trial_id = ctx.require_trial("register_site")?;
                let registration =
                    commands::register_site(ctx.repo.as_ref(), trial_id, &site.name, &site.country).await?;
                ctx.site_ids.push(registration.site_id);
                Ok(Some(Compensation::UnregisterSite {
                    index: *index,
                    trial_id,
                    site_id: registration.site_id,
                }))
            }
        }
    }
}

#[async_trait]
impl Compensate<OnboardingContext> for Compensation {
    fn name(&self) -> String {
        match self {
            Compensation::DeleteTrial { .. } => "delete_trial".to_string(),
            Compensation::DeleteProtocol { .. } => "delete_protocol".to_string(),
            Compensation::UnregisterSite { index, .. } => format!("unregister_site_{index}"),
        }
    }

    async fn compensate(&self, ctx: &OnboardingContext) -> Result<(), OnboardingError> {
        match *self {
            Compensation::DeleteTrial { trial_id } => {
                ctx.repo.delete_trial(trial_id).await?;
            }
            Compensation::DeleteProtocol { protocol_id } => {
                ctx.repo.delete_protocol(protocol_id).await?;
            }
            Compensation::UnregisterSite { trial_id, site_id, .. } => {
                ctx.repo.unlink_site(trial_id, site_id).await?;
            }
        }
        Ok(())
    }
}

/// Persists the saga record as forward steps complete.
struct RecordCheckpoint {
    store: Arc<dyn SagaRecordStore>,
    lifecycle: Mutex<StateMachine<SagaLifecycle>>,
    final_step: String,
}

impl RecordCheckpoint {
    fn apply(&self, event: &SagaEvent) -> SagaRecord {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        lifecycle.handle(event);
        lifecycle.inner().record().clone()
    }

    async fn apply_and_save(&self, event: SagaEvent) -> Result<SagaRecord, OnboardingError> {
        let record = self.apply(&event);
        self.store.save(&record).await?;
        Ok(record)
    }
}

#[async_trait]
impl SagaObserver<OnboardingContext> for RecordCheckpoint {
    async fn step_completed(&self, step_name: &str, ctx: &OnboardingContext) -> Result<(), OnboardingError> {
        if step_name == "create_trial" {
            let trial_id = ctx.require_trial(step_name)?;
            self.apply_and_save(SagaEvent::TrialCreated { trial_id }).await?;
        }
        if step_name == self.final_step {
            self.apply_and_save(SagaEvent::SitesAdded).await?;
        }
        Ok(())
    }
}

/// Entry point for the blocking onboarding path.
#[derive(Clone)]
pub struct OnboardingSaga {
    repo: Arc<dyn TrialRepository>,
    records: Arc<dyn SagaRecordStore>,
    executor: SagaExecutor,
}

impl OnboardingSaga {
    pub fn new(repo: Arc<dyn TrialRepository>, records: Arc<dyn SagaRecordStore>) -> Self {
        Self {
            repo,
            records,
            executor: SagaExecutor::new(),
        }
    }

    /// Run the whole saga and return once it has completed or been compensated.
    pub async fn run(&self, input: OnboardTrialInput) -> Result<OnboardTrialSyncResponse, OnboardingError> {
        let record = SagaRecord::new();
        let saga_id = record.id;
        self.records.save(&record).await?;

        self.execute(saga_id, record, input)
            .instrument(create_saga_span(&saga_id.to_string()))
            .await
    }

    async fn execute(
        &self,
        saga_id: SagaId,
        record: SagaRecord,
        input: OnboardTrialInput,
    ) -> Result<OnboardTrialSyncResponse, OnboardingError> {
        info!(name = %input.name, phase = %input.phase, sites = input.sites.len(), "Starting onboarding saga");

        let steps = OnboardingStep::plan(&input);
        let final_step = steps.last().map(|s| s.name()).unwrap_or_default();
        let checkpoint = RecordCheckpoint {
            store: Arc::clone(&self.records),
            lifecycle: Mutex::new(SagaLifecycle::new(record).state_machine()),
            final_step,
        };

        let name = input.name.clone();
        let site_count = input.sites.len();
        let mut ctx = OnboardingContext::new(Arc::clone(&self.repo), input);
        let outcome = self.executor.run_observed(&steps, &mut ctx, &checkpoint).await;

        if outcome.is_success() {
            if let Err(e) = checkpoint.apply_and_save(SagaEvent::Complete).await {
                // Every payload write already landed; only the status row lags
                error!(error = %e, "Failed to persist saga completion");
            }
            return Ok(OnboardTrialSyncResponse {
                success: true,
                saga_id,
                trial_id: ctx.trial_id(),
                message: format!("Successfully onboarded trial '{name}' with {site_count} sites"),
                steps_completed: outcome.completed_steps,
            });
        }

        let message = outcome
            .failure_message()
            .unwrap_or_else(|| "Saga failed at step 'unknown'".to_string());
        if let Err(e) = checkpoint
            .apply_and_save(SagaEvent::Fail { message: message.clone() })
            .await
        {
            error!(error = %e, "Failed to persist saga error state");
        }

        Ok(OnboardTrialSyncResponse {
            success: false,
            saga_id,
            trial_id: None,
            message,
            steps_completed: outcome.completed_steps,
        })
    }

    /// Current record for a saga started by [`OnboardingSaga::run`].
    pub async fn onboarding_status(&self, saga_id: SagaId) -> Result<SagaRecord, OnboardingError> {
        self.records
            .load(saga_id)
            .await?
            .ok_or_else(|| OnboardingError::not_found("Saga", saga_id))
    }
}

impl std::fmt::Debug for OnboardingSaga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnboardingSaga").finish_non_exhaustive()
    }
}
