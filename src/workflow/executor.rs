// Durable onboarding workflow
//
// Same logical sequence as the saga, but every side effect, timer and
// progress notification goes through the step memoizer. Terminal failures
// end the workflow with a FAILED event and an Ok result; transient failures
// are handed back so the runtime re-invokes from the last memoized step.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::classification::{Classified, ClassifyExt};
use crate::errors::OnboardingError;
use crate::observability::orchestration_metrics;
use crate::trials::commands;
use crate::trials::repository::TrialRepository;
use crate::trials::types::{OnboardTrialInput, ProtocolId, SiteRegistration, TrialId};
use crate::workflow::journal::{Journal, JournalStore};
use crate::workflow::memoizer::StepMemoizer;
use crate::workflow::progress::{
    OnboardTrialStatus, ProgressError, ProgressEvent, ProgressSink, SiteProgress, TrialSnapshot,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub success: bool,
    pub trial_id: Option<TrialId>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowSettings {
    /// Pause before each forward step so progress is observable
    pub step_delay: Duration,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_secs(2),
        }
    }
}

pub struct WorkflowExecutor {
    repo: Arc<dyn TrialRepository>,
    journals: Arc<dyn JournalStore>,
    progress: Arc<dyn ProgressSink>,
    settings: WorkflowSettings,
}

impl WorkflowExecutor {
    pub fn new(
        repo: Arc<dyn TrialRepository>,
        journals: Arc<dyn JournalStore>,
        progress: Arc<dyn ProgressSink>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            repo,
            journals,
            progress,
            settings,
        }
    }

    pub fn journals(&self) -> &Arc<dyn JournalStore> {
        &self.journals
    }

    async fn open(&self, workflow_id: &str) -> Result<StepMemoizer, Classified<OnboardingError>> {
        let journal = self
            .journals
            .load(workflow_id)
            .await
            .map_err(OnboardingError::from)
            .classified()?
            .unwrap_or_else(|| Journal::new(workflow_id));
        Ok(StepMemoizer::new(journal, Arc::clone(&self.journals)))
    }

    /// Execute (or resume) the workflow identified by `workflow_id`.
    ///
    /// `Err` is always transient unless the journal itself is unusable, in
    /// which case it is terminal.
    pub async fn run(
        &self,
        workflow_id: &str,
        input: &OnboardTrialInput,
    ) -> Result<WorkflowResult, Classified<OnboardingError>> {
        let mut memo = self.open(workflow_id).await?;
        if let Some(result) = finished_result(memo.journal())? {
            debug!(workflow_id, "Workflow already finished, returning recorded result");
            return Ok(result);
        }

        let attempt = memo.begin_attempt().await?;
        info!(
            workflow_id,
            attempt,
            name = %input.name,
            phase = %input.phase,
            sites = input.sites.len(),
            "Starting workflow execution"
        );

        match self.drive(&mut memo, workflow_id, input).await {
            Ok(result) => {
                memo.finish(OnboardTrialStatus::Completed, &result).await?;
                orchestration_metrics().record_workflow_completed();
                info!(
                    workflow_id,
                    replayed = memo.replayed(),
                    executed = memo.executed(),
                    "Workflow completed"
                );
                Ok(result)
            }
            Err(Classified::Transient(e)) => {
                warn!(
                    workflow_id,
                    step = memo.current_step().unwrap_or("unknown"),
                    error = %e,
                    "Transient failure, handing back to runtime for retry"
                );
                // Best effort: keeps current_step accurate for status queries
                if let Err(persist_err) = memo.persist().await {
                    debug!(workflow_id, error = %persist_err, "Could not persist journal after transient failure");
                }
                Err(Classified::Transient(e))
            }
            Err(Classified::Terminal(e)) => self.fail(&mut memo, &e).await,
        }
    }

    /// Permanently fail a workflow whose transient retries are exhausted.
    pub async fn abandon(
        &self,
        workflow_id: &str,
        error: &OnboardingError,
    ) -> Result<WorkflowResult, Classified<OnboardingError>> {
        let mut memo = self.open(workflow_id).await?;
        if let Some(result) = finished_result(memo.journal())? {
            return Ok(result);
        }
        self.fail(&mut memo, error).await
    }

    async fn fail(
        &self,
        memo: &mut StepMemoizer,
        error: &OnboardingError,
    ) -> Result<WorkflowResult, Classified<OnboardingError>> {
        let workflow_id = memo.workflow_id().to_string();
        let failed_step = memo.current_step().unwrap_or("unknown").to_string();
        error!(workflow_id = %workflow_id, step = %failed_step, error = %error, "Workflow failed");

        let message = format!("Workflow failed during {failed_step}: {error}");

        let event = ProgressEvent::new(workflow_id.as_str(), OnboardTrialStatus::Failed, message.clone())
            .with_error(ProgressError {
                failed_step,
                message: error.to_string(),
            });
        self.send_progress(memo, "7_failed", event).await?;

        let result = WorkflowResult {
            success: false,
            trial_id: None,
            message,
        };
        memo.finish(OnboardTrialStatus::Failed, &result).await?;
        orchestration_metrics().record_workflow_failed();
        Ok(result)
    }

    async fn drive(
        &self,
        memo: &mut StepMemoizer,
        workflow_id: &str,
        input: &OnboardTrialInput,
    ) -> Result<WorkflowResult, Classified<OnboardingError>> {
        let delay = self.settings.step_delay;
        let repo = &self.repo;
        let total = input.sites.len();

        memo.begin_step("create_trial");
        self.send_progress(
            memo,
            "0_creating_trial",
            ProgressEvent::new(workflow_id, OnboardTrialStatus::CreatingTrial, "Creating trial..."),
        )
        .await?;
        memo.sleep("delay_create_trial", delay).await?;

        let trial: TrialSnapshot = memo
            .once("create_trial", || async {
                let trial = commands::create_trial(repo.as_ref(), &input.name, &input.phase).await?;
                Ok(TrialSnapshot {
                    id: trial.id,
                    name: trial.name,
                    phase: trial.phase,
                })
            })
            .await?;
        info!(workflow_id, trial_id = trial.id, "Trial created");

        self.send_progress(
            memo,
            "1_trial_created",
            ProgressEvent::new(
                workflow_id,
                OnboardTrialStatus::TrialCreated,
                format!("Trial '{}' created with ID {}", input.name, trial.id),
            )
            .with_trial(Some(trial.clone())),
        )
        .await?;

        // Unlike create_trial, the pause comes before the ADDING event.
        memo.begin_step("add_protocol");
        memo.sleep("delay_add_protocol", delay).await?;
        self.send_progress(
            memo,
            "2_protocol_adding",
            ProgressEvent::new(
                workflow_id,
                OnboardTrialStatus::ProtocolAdding,
                format!("Adding protocol version {}...", input.initial_protocol_version),
            )
            .with_trial(Some(trial.clone())),
        )
        .await?;

        let trial_id = trial.id;
        let protocol_id: ProtocolId = memo
            .once("add_protocol", || async move {
                let protocol =
                    commands::add_protocol(repo.as_ref(), trial_id, &input.initial_protocol_version, &input.name)
                        .await?;
                Ok(protocol.id)
            })
            .await?;
        info!(workflow_id, trial_id, protocol_id, "Protocol added");

        self.send_progress(
            memo,
            "3_protocol_added",
            ProgressEvent::new(
                workflow_id,
                OnboardTrialStatus::ProtocolAdded,
                format!("Protocol version {} added to trial", input.initial_protocol_version),
            )
            .with_trial(Some(trial.clone())),
        )
        .await?;

        for (i, site) in input.sites.iter().enumerate() {
            let n = i + 1;
            let step = format!("register_site_{n}");
            memo.begin_step(&step);
            memo.sleep(&format!("delay_register_site_{n}"), delay).await?;

            let site_progress = SiteProgress {
                current_index: n,
                total,
                name: site.name.clone(),
            };
            self.send_progress(
                memo,
                &format!("4_site_{n}_registering"),
                ProgressEvent::new(
                    workflow_id,
                    OnboardTrialStatus::SiteRegistering,
                    format!("Registering site {} ({n}/{total})...", site.name),
                )
                .with_trial(Some(trial.clone()))
                .with_site_progress(site_progress.clone()),
            )
            .await?;

            let registration: SiteRegistration = memo
                .once(&step, || async move {
                    commands::register_site(repo.as_ref(), trial_id, &site.name, &site.country).await
                })
                .await?;
            info!(workflow_id, trial_id, site_id = registration.site_id, step = %step, "Site registered");

            self.send_progress(
                memo,
                &format!("5_site_{n}_registered"),
                ProgressEvent::new(
                    workflow_id,
                    OnboardTrialStatus::SiteRegistered,
                    format!("Site {} registered successfully ({n}/{total})", site.name),
                )
                .with_trial(Some(trial.clone()))
                .with_site_progress(site_progress),
            )
            .await?;
        }

        self.send_progress(
            memo,
            "6_completed",
            ProgressEvent::new(
                workflow_id,
                OnboardTrialStatus::Completed,
                format!("Successfully onboarded trial '{}' with {total} sites", input.name),
            )
            .with_trial(Some(trial)),
        )
        .await?;

        Ok(WorkflowResult {
            success: true,
            trial_id: Some(trial_id),
            message: format!("Workflow completed for trial '{}'", input.name),
        })
    }

    /// Publish a progress event at most once per progress point.
    ///
    /// A failed publish is logged and swallowed. Only journal failures escape.
    async fn send_progress(
        &self,
        memo: &mut StepMemoizer,
        key: &str,
        event: ProgressEvent,
    ) -> Result<(), Classified<OnboardingError>> {
        let status = event.status;
        let workflow_id = event.workflow_id.clone();
        let sink = &self.progress;

        let delivered: usize = memo
            .once(&format!("progress_{key}"), || async move {
                match sink.publish(event).await {
                    Ok(delivered) => {
                        orchestration_metrics().record_progress_published();
                        Ok(delivered)
                    }
                    Err(e) => {
                        orchestration_metrics().record_progress_dropped();
                        warn!(workflow_id = %workflow_id, error = %e, "Failed to send progress update");
                        Ok(0)
                    }
                }
            })
            .await?;
        debug!(key, delivered, status = status.as_str(), "Progress point reached");

        memo.set_status(status).await
    }
}

fn finished_result(journal: &Journal) -> Result<Option<WorkflowResult>, Classified<OnboardingError>> {
    match &journal.result {
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(OnboardingError::from)
            .classified(),
        None => Ok(None),
    }
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
