// In-process stand-in for the durable execution platform
//
// Spawns workflow invocations on tokio and re-invokes them with the same
// id and input after a transient failure. Memoized steps carry over through
// the journal store, so a retry resumes where the last attempt stopped.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::classification::Classified;
use crate::errors::OnboardingError;
use crate::observability::orchestration_metrics;
use crate::telemetry::create_workflow_span;
use crate::trials::types::OnboardTrialInput;
use crate::workflow::executor::{WorkflowExecutor, WorkflowResult};
use crate::workflow::journal::JournalStore;
use crate::workflow::progress::{OnboardTrialStatus, ProgressBroadcaster, Subscription};

/// Capped exponential backoff with jitter between re-invocations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total invocations including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before invocation `attempt + 1`, `attempt` being 1-based.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base_ms = self.base_delay.as_millis() as u64;
        let capped = std::cmp::min(base_ms.saturating_mul(1u64 << exponent), self.max_delay.as_millis() as u64);
        if capped == 0 {
            return Duration::ZERO;
        }
        // Up to half the delay again, so simultaneous failures spread out
        let jitter = rand::rng().random_range(0..=capped / 2);
        Duration::from_millis(capped + jitter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOnboardingResponse {
    pub workflow_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStatusView {
    pub workflow_id: String,
    pub status: Option<OnboardTrialStatus>,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub attempts: u32,
    pub result: Option<WorkflowResult>,
}

type WorkflowTask = JoinHandle<Result<WorkflowResult, OnboardingError>>;

/// Running tasks by workflow id, tagged with the submission that spawned them.
/// A task drops its own entry when it finishes.
type TaskMap = HashMap<String, (u64, WorkflowTask)>;

fn lock(tasks: &Mutex<TaskMap>) -> MutexGuard<'_, TaskMap> {
    tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct LocalRuntime {
    executor: Arc<WorkflowExecutor>,
    progress: ProgressBroadcaster,
    policy: RetryPolicy,
    tasks: Arc<Mutex<TaskMap>>,
    submissions: AtomicU64,
}

impl LocalRuntime {
    /// `progress` must be the broadcaster the executor publishes to.
    pub fn new(executor: Arc<WorkflowExecutor>, progress: ProgressBroadcaster, policy: RetryPolicy) -> Self {
        Self {
            executor,
            progress,
            policy,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            submissions: AtomicU64::new(0),
        }
    }

    pub fn progress(&self) -> &ProgressBroadcaster {
        &self.progress
    }

    /// Workflows spawned by this runtime that have not finished yet.
    pub fn running(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Start a workflow in the background and return its id immediately.
    pub fn start_onboarding(&self, input: OnboardTrialInput) -> StartOnboardingResponse {
        let workflow_id = Uuid::new_v4().to_string();
        self.submit(&workflow_id, input)
    }

    /// Like [`LocalRuntime::start_onboarding`], but subscribed before the
    /// first event can be published.
    pub fn start_onboarding_subscribed(&self, input: OnboardTrialInput) -> (StartOnboardingResponse, Subscription) {
        let workflow_id = Uuid::new_v4().to_string();
        let subscription = self.progress.subscribe(&workflow_id);
        (self.submit(&workflow_id, input), subscription)
    }

    /// Run `workflow_id` in the background. An id that is already running is
    /// left alone.
    pub fn submit(&self, workflow_id: &str, input: OnboardTrialInput) -> StartOnboardingResponse {
        let name = input.name.clone();
        let mut tasks = lock(&self.tasks);
        if tasks.get(workflow_id).is_some_and(|(_, task)| !task.is_finished()) {
            warn!(workflow_id, "Workflow already running, not starting it twice");
        } else {
            let executor = Arc::clone(&self.executor);
            let policy = self.policy;
            let registry = Arc::clone(&self.tasks);
            let submission = self.submissions.fetch_add(1, Ordering::Relaxed);
            let id = workflow_id.to_string();
            let handle = tokio::spawn(async move {
                let outcome = drive(executor, policy, id.clone(), input).await;
                let mut tasks = lock(&registry);
                if tasks.get(&id).is_some_and(|(owner, _)| *owner == submission) {
                    tasks.remove(&id);
                }
                outcome
            });
            tasks.insert(workflow_id.to_string(), (submission, handle));
            info!(workflow_id, trial = %name, "Workflow submitted");
        }

        StartOnboardingResponse {
            workflow_id: workflow_id.to_string(),
            message: format!("Workflow started for trial '{name}'. Use workflow ID to subscribe to progress."),
        }
    }

    /// Await the background task for `workflow_id`, or read the result it
    /// recorded if it already finished.
    pub async fn wait(&self, workflow_id: &str) -> Result<WorkflowResult, OnboardingError> {
        let task = lock(&self.tasks).remove(workflow_id);
        match task {
            Some((_, handle)) => handle
                .await
                .map_err(|e| OnboardingError::unexpected(format!("workflow task panicked or was cancelled: {e}")))?,
            None => self
                .workflow_status(workflow_id)
                .await
                .ok()
                .and_then(|status| status.result)
                .ok_or_else(|| OnboardingError::not_found("Workflow task", workflow_id)),
        }
    }

    /// Run `workflow_id` to completion in the current task.
    pub async fn run_to_completion(
        &self,
        workflow_id: &str,
        input: OnboardTrialInput,
    ) -> Result<WorkflowResult, OnboardingError> {
        drive(Arc::clone(&self.executor), self.policy, workflow_id.to_string(), input).await
    }

    pub async fn workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatusView, OnboardingError> {
        let journal = self
            .executor
            .journals()
            .load(workflow_id)
            .await?
            .ok_or_else(|| OnboardingError::not_found("Workflow", workflow_id))?;

        let result = match &journal.result {
            Some(value) => Some(serde_json::from_value(value.clone())?),
            None => None,
        };
        Ok(WorkflowStatusView {
            workflow_id: journal.workflow_id.clone(),
            status: journal.status,
            current_step: journal.current_step.clone(),
            completed_steps: journal.step_names(),
            attempts: journal.attempts,
            result,
        })
    }
}

/// Invoke the workflow until it produces a result or retries run out.
async fn drive(
    executor: Arc<WorkflowExecutor>,
    policy: RetryPolicy,
    workflow_id: String,
    input: OnboardTrialInput,
) -> Result<WorkflowResult, OnboardingError> {
    let mut attempt = 1;
    loop {
        let outcome = executor
            .run(&workflow_id, &input)
            .instrument(create_workflow_span(&workflow_id, attempt))
            .await;

        match outcome {
            Ok(result) => return Ok(result),
            Err(Classified::Terminal(e)) => {
                error!(workflow_id = %workflow_id, error = %e, "Workflow journal unusable, giving up");
                return Err(e);
            }
            Err(Classified::Transient(e)) if attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                orchestration_metrics().record_transient_retry();
                warn!(
                    workflow_id = %workflow_id,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Re-invoking workflow after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(Classified::Transient(e)) => {
                warn!(workflow_id = %workflow_id, attempts = attempt, error = %e, "Retries exhausted");
                return executor
                    .abandon(&workflow_id, &e)
                    .instrument(create_workflow_span(&workflow_id, attempt))
                    .await
                    .map_err(Classified::into_inner);
            }
        }
    }
}

impl std::fmt::Debug for LocalRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRuntime")
            .field("policy", &self.policy)
            .field("tasks", &self.running())
            .finish()
    }
}
