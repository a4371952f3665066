// Synchronous compensating saga
//
// Runs a homogeneous list of forward steps in order. The first failure stops
// forward progress, the compensation stack is unwound, and the caller gets a
// structured outcome instead of an error. Failed steps are never retried here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::errors::OnboardingError;
use crate::observability::orchestration_metrics;
use crate::saga::compensation::{Compensate, CompensationStack, UnwindReport};

/// One forward action of a saga.
#[async_trait]
pub trait Step<C: Send + Sync>: Send + Sync {
    type Compensation: Compensate<C>;

    /// Deterministic name, derived from the step kind and its index only
    fn name(&self) -> String;

    /// Perform the step. `Some` pushes a compensation for it onto the stack.
    async fn execute(&self, ctx: &mut C) -> Result<Option<Self::Compensation>, OnboardingError>;
}

/// Checkpoint hook invoked after each step completes and its compensation is pushed.
///
/// An error here is handled exactly like a failure of the step itself.
#[async_trait]
pub trait SagaObserver<C: Send + Sync>: Send + Sync {
    async fn step_completed(&self, step_name: &str, ctx: &C) -> Result<(), OnboardingError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

#[async_trait]
impl<C: Send + Sync> SagaObserver<C> for NoopObserver {
    async fn step_completed(&self, _step_name: &str, _ctx: &C) -> Result<(), OnboardingError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaFailure {
    /// Step that was executing when the error surfaced
    pub step: String,
    pub error: OnboardingError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaOutcome {
    pub status: SagaStatus,
    pub completed_steps: Vec<String>,
    pub failure: Option<SagaFailure>,
    pub unwind: UnwindReport,
}

impl SagaOutcome {
    pub fn is_success(&self) -> bool {
        self.status == SagaStatus::Completed
    }

    /// Caller-facing failure text: the last completed step, the original
    /// error, then any compensation errors.
    pub fn failure_message(&self) -> Option<String> {
        let failure = self.failure.as_ref()?;
        let last_step = self.completed_steps.last().map(String::as_str).unwrap_or("unknown");
        let mut message = format!("Saga failed at step '{last_step}': {}", failure.error);
        if !self.unwind.errors.is_empty() {
            message.push_str(&format!(". Compensation errors: {}", self.unwind.errors.join("; ")));
        }
        Some(message)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SagaExecutor;

impl SagaExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn run<C, S>(&self, steps: &[S], ctx: &mut C) -> SagaOutcome
    where
        C: Send + Sync,
        S: Step<C>,
    {
        self.run_observed(steps, ctx, &NoopObserver).await
    }

    pub async fn run_observed<C, S, O>(&self, steps: &[S], ctx: &mut C, observer: &O) -> SagaOutcome
    where
        C: Send + Sync,
        S: Step<C>,
        O: SagaObserver<C>,
    {
        orchestration_metrics().record_saga_started();
        let mut stack: CompensationStack<S::Compensation> = CompensationStack::new();
        let mut completed_steps = Vec::with_capacity(steps.len());

        for step in steps {
            let name = step.name();
            debug!(step = %name, "Executing saga step");

            let result = match step.execute(ctx).await {
                Ok(compensation) => {
                    if let Some(action) = compensation {
                        stack.push(name.clone(), action);
                    }
                    completed_steps.push(name.clone());
                    observer.step_completed(&name, ctx).await
                }
                Err(e) => Err(e),
            };

            if let Err(error) = result {
                error!(
                    step = %name,
                    error = %error,
                    completed = completed_steps.len(),
                    pending_compensations = stack.len(),
                    "Saga step failed, compensating"
                );
                let unwind = stack.unwind(&*ctx).await;
                orchestration_metrics().record_saga_compensated();

                return SagaOutcome {
                    status: SagaStatus::Error,
                    completed_steps,
                    failure: Some(SagaFailure { step: name, error }),
                    unwind,
                };
            }
        }

        orchestration_metrics().record_saga_completed();
        info!(steps = completed_steps.len(), "Saga completed");
        SagaOutcome {
            status: SagaStatus::Completed,
            completed_steps,
            failure: None,
            unwind: UnwindReport::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Ledger {
        applied: Vec<u32>,
        undone: std::sync::Mutex<Vec<u32>>,
    }

    struct Apply {
        id: u32,
        fails: bool,
    }

    struct Revert(u32);

    #[async_trait]
    impl Compensate<Ledger> for Revert {
        fn name(&self) -> String {
            format!("revert_{}", self.0)
        }

        async fn compensate(&self, ctx: &Ledger) -> Result<(), OnboardingError> {
            ctx.undone.lock().unwrap().push(self.0);
            Ok(())
        }
    }

    #[async_trait]
    impl Step<Ledger> for Apply {
        type Compensation = Revert;

        fn name(&self) -> String {
            format!("apply_{}", self.id)
        }

        async fn execute(&self, ctx: &mut Ledger) -> Result<Option<Revert>, OnboardingError> {
            if self.fails {
                return Err(OnboardingError::validation(format!("step {} rejected", self.id)));
            }
            ctx.applied.push(self.id);
            Ok(Some(Revert(self.id)))
        }
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let steps: Vec<Apply> = (1..=3).map(|id| Apply { id, fails: false }).collect();
        let mut ledger = Ledger::default();

        let outcome = SagaExecutor::new().run(&steps, &mut ledger).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.completed_steps, vec!["apply_1", "apply_2", "apply_3"]);
        assert!(ledger.undone.lock().unwrap().is_empty());
        assert_eq!(outcome.failure_message(), None);
    }

    #[tokio::test]
    async fn test_failure_compensates_prior_steps_only() {
        let steps = vec![
            Apply { id: 1, fails: false },
            Apply { id: 2, fails: false },
            Apply { id: 3, fails: true },
            Apply { id: 4, fails: false },
        ];
        let mut ledger = Ledger::default();

        let outcome = SagaExecutor::new().run(&steps, &mut ledger).await;

        assert_eq!(outcome.status, SagaStatus::Error);
        assert_eq!(outcome.completed_steps, vec!["apply_1", "apply_2"]);
        assert_eq!(*ledger.undone.lock().unwrap(), vec![2, 1]);
        assert_eq!(outcome.failure.as_ref().unwrap().step, "apply_3");
        assert_eq!(
            outcome.failure_message().unwrap(),
            "Saga failed at step 'apply_2': step 3 rejected"
        );
    }

    #[tokio::test]
    async fn test_first_step_failure_reports_unknown() {
        let steps = vec![Apply { id: 1, fails: true }];
        let mut ledger = Ledger::default();

        let outcome = SagaExecutor::new().run(&steps, &mut ledger).await;

        assert!(outcome.completed_steps.is_empty());
        assert!(outcome.failure_message().unwrap().starts_with("Saga failed at step 'unknown'"));
    }

    struct RejectAfter(&'static str);

    #[async_trait]
    impl SagaObserver<Ledger> for RejectAfter {
        async fn step_completed(&self, step_name: &str, _ctx: &Ledger) -> Result<(), OnboardingError> {
            if step_name == self.0 {
                Err(OnboardingError::Transient("checkpoint write failed".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_observer_failure_unwinds_including_current_step() {
        let steps: Vec<Apply> = (1..=3).map(|id| Apply { id, fails: false }).collect();
        let mut ledger = Ledger::default();

        let outcome = SagaExecutor::new()
            .run_observed(&steps, &mut ledger, &RejectAfter("apply_2"))
            .await;

        assert_eq!(outcome.status, SagaStatus::Error);
        assert_eq!(outcome.completed_steps, vec!["apply_1", "apply_2"]);
        assert_eq!(*ledger.undone.lock().unwrap(), vec![2, 1]);
    }
}
