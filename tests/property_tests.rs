// Property-based tests for error classification and saga unwinding

use async_trait::async_trait;
use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::sync::Mutex;

use trial_onboarding::classification::{classify, classify_status, Classified, ErrorClass};
use trial_onboarding::saga::{Compensate, SagaExecutor, SagaStatus, Step};
use trial_onboarding::OnboardingError;

const MAX_STEPS: usize = 8;

fn error_strategy() -> impl Strategy<Value = OnboardingError> {
    prop_oneof![
        ".*".prop_map(OnboardingError::Validation),
        ("[a-zA-Z]+", any::<u64>()).prop_map(|(entity, id)| OnboardingError::not_found(&entity, id)),
        (any::<u64>(), any::<u64>()).prop_map(|(trial_id, site_id)| OnboardingError::DuplicateLink { trial_id, site_id }),
        ".*".prop_map(OnboardingError::StaleData),
        ".*".prop_map(OnboardingError::Transient),
        (any::<u16>(), ".*").prop_map(|(status, message)| OnboardingError::External { status, message }),
        ".*".prop_map(OnboardingError::Network),
        ".*".prop_map(OnboardingError::Unexpected),
    ]
}

proptest! {
    #[test]
    fn prop_classification_is_total_and_stable(error in error_strategy()) {
        let first = classify(&error);
        prop_assert_eq!(first, classify(&error));

        let classified = Classified::from(error.clone());
        prop_assert_eq!(classified.is_transient(), first == ErrorClass::Transient);
        prop_assert_eq!(classified.into_inner(), error);
    }

    #[test]
    fn prop_server_errors_are_transient(status in 500u16..600) {
        prop_assert_eq!(classify_status(status), ErrorClass::Transient);
    }

    #[test]
    fn prop_client_errors_are_terminal(status in 400u16..500) {
        prop_assume!(status != 408 && status != 429);
        prop_assert_eq!(classify_status(status), ErrorClass::Terminal);
    }
}

/// Records every compensation attempt, successful or not
#[derive(Debug, Default)]
struct Ledger {
    attempts: Mutex<Vec<String>>,
}

struct Scripted {
    index: usize,
    fails: bool,
    undo_fails: bool,
}

struct Undo {
    index: usize,
    fails: bool,
}

#[async_trait]
impl Compensate<Ledger> for Undo {
    fn name(&self) -> String {
        format!("undo_{}", self.index)
    }

    async fn compensate(&self, ctx: &Ledger) -> Result<(), OnboardingError> {
        ctx.attempts.lock().unwrap().push(self.name());
        if self.fails {
            return Err(OnboardingError::Transient("undo refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Step<Ledger> for Scripted {
    type Compensation = Undo;

    fn name(&self) -> String {
        format!("step_{}", self.index)
    }

    async fn execute(&self, _ctx: &mut Ledger) -> Result<Option<Undo>, OnboardingError> {
        if self.fails {
            return Err(OnboardingError::validation(format!("step {} rejected", self.index)));
        }
        Ok(Some(Undo {
            index: self.index,
            fails: self.undo_fails,
        }))
    }
}

#[derive(Debug, Clone, Arbitrary)]
struct SagaScenario {
    #[proptest(strategy = "1usize..=MAX_STEPS")]
    steps: usize,
    #[proptest(strategy = "proptest::option::of(0usize..MAX_STEPS)")]
    fail_at: Option<usize>,
    #[proptest(strategy = "proptest::collection::vec(any::<bool>(), MAX_STEPS)")]
    undo_fails: Vec<bool>,
}

#[test]
fn prop_saga_completes_a_prefix_and_unwinds_it_in_reverse() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&any::<SagaScenario>(), |scenario| {
            let steps: Vec<Scripted> = (0..scenario.steps)
                .map(|index| Scripted {
                    index,
                    fails: scenario.fail_at == Some(index),
                    undo_fails: scenario.undo_fails[index],
                })
                .collect();
            let mut ledger = Ledger::default();

            let outcome = tokio_test::block_on(SagaExecutor::new().run(&steps, &mut ledger));
            let attempts = ledger.attempts.into_inner().unwrap();

            match scenario.fail_at.filter(|k| *k < scenario.steps) {
                None => {
                    prop_assert_eq!(outcome.status, SagaStatus::Completed);
                    prop_assert_eq!(outcome.completed_steps.len(), scenario.steps);
                    prop_assert!(attempts.is_empty());
                }
                Some(k) => {
                    prop_assert_eq!(outcome.status, SagaStatus::Error);
                    let expected: Vec<String> = (0..k).map(|i| format!("step_{i}")).collect();
                    prop_assert_eq!(&outcome.completed_steps, &expected);
                    prop_assert_eq!(&outcome.failure.as_ref().unwrap().step, &format!("step_{k}"));

                    // Every completed step is undone exactly once, newest first,
                    // and a failing undo does not stop the rest
                    let reversed: Vec<String> = (0..k).rev().map(|i| format!("undo_{i}")).collect();
                    prop_assert_eq!(&attempts, &reversed);
                    let failing = (0..k).filter(|i| scenario.undo_fails[*i]).count();
                    prop_assert_eq!(outcome.unwind.errors.len(), failing);
                    prop_assert_eq!(outcome.unwind.compensated.len(), k - failing);
                }
            }
            Ok(())
        })
        .unwrap();
}
