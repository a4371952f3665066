// End-to-end tests for the blocking onboarding saga
//
// These run against the in-memory store, which enforces the same foreign keys
// as the relational schema, so a wrong compensation order fails here.

use std::sync::Arc;
use trial_onboarding::saga::onboarding::{OnboardingContext, OnboardingStep};
use trial_onboarding::saga::{InMemorySagaRecordStore, OnboardingSaga, SagaExecutor, SagaState, SagaStatus};
use trial_onboarding::trials::{InMemoryTrialStore, OnboardTrialInput, SiteInput, TrialRepository};
use trial_onboarding::OnboardingError;

fn input(phase: &str, sites: Vec<SiteInput>) -> OnboardTrialInput {
    OnboardTrialInput {
        name: "T1".to_string(),
        phase: phase.to_string(),
        initial_protocol_version: "v1.0".to_string(),
        sites,
    }
}

fn saga() -> (Arc<InMemoryTrialStore>, OnboardingSaga) {
    let store = Arc::new(InMemoryTrialStore::new());
    let saga = OnboardingSaga::new(store.clone(), Arc::new(InMemorySagaRecordStore::new()));
    (store, saga)
}

#[tokio::test]
async fn test_happy_path_completes_every_step() {
    let (store, saga) = saga();

    let response = saga
        .run(input("Phase I", vec![SiteInput::new("A", "US"), SiteInput::new("B", "UK")]))
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(
        response.steps_completed,
        vec!["create_trial", "add_protocol", "register_site_1", "register_site_2"]
    );
    assert_eq!(response.message, "Successfully onboarded trial 'T1' with 2 sites");

    let trial_id = response.trial_id.unwrap();
    assert_eq!(store.protocols_for(trial_id).len(), 1);
    assert_eq!(store.sites_for(trial_id).len(), 2);
    assert!(store.sites_for(trial_id).iter().all(|link| link.status == "pending"));

    let record = saga.onboarding_status(response.saga_id).await.unwrap();
    assert_eq!(record.state, SagaState::Completed);
    assert_eq!(record.trial_id, Some(trial_id));
}

#[tokio::test]
async fn test_invalid_phase_leaves_nothing_behind() {
    let (store, saga) = saga();

    let response = saga.run(input("Phase X", vec![SiteInput::new("A", "US")])).await.unwrap();

    assert!(!response.success);
    assert!(response.trial_id.is_none());
    assert!(response.steps_completed.is_empty());
    assert!(response.message.starts_with("Saga failed at step 'unknown': Invalid phase: Phase X"));

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.trials, 0);
    assert_eq!(counts.protocols, 0);
    assert_eq!(counts.sites, 0);
    assert_eq!(counts.trial_sites, 0);

    let record = saga.onboarding_status(response.saga_id).await.unwrap();
    assert_eq!(record.state, SagaState::Error);
    assert_eq!(record.error.as_deref(), Some(response.message.as_str()));
}

#[tokio::test]
async fn test_duplicate_site_unwinds_in_reverse_order() {
    let store = Arc::new(InMemoryTrialStore::new());
    let plan_input = input("Phase II", vec![SiteInput::new("A", "US"), SiteInput::new("A", "US")]);
    let steps = OnboardingStep::plan(&plan_input);
    let mut ctx = OnboardingContext::new(store.clone(), plan_input);

    let outcome = SagaExecutor::new().run(&steps, &mut ctx).await;

    assert_eq!(outcome.status, SagaStatus::Error);
    assert_eq!(outcome.completed_steps, vec!["create_trial", "add_protocol", "register_site_1"]);
    let failure = outcome.failure.as_ref().unwrap();
    assert_eq!(failure.step, "register_site_2");
    assert!(matches!(failure.error, OnboardingError::DuplicateLink { .. }));
    assert_eq!(
        outcome.unwind.compensated,
        vec!["unregister_site_1", "delete_protocol", "delete_trial"]
    );
    assert!(outcome.unwind.is_clean());

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.trials, 0);
    assert_eq!(counts.protocols, 0);
    assert_eq!(counts.trial_sites, 0);
    // Site rows are shared reference data and survive compensation
    assert_eq!(counts.sites, 1);
}

#[tokio::test]
async fn test_duplicate_site_response_reports_last_completed_step() {
    let (store, saga) = saga();

    let response = saga
        .run(input("Phase III", vec![SiteInput::new("A", "US"), SiteInput::new("A", "US")]))
        .await
        .unwrap();

    assert!(!response.success);
    assert!(response.trial_id.is_none());
    assert!(response
        .message
        .starts_with("Saga failed at step 'register_site_1': Site"));
    assert_eq!(store.counts().await.unwrap().trials, 0);
}

#[tokio::test]
async fn test_sequential_sagas_reuse_sites() {
    let (store, saga) = saga();

    let first = saga.run(input("Phase I", vec![SiteInput::new("Mayo", "US")])).await.unwrap();
    let mut second_input = input("Phase I", vec![SiteInput::new("Mayo", "US")]);
    second_input.name = "T2".to_string();
    let second = saga.run(second_input).await.unwrap();

    assert!(first.success && second.success);
    assert_ne!(first.trial_id, second.trial_id);
    let counts = store.counts().await.unwrap();
    assert_eq!(counts.sites, 1);
    assert_eq!(counts.trial_sites, 2);
}
