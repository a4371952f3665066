// Keyed serialization and optimistic concurrency for trial metadata

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use trial_onboarding::serializer::KeyedSerializer;
use trial_onboarding::trials::{commands, InMemoryTrialStore, TrialMetadataService, TrialRepository, UpdateTrialMetadata};
use trial_onboarding::OnboardingError;

async fn wait_for_pending(serializer: &KeyedSerializer<String>, key: &String, expected: usize) {
    while serializer.pending(key) < expected {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_same_key_runs_in_arrival_order() {
    let serializer: KeyedSerializer<String> = KeyedSerializer::new();
    let key = "trial-1".to_string();
    let order = Arc::new(Mutex::new(Vec::new()));

    // The first caller holds the key until released
    let (release, hold) = oneshot::channel::<()>();
    let first = {
        let serializer = serializer.clone();
        let key = key.clone();
        let order = order.clone();
        tokio::spawn(async move {
            serializer
                .invoke(&key, || async move {
                    let _ = hold.await;
                    order.lock().unwrap().push(0);
                })
                .await
        })
    };
    wait_for_pending(&serializer, &key, 1).await;

    let mut waiters = Vec::new();
    for i in 1..=4 {
        let serializer_clone = serializer.clone();
        let key_clone = key.clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            serializer_clone
                .invoke(&key_clone, || async move {
                    order.lock().unwrap().push(i);
                })
                .await
        }));
        wait_for_pending(&serializer, &key, i + 1).await;
    }

    release.send(()).unwrap();
    first.await.unwrap();
    for waiter in waiters {
        waiter.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(serializer.active_keys(), 0);
}

#[tokio::test]
async fn test_distinct_keys_overlap() {
    let serializer: KeyedSerializer<String> = KeyedSerializer::new();
    let (a_entered_tx, a_entered_rx) = oneshot::channel::<()>();
    let (b_entered_tx, b_entered_rx) = oneshot::channel::<()>();

    // Each handler waits for the other to enter: only possible if both run at once
    let a = {
        let serializer = serializer.clone();
        tokio::spawn(async move {
            serializer
                .invoke(&"trial-a".to_string(), || async move {
                    a_entered_tx.send(()).unwrap();
                    b_entered_rx.await.unwrap();
                })
                .await
        })
    };
    let b = {
        let serializer = serializer.clone();
        tokio::spawn(async move {
            serializer
                .invoke(&"trial-b".to_string(), || async move {
                    b_entered_tx.send(()).unwrap();
                    a_entered_rx.await.unwrap();
                })
                .await
        })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        a.await.unwrap();
        b.await.unwrap();
    })
    .await
    .expect("handlers for different keys should run concurrently");
}

#[tokio::test]
async fn test_concurrent_updates_with_same_version_one_wins() {
    let store = Arc::new(InMemoryTrialStore::new());
    let trial = commands::create_trial(store.as_ref(), "T1", "Phase I").await.unwrap();
    let service = TrialMetadataService::new(store.clone(), KeyedSerializer::new());

    let update = UpdateTrialMetadata {
        phase: Some("Phase II".to_string()),
        expected_version: Some(trial.version),
        ..Default::default()
    };
    let (first, second) = tokio::join!(
        service.update_metadata(trial.id, update.clone()),
        service.update_metadata(trial.id, update),
    );

    let outcomes = [first, second];
    let winners: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
    let stale = outcomes
        .iter()
        .filter(|o| matches!(o, Err(OnboardingError::StaleData(_))))
        .count();
    assert_eq!(winners.len(), 1);
    assert_eq!(stale, 1);
    assert_eq!(winners[0].version, trial.version + 1);

    let stored = store.get_trial(trial.id).await.unwrap().unwrap();
    assert_eq!(stored.phase, "Phase II");
    assert_eq!(stored.version, trial.version + 1);
}

#[tokio::test]
async fn test_stale_timestamp_is_rejected() {
    let store = Arc::new(InMemoryTrialStore::new());
    let trial = commands::create_trial(store.as_ref(), "T1", "Phase I").await.unwrap();
    let service = TrialMetadataService::new(store.clone(), KeyedSerializer::new());

    service
        .update_metadata(
            trial.id,
            UpdateTrialMetadata {
                name: Some("T1 renamed".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = service
        .update_metadata(
            trial.id,
            UpdateTrialMetadata {
                name: Some("T1 again".to_string()),
                expected_updated_at: Some(trial.updated_at),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OnboardingError::StaleData(_)));

    let stored = store.get_trial(trial.id).await.unwrap().unwrap();
    assert_eq!(stored.name, "T1 renamed");
}

#[tokio::test]
async fn test_update_of_missing_trial_is_not_found() {
    let service = TrialMetadataService::new(Arc::new(InMemoryTrialStore::new()), KeyedSerializer::new());

    let err = service
        .update_metadata(99, UpdateTrialMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OnboardingError::NotFound { .. }));
}

#[tokio::test]
async fn test_burst_of_updates_versions_advance_one_at_a_time() {
    let store = Arc::new(InMemoryTrialStore::new());
    let trial = commands::create_trial(store.as_ref(), "T1", "Phase I").await.unwrap();
    let service = TrialMetadataService::new(store.clone(), KeyedSerializer::new());

    let updates = (0..10).map(|i| {
        service.update_metadata(
            trial.id,
            UpdateTrialMetadata {
                name: Some(format!("T1 rev {i}")),
                ..Default::default()
            },
        )
    });
    let results = futures::future::join_all(updates).await;

    let mut versions: Vec<u64> = results.into_iter().map(|r| r.unwrap().version).collect();
    versions.sort_unstable();
    let expected: Vec<u64> = (trial.version + 1..=trial.version + 10).collect();
    assert_eq!(versions, expected);
    assert_eq!(service.serializer().active_keys(), 0);
}
