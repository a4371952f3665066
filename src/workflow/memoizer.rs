// Exactly-once step results for one workflow instance
//
// A step runs only if its name has no journal entry; its result is persisted
// before the caller sees it. On re-invocation the recorded value is returned
// and the side effect is skipped. Names must be derived from constants and
// loop indices so replays line up with the journal.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::classification::{Classified, ClassifyExt};
use crate::errors::OnboardingError;
use crate::observability::orchestration_metrics;
use crate::workflow::journal::{Journal, JournalStore};
use crate::workflow::progress::OnboardTrialStatus;

pub struct StepMemoizer {
    journal: Journal,
    store: Arc<dyn JournalStore>,
    /// Names already used during this invocation
    seen: HashSet<String>,
    replayed: usize,
    executed: usize,
}

impl StepMemoizer {
    pub fn new(journal: Journal, store: Arc<dyn JournalStore>) -> Self {
        Self {
            journal,
            store,
            seen: HashSet::new(),
            replayed: 0,
            executed: 0,
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn workflow_id(&self) -> &str {
        &self.journal.workflow_id
    }

    /// Steps served from the journal during this invocation
    pub fn replayed(&self) -> usize {
        self.replayed
    }

    /// Steps actually executed during this invocation
    pub fn executed(&self) -> usize {
        self.executed
    }

    /// Return the recorded result of `step`, or run `f` and record its result.
    ///
    /// Errors from `f` are classified and nothing is recorded for the step, so
    /// a retried invocation runs it again.
    pub async fn once<T, F, Fut>(&mut self, step: &str, f: F) -> Result<T, Classified<OnboardingError>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OnboardingError>>,
    {
        if !self.seen.insert(step.to_string()) {
            return Err(Classified::Terminal(OnboardingError::unexpected(format!(
                "step name '{step}' used twice in workflow {}",
                self.journal.workflow_id
            ))));
        }

        if let Some(recorded) = self.journal.get(step) {
            let value = serde_json::from_value(recorded.clone())
                .map_err(OnboardingError::from)
                .classified()?;
            self.replayed += 1;
            orchestration_metrics().record_memoized_replay();
            debug!(workflow_id = %self.journal.workflow_id, step, "Replaying memoized step");
            return Ok(value);
        }

        let value = f().await.classified()?;
        let encoded = serde_json::to_value(&value).map_err(OnboardingError::from).classified()?;
        self.journal.record(step, encoded);
        self.persist().await?;
        self.executed += 1;
        debug!(workflow_id = %self.journal.workflow_id, step, "Step recorded");
        Ok(value)
    }

    /// Durable timer: sleeps once, and never again on replay.
    pub async fn sleep(&mut self, step: &str, duration: Duration) -> Result<(), Classified<OnboardingError>> {
        self.once(step, || async move {
            if !duration.is_zero() {
                tokio::time::sleep(duration).await;
            }
            Ok(())
        })
        .await
    }

    /// Note the step in progress; persisted with the next write.
    pub fn begin_step(&mut self, step: &str) {
        self.journal.current_step = Some(step.to_string());
    }

    pub fn current_step(&self) -> Option<&str> {
        self.journal.current_step.as_deref()
    }

    pub async fn set_status(&mut self, status: OnboardTrialStatus) -> Result<(), Classified<OnboardingError>> {
        if self.journal.status == Some(status) {
            return Ok(());
        }
        self.journal.status = Some(status);
        self.persist().await
    }

    /// Stamp the final result and persist. A finished journal short-circuits
    /// every later invocation.
    pub async fn finish<R: Serialize>(
        &mut self,
        status: OnboardTrialStatus,
        result: &R,
    ) -> Result<(), Classified<OnboardingError>> {
        self.journal.status = Some(status);
        self.journal.result = Some(serde_json::to_value(result).map_err(OnboardingError::from).classified()?);
        self.persist().await
    }

    pub async fn begin_attempt(&mut self) -> Result<u32, Classified<OnboardingError>> {
        self.journal.attempts += 1;
        self.persist().await?;
        Ok(self.journal.attempts)
    }

    pub async fn persist(&mut self) -> Result<(), Classified<OnboardingError>> {
        self.journal.updated_at = chrono::Utc::now();
        self.store
            .save(&self.journal)
            .await
            .map_err(OnboardingError::from)
            .classified()
    }
}

impl std::fmt::Debug for StepMemoizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepMemoizer")
            .field("workflow_id", &self.journal.workflow_id)
            .field("entries", &self.journal.len())
            .field("replayed", &self.replayed)
            .field("executed", &self.executed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::JournalError;
    use crate::workflow::journal::{InMemoryJournalStore, MockJournalStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_second_invocation_replays_instead_of_running() {
        let store = Arc::new(InMemoryJournalStore::new());
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let journal = store.load("wf-1").await.unwrap().unwrap_or_else(|| Journal::new("wf-1"));
            let mut memo = StepMemoizer::new(journal, store.clone());
            let calls = calls.clone();
            let id: u64 = memo
                .once("create_trial", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
            assert_eq!(id, 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_step_is_not_recorded() {
        let store = Arc::new(InMemoryJournalStore::new());
        let mut memo = StepMemoizer::new(Journal::new("wf-1"), store.clone());

        let err = memo
            .once::<u64, _, _>("add_protocol", || async { Err(OnboardingError::Network("reset".into())) })
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(!memo.journal().contains("add_protocol"));
    }

    #[tokio::test]
    async fn test_duplicate_name_in_one_run_is_terminal() {
        let store = Arc::new(InMemoryJournalStore::new());
        let mut memo = StepMemoizer::new(Journal::new("wf-1"), store);

        memo.once("register_site_1", || async { Ok(1u64) }).await.unwrap();
        let err = memo.once("register_site_1", || async { Ok(2u64) }).await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_memoized() {
        let store = Arc::new(InMemoryJournalStore::new());
        let mut memo = StepMemoizer::new(Journal::new("wf-1"), store.clone());

        let started = tokio::time::Instant::now();
        memo.sleep("delay_create_trial", Duration::from_secs(2)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));

        // Replay does not wait again
        let journal = store.load("wf-1").await.unwrap().unwrap();
        let mut replay = StepMemoizer::new(journal, store);
        let resumed = tokio::time::Instant::now();
        replay.sleep("delay_create_trial", Duration::from_secs(2)).await.unwrap();
        assert_eq!(resumed.elapsed(), Duration::ZERO);
        assert_eq!(replay.replayed(), 1);
    }

    #[tokio::test]
    async fn test_journal_write_failure_is_transient() {
        let mut store = MockJournalStore::new();
        store
            .expect_save()
            .returning(|_| Err(JournalError::Backend("database is locked".to_string())));

        let mut memo = StepMemoizer::new(Journal::new("wf-1"), Arc::new(store));
        let err = memo.once("create_trial", || async { Ok(1u64) }).await.unwrap_err();
        assert!(err.is_transient());
    }
}
