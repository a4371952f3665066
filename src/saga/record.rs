use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statig::prelude::*;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::errors::OnboardingError;
use crate::trials::types::TrialId;

pub type SagaId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    Started,
    SitesAdded,
    Completed,
    Error,
}

impl SagaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Started => "STARTED",
            SagaState::SitesAdded => "SITES_ADDED",
            SagaState::Completed => "COMPLETED",
            SagaState::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Error)
    }
}

/// Persistent status of one onboarding saga, kept for status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub id: SagaId,
    pub trial_id: Option<TrialId>,
    pub state: SagaState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            trial_id: None,
            state: SagaState::Started,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for SagaRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaEvent {
    TrialCreated { trial_id: TrialId },
    SitesAdded,
    Complete,
    Fail { message: String },
}

/// Drives a [`SagaRecord`] through STARTED -> SITES_ADDED -> COMPLETED | ERROR.
///
/// Terminal states swallow every further event, so the record can never
/// move backwards within one execution.
#[derive(Debug)]
pub struct SagaLifecycle {
    record: SagaRecord,
}

impl SagaLifecycle {
    pub fn new(record: SagaRecord) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &SagaRecord {
        &self.record
    }

    fn enter(&mut self, state: SagaState) {
        self.record.state = state;
        self.record.updated_at = Utc::now();
        tracing::info!(saga_id = %self.record.id, state = state.as_str(), "Saga state changed");
    }

    fn fail(&mut self, message: &str) {
        self.record.error = Some(message.to_string());
        self.enter(SagaState::Error);
    }

    fn ignore(&self, event: &SagaEvent) {
        tracing::debug!(
            saga_id = %self.record.id,
            state = self.record.state.as_str(),
            event = ?event,
            "Ignoring event in terminal saga state"
        );
    }
}

#[state_machine(initial = "State::started()")]
impl SagaLifecycle {
    #[state]
    fn started(&mut self, event: &SagaEvent) -> Outcome<State> {
        match event {
            SagaEvent::TrialCreated { trial_id } => {
                self.record.trial_id = Some(*trial_id);
                self.record.updated_at = Utc::now();
                Handled
            }
            SagaEvent::SitesAdded => {
                self.enter(SagaState::SitesAdded);
                Transition(State::sites_added())
            }
            SagaEvent::Fail { message } => {
                self.fail(message);
                Transition(State::error())
            }
            SagaEvent::Complete => {
                tracing::warn!(saga_id = %self.record.id, "Completion requested before sites were added");
                Handled
            }
        }
    }

    #[state]
    fn sites_added(&mut self, event: &SagaEvent) -> Outcome<State> {
        match event {
            SagaEvent::Complete => {
                self.enter(SagaState::Completed);
                Transition(State::completed())
            }
            SagaEvent::Fail { message } => {
                self.fail(message);
                Transition(State::error())
            }
            _ => Handled,
        }
    }

    #[state]
    fn completed(&mut self, event: &SagaEvent) -> Outcome<State> {
        self.ignore(event);
        Handled
    }

    #[state]
    fn error(&mut self, event: &SagaEvent) -> Outcome<State> {
        self.ignore(event);
        Handled
    }
}

/// Narrow storage boundary for saga records
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SagaRecordStore: Send + Sync {
    async fn load(&self, id: SagaId) -> Result<Option<SagaRecord>, OnboardingError>;

    async fn save(&self, record: &SagaRecord) -> Result<(), OnboardingError>;
}

#[derive(Debug, Default)]
pub struct InMemorySagaRecordStore {
    records: Mutex<HashMap<SagaId, SagaRecord>>,
}

impl InMemorySagaRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<SagaId, SagaRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SagaRecordStore for InMemorySagaRecordStore {
    async fn load(&self, id: SagaId) -> Result<Option<SagaRecord>, OnboardingError> {
        Ok(self.records().get(&id).cloned())
    }

    async fn save(&self, record: &SagaRecord) -> Result<(), OnboardingError> {
        self.records().insert(record.id, record.clone());
        Ok(())
    }
}
