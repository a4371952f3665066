use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::fs;
use tracing::{debug, info};

use crate::errors::JournalError;
use crate::workflow::progress::OnboardTrialStatus;

/// One memoized step result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub step: String,
    pub value: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Durable record of a workflow instance: its status and every memoized step,
/// in the order the steps first completed. Entries are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    pub workflow_id: String,
    pub status: Option<OnboardTrialStatus>,
    /// Step the workflow was working on when it last persisted
    pub current_step: Option<String>,
    pub entries: Vec<JournalEntry>,
    /// Final result once the workflow has finished, success or not
    pub result: Option<serde_json::Value>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Journal {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            status: None,
            current_step: None,
            entries: Vec::new(),
            result: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn get(&self, step: &str) -> Option<&serde_json::Value> {
        self.entries.iter().find(|e| e.step == step).map(|e| &e.value)
    }

    pub fn contains(&self, step: &str) -> bool {
        self.get(step).is_some()
    }

    /// Append a step result. An existing entry is never overwritten.
    pub fn record(&mut self, step: &str, value: serde_json::Value) -> bool {
        if self.contains(step) {
            return false;
        }
        let now = Utc::now();
        self.entries.push(JournalEntry {
            step: step.to_string(),
            value,
            recorded_at: now,
        });
        self.updated_at = now;
        true
    }

    pub fn step_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.step.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some()
    }
}

/// Narrow persistence boundary for workflow journals
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JournalStore: Send + Sync {
    async fn load(&self, workflow_id: &str) -> Result<Option<Journal>, JournalError>;

    async fn save(&self, journal: &Journal) -> Result<(), JournalError>;
}

#[derive(Debug, Default)]
pub struct InMemoryJournalStore {
    journals: Mutex<HashMap<String, Journal>>,
}

impl InMemoryJournalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn journals(&self) -> MutexGuard<'_, HashMap<String, Journal>> {
        self.journals.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JournalStore for InMemoryJournalStore {
    async fn load(&self, workflow_id: &str) -> Result<Option<Journal>, JournalError> {
        Ok(self.journals().get(workflow_id).cloned())
    }

    async fn save(&self, journal: &Journal) -> Result<(), JournalError> {
        self.journals().insert(journal.workflow_id.clone(), journal.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub checkpoint_id: String,
    pub pid: Option<u32>,
    pub hostname: String,
    pub persisted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedJournal {
    journal: Journal,
    checkpoint: CheckpointMetadata,
}

/// One pretty-printed JSON file per workflow under `directory`.
#[derive(Debug, Clone)]
pub struct FileJournalStore {
    directory: PathBuf,
}

impl FileJournalStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn journal_path(&self, workflow_id: &str) -> Result<PathBuf, JournalError> {
        let valid = !workflow_id.is_empty()
            && workflow_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(JournalError::Corruption {
                workflow_id: workflow_id.to_string(),
                reason: "workflow id is not usable as a file name".to_string(),
            });
        }
        Ok(self.directory.join(format!("{workflow_id}.json")))
    }
}

#[async_trait]
impl JournalStore for FileJournalStore {
    async fn load(&self, workflow_id: &str) -> Result<Option<Journal>, JournalError> {
        let path = self.journal_path(workflow_id)?;
        if !fs::try_exists(&path).await? {
            debug!(workflow_id, file = ?path, "No journal file found");
            return Ok(None);
        }

        let contents = fs::read_to_string(&path).await?;
        let persisted: PersistedJournal = serde_json::from_str(&contents)?;
        if persisted.journal.workflow_id != workflow_id {
            return Err(JournalError::Corruption {
                workflow_id: workflow_id.to_string(),
                reason: format!("file belongs to workflow {}", persisted.journal.workflow_id),
            });
        }

        debug!(
            workflow_id,
            checkpoint_id = %persisted.checkpoint.checkpoint_id,
            entries = persisted.journal.entries.len(),
            "Journal loaded"
        );
        Ok(Some(persisted.journal))
    }

    async fn save(&self, journal: &Journal) -> Result<(), JournalError> {
        let path = self.journal_path(&journal.workflow_id)?;
        fs::create_dir_all(&self.directory).await?;

        let checkpoint_id = format!("{}_{}", Utc::now().timestamp(), rand::rng().random::<u32>());
        let persisted = PersistedJournal {
            journal: journal.clone(),
            checkpoint: CheckpointMetadata {
                checkpoint_id: checkpoint_id.clone(),
                pid: std::process::id().into(),
                hostname: hostname::get()
                    .unwrap_or_default()
                    .to_string_lossy()
                    .to_string(),
                persisted_at: Utc::now(),
            },
        };
        let serialized = serde_json::to_string_pretty(&persisted)?;

        // Write to a temporary file first, then rename over the old journal
        let temp_file = path.with_extension("json.tmp");
        fs::write(&temp_file, serialized).await?;
        fs::rename(&temp_file, &path).await?;

        info!(
            workflow_id = %journal.workflow_id,
            checkpoint_id = %checkpoint_id,
            entries = journal.entries.len(),
            file = ?path,
            "Journal saved"
        );
        Ok(())
    }
}
