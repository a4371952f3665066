// Serialized, version-checked trial metadata updates
//
// One logical object per trial id: every update for the same trial runs
// through the keyed serializer, and the handler itself rejects stale
// expectations before touching the repository.

use std::sync::Arc;
use tracing::{info, warn, Instrument};

use crate::errors::OnboardingError;
use crate::observability::{orchestration_metrics, OperationTimer};
use crate::serializer::KeyedSerializer;
use crate::telemetry::{create_operation_span, generate_correlation_id};
use crate::trials::commands;
use crate::trials::repository::TrialRepository;
use crate::trials::types::{TrialId, UpdateTrialMetadata, UpdateTrialMetadataResponse};

#[derive(Clone)]
pub struct TrialMetadataService {
    repo: Arc<dyn TrialRepository>,
    serializer: KeyedSerializer<TrialId>,
}

impl TrialMetadataService {
    pub fn new(repo: Arc<dyn TrialRepository>, serializer: KeyedSerializer<TrialId>) -> Self {
        Self { repo, serializer }
    }

    pub fn serializer(&self) -> &KeyedSerializer<TrialId> {
        &self.serializer
    }

    /// Apply `update` to `trial_id` once every earlier update for it has finished.
    pub async fn update_metadata(
        &self,
        trial_id: TrialId,
        update: UpdateTrialMetadata,
    ) -> Result<UpdateTrialMetadataResponse, OnboardingError> {
        let repo = Arc::clone(&self.repo);
        let timer = OperationTimer::new("update_trial_metadata");
        let result = self
            .serializer
            .invoke(&trial_id, || async move {
                commands::update_trial_metadata(repo.as_ref(), trial_id, &update).await
            })
            .instrument(create_operation_span("update_trial_metadata", &generate_correlation_id()))
            .await;
        timer.finish();

        match &result {
            Ok(response) => {
                info!(trial_id, version = response.version, "Serialized metadata update applied");
            }
            Err(OnboardingError::StaleData(message)) => {
                orchestration_metrics().record_stale_rejection();
                warn!(trial_id, reason = %message, "Rejected stale metadata update");
            }
            Err(err) => {
                warn!(trial_id, error = %err, "Metadata update failed");
            }
        }
        result
    }
}

impl std::fmt::Debug for TrialMetadataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialMetadataService")
            .field("serializer", &self.serializer)
            .finish_non_exhaustive()
    }
}
