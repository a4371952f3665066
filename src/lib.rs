// Trial Onboarding Library - saga and durable-workflow orchestration
// This exposes the core components for testing and integration

pub mod classification;
pub mod config;
pub mod database;
pub mod errors;
pub mod observability;
pub mod saga;
pub mod serializer;
pub mod telemetry;
pub mod trials;
pub mod versioning;
pub mod workflow;

// Re-export key types for easy access
pub use classification::{classify, Classified, ClassifyExt, ErrorClass};
pub use config::{config, init_config, OnboardingConfig};
pub use database::{init_database, shutdown_database};
pub use errors::{JournalError, OnboardingError};
pub use observability::{orchestration_metrics, OperationTimer, OrchestrationMetrics};
pub use saga::{OnboardTrialSyncResponse, OnboardingSaga, SagaRecord, SagaState};
pub use serializer::KeyedSerializer;
pub use telemetry::{create_saga_span, create_workflow_span, generate_correlation_id, init_telemetry};
pub use trials::{
    InMemoryTrialStore, OnboardTrialInput, SiteInput, TrialMetadataService, TrialRepository, UpdateTrialMetadata,
};
pub use workflow::{
    LocalRuntime, OnboardTrialStatus, ProgressBroadcaster, ProgressEvent, StartOnboardingResponse, WorkflowExecutor,
    WorkflowResult,
};
