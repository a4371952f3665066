pub mod compensation;
pub mod executor;
pub mod onboarding;
pub mod record;

pub use compensation::{Compensate, CompensationEntry, CompensationStack, UnwindReport};
pub use executor::{NoopObserver, SagaExecutor, SagaFailure, SagaObserver, SagaOutcome, SagaStatus, Step};
pub use onboarding::{OnboardTrialSyncResponse, OnboardingSaga};
pub use record::{InMemorySagaRecordStore, SagaId, SagaRecord, SagaRecordStore, SagaState};
