pub mod commands;
pub mod metadata;
pub mod repository;
pub mod types;
pub mod validation;

pub use metadata::TrialMetadataService;
pub use repository::{InMemoryTrialStore, TrialRepository};
pub use types::*;
