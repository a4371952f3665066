pub mod executor;
pub mod journal;
pub mod memoizer;
pub mod progress;
pub mod runtime;

pub use executor::{WorkflowExecutor, WorkflowResult, WorkflowSettings};
pub use journal::{FileJournalStore, InMemoryJournalStore, Journal, JournalEntry, JournalStore};
pub use memoizer::StepMemoizer;
pub use progress::{
    OnboardTrialStatus, ProgressBroadcaster, ProgressError, ProgressEvent, ProgressSink, SiteProgress,
    Subscription, TrialSnapshot,
};
pub use runtime::{LocalRuntime, RetryPolicy, StartOnboardingResponse, WorkflowStatusView};
