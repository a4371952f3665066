// Compensation stack for saga unwinding
//
// Entries are plain values carrying the ids captured when the forward step
// ran. They are appended in forward order and consumed LIFO, so a step whose
// records depend on an earlier step's records is always undone first.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::errors::OnboardingError;
use crate::observability::orchestration_metrics;

/// An action that semantically undoes one completed forward step.
#[async_trait]
pub trait Compensate<C: ?Sized + Sync>: Send + Sync {
    /// Name reported in compensation errors, e.g. `unregister_site_2`
    fn name(&self) -> String;

    async fn compensate(&self, ctx: &C) -> Result<(), OnboardingError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationEntry<A> {
    /// Forward step that produced this entry
    pub step_name: String,
    pub action: A,
}

/// Result of a best-effort unwind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnwindReport {
    /// Compensations that ran to completion, in the order they ran
    pub compensated: Vec<String>,
    /// `"<name>: <error>"` for every compensation that failed
    pub errors: Vec<String>,
}

impl UnwindReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// LIFO list of compensations owned by a single saga invocation.
#[derive(Debug)]
pub struct CompensationStack<A> {
    entries: Vec<CompensationEntry<A>>,
}

impl<A> Default for CompensationStack<A> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<A> CompensationStack<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step_name: impl Into<String>, action: A) {
        self.entries.push(CompensationEntry {
            step_name: step_name.into(),
            action,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in the order they will be unwound.
    pub fn pending(&self) -> impl Iterator<Item = &CompensationEntry<A>> {
        self.entries.iter().rev()
    }

    /// Run every compensation in reverse order.
    ///
    /// A failing compensation is recorded and the unwind carries on with the
    /// next entry; nothing here returns early.
    pub async fn unwind<C>(self, ctx: &C) -> UnwindReport
    where
        C: ?Sized + Sync,
        A: Compensate<C>,
    {
        let mut report = UnwindReport::default();

        for entry in self.entries.into_iter().rev() {
            let name = entry.action.name();
            match entry.action.compensate(ctx).await {
                Ok(()) => {
                    info!(compensation = %name, step = %entry.step_name, "Compensation applied");
                    report.compensated.push(name);
                }
                Err(e) => {
                    orchestration_metrics().record_compensation_failure();
                    warn!(compensation = %name, step = %entry.step_name, error = %e, "Compensation failed, continuing unwind");
                    report.errors.push(format!("{name}: {e}"));
                }
            }
        }

        report
    }
}
