use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Install the global tracing subscriber.
///
/// JSON output carries the current span and span list so `workflow_id` /
/// `saga_id` fields appear on every line logged inside an orchestration.
/// `RUST_LOG` overrides the configured level. Logs go to stderr; stdout is
/// reserved for command output.
pub fn init_telemetry(settings: &ObservabilityConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&settings.log_level))?;

    if settings.json_logs {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .try_init()?;
    }

    tracing::info!("Trial onboarding telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn create_workflow_span(workflow_id: &str, attempt: u32) -> tracing::Span {
    tracing::info_span!(
        "workflow",
        workflow.id = workflow_id,
        attempt = attempt,
        otel.kind = "internal"
    )
}

pub fn create_saga_span(saga_id: &str) -> tracing::Span {
    tracing::info_span!("saga", saga.id = saga_id, otel.kind = "internal")
}

/// Span for a single serialized invocation outside any workflow
pub fn create_operation_span(operation: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "operation",
        operation = operation,
        correlation.id = correlation_id,
        otel.kind = "internal"
    )
}
