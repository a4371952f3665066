use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use trial_onboarding::config::{config, init_config, JournalBackend, OnboardingConfig};
use trial_onboarding::observability::orchestration_metrics;
use trial_onboarding::saga::{InMemorySagaRecordStore, OnboardingSaga};
use trial_onboarding::serializer::KeyedSerializer;
use trial_onboarding::telemetry::init_telemetry;
use trial_onboarding::trials::{commands, InMemoryTrialStore, TrialMetadataService, TrialRepository};
use trial_onboarding::trials::{OnboardTrialInput, SiteInput, UpdateTrialMetadata};
use trial_onboarding::workflow::{
    FileJournalStore, InMemoryJournalStore, JournalStore, LocalRuntime, ProgressBroadcaster, WorkflowExecutor,
};

#[derive(Parser)]
#[command(name = "trial-onboarding")]
#[command(about = "Clinical trial onboarding with saga compensation and durable workflows")]
#[command(long_about = "Onboards a clinical trial (trial record, initial protocol version, site \
                       registrations) either as a blocking saga that undoes completed steps on \
                       failure, or as a durable workflow that streams progress events.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Onboard a trial with the blocking saga and print the response
    Onboard {
        #[command(flatten)]
        trial: TrialArgs,
    },
    /// Onboard a trial as a durable workflow and stream its progress
    OnboardAsync {
        #[command(flatten)]
        trial: TrialArgs,
        /// Reuse a workflow id, resuming it if its journal is persisted
        #[arg(long, help = "Workflow id to start or resume (generated when omitted)")]
        workflow_id: Option<String>,
    },
    /// Show the persisted status of a durable workflow
    WorkflowStatus {
        /// Workflow id returned by onboard-async
        workflow_id: String,
    },
    /// Race two metadata updates that expect the same trial version
    Race {
        #[arg(long, help = "Trial name")]
        name: String,
        #[arg(long, help = "Initial phase")]
        phase: String,
        #[arg(long, help = "Phase both updates try to move the trial to")]
        new_phase: String,
    },
}

#[derive(clap::Args)]
struct TrialArgs {
    #[arg(long, help = "Trial name")]
    name: String,
    #[arg(long, help = "Trial phase: Phase I, Phase II, Phase III or Phase IV")]
    phase: String,
    #[arg(long, default_value = "v1.0", help = "Initial protocol version")]
    protocol: String,
    #[arg(long = "site", value_parser = parse_site, help = "Site as NAME:COUNTRY (repeatable)")]
    sites: Vec<SiteInput>,
}

impl TrialArgs {
    fn into_input(self) -> OnboardTrialInput {
        OnboardTrialInput {
            name: self.name,
            phase: self.phase,
            initial_protocol_version: self.protocol,
            sites: self.sites,
        }
    }
}

fn parse_site(raw: &str) -> Result<SiteInput, String> {
    match raw.rsplit_once(':') {
        Some((name, country)) if !name.trim().is_empty() && !country.trim().is_empty() => {
            Ok(SiteInput::new(name.trim(), country.trim()))
        }
        _ => Err(format!("expected NAME:COUNTRY, got '{raw}'")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_config()?;
    let settings = config()?;
    init_telemetry(&settings.observability)?;

    let result = tokio::runtime::Runtime::new()?.block_on(async {
        match cli.command {
            Commands::Onboard { trial } => onboard_command(trial.into_input()).await,
            Commands::OnboardAsync { trial, workflow_id } => {
                onboard_async_command(settings, trial.into_input(), workflow_id).await
            }
            Commands::WorkflowStatus { workflow_id } => workflow_status_command(settings, &workflow_id).await,
            Commands::Race { name, phase, new_phase } => race_command(&name, &phase, &new_phase).await,
        }
    });

    if settings.observability.metrics_enabled {
        orchestration_metrics().log_stats();
    }
    result
}

async fn onboard_command(input: OnboardTrialInput) -> Result<()> {
    let store = Arc::new(InMemoryTrialStore::new());
    let saga = OnboardingSaga::new(store.clone(), Arc::new(InMemorySagaRecordStore::new()));

    let response = saga.run(input).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    let record = saga.onboarding_status(response.saga_id).await?;
    info!(saga_id = %record.id, state = record.state.as_str(), "Saga finished");
    let counts = store.counts().await?;
    info!(
        trials = counts.trials,
        protocols = counts.protocols,
        trial_sites = counts.trial_sites,
        "Store contents after saga"
    );
    Ok(())
}

async fn journal_store(settings: &OnboardingConfig) -> Result<Arc<dyn JournalStore>> {
    match settings.persistence.journal_backend {
        JournalBackend::Memory => Ok(Arc::new(InMemoryJournalStore::new())),
        JournalBackend::File => Ok(Arc::new(FileJournalStore::new(
            settings.persistence.journal_directory.clone(),
        ))),
        JournalBackend::Sqlite => sqlite_journal_store().await,
    }
}

#[cfg(feature = "database")]
async fn sqlite_journal_store() -> Result<Arc<dyn JournalStore>> {
    trial_onboarding::database::init_database().await?;
    match trial_onboarding::database::journal_store().await {
        Some(store) => Ok(Arc::new(store)),
        None => bail!("journal_backend = \"sqlite\" requires a [database] section"),
    }
}

#[cfg(not(feature = "database"))]
async fn sqlite_journal_store() -> Result<Arc<dyn JournalStore>> {
    bail!("journal_backend = \"sqlite\" requires building with the `database` feature")
}

fn runtime(settings: &OnboardingConfig, journals: Arc<dyn JournalStore>) -> LocalRuntime {
    let progress = ProgressBroadcaster::new();
    let executor = WorkflowExecutor::new(
        Arc::new(InMemoryTrialStore::new()),
        journals,
        Arc::new(progress.clone()),
        settings.workflow.settings(),
    );
    LocalRuntime::new(Arc::new(executor), progress, settings.workflow.retry_policy())
}

async fn onboard_async_command(
    settings: &OnboardingConfig,
    input: OnboardTrialInput,
    workflow_id: Option<String>,
) -> Result<()> {
    let runtime = runtime(settings, journal_store(settings).await?);

    let (started, subscription) = match workflow_id {
        Some(id) => {
            let subscription = runtime.progress().subscribe(&id);
            (runtime.submit(&id, input), subscription)
        }
        None => runtime.start_onboarding_subscribed(input),
    };
    println!("{}", serde_json::to_string(&started)?);

    let subscription_id = subscription.id();
    let printer = tokio::spawn(async move {
        let mut subscription = subscription;
        while let Some(event) = subscription.recv().await {
            println!("{}", serde_json::to_string(&event)?);
            if event.status.is_terminal() {
                break;
            }
        }
        anyhow::Ok(())
    });

    let result = runtime.wait(&started.workflow_id).await;
    // A finished workflow replays without publishing; closing the channel
    // lets the printer drain what was sent and stop.
    runtime.progress().unsubscribe(&started.workflow_id, subscription_id);
    printer.await??;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    database_shutdown().await;
    Ok(())
}

async fn workflow_status_command(settings: &OnboardingConfig, workflow_id: &str) -> Result<()> {
    if settings.persistence.journal_backend == JournalBackend::Memory {
        bail!("workflow-status needs a persistent journal backend (file or sqlite)");
    }
    let runtime = runtime(settings, journal_store(settings).await?);
    let status = runtime.workflow_status(workflow_id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    database_shutdown().await;
    Ok(())
}

async fn database_shutdown() {
    trial_onboarding::database::shutdown_database().await;
}

async fn race_command(name: &str, phase: &str, new_phase: &str) -> Result<()> {
    let store = Arc::new(InMemoryTrialStore::new());
    let trial = commands::create_trial(store.as_ref(), name, phase).await?;
    let service = TrialMetadataService::new(store, KeyedSerializer::new());

    let update = UpdateTrialMetadata {
        phase: Some(new_phase.to_string()),
        expected_version: Some(trial.version),
        ..Default::default()
    };
    let (first, second) = tokio::join!(
        service.update_metadata(trial.id, update.clone()),
        service.update_metadata(trial.id, update),
    );

    for (label, outcome) in [("first", first), ("second", second)] {
        match outcome {
            Ok(response) => println!("{label}: {}", serde_json::to_string(&response)?),
            Err(err) => println!("{label}: rejected ({}): {err}", err.kind()),
        }
    }
    Ok(())
}
