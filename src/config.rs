use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::workflow::{RetryPolicy, WorkflowSettings};

/// Main configuration structure for trial onboarding
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OnboardingConfig {
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Durable workflow timing and retry settings
    pub workflow: WorkflowConfig,
    /// Where workflow journals live
    pub persistence: PersistenceConfig,
    /// Database settings (optional)
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level, used when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_logs: bool,
    /// Log orchestration counters on exit
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkflowConfig {
    /// Observable pause before each forward step
    pub step_delay_ms: u64,
    /// Invocations per workflow, first one included
    pub max_attempts: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalBackend {
    Memory,
    File,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PersistenceConfig {
    pub journal_backend: JournalBackend,
    /// Directory for the file backend
    pub journal_directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for OnboardingConfig {
    fn default() -> Self {
        Self {
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: true,
                metrics_enabled: true,
            },
            workflow: WorkflowConfig {
                step_delay_ms: 2_000,
                max_attempts: 5,
                base_retry_delay_ms: 500,
                max_retry_delay_ms: 30_000,
            },
            persistence: PersistenceConfig {
                journal_backend: JournalBackend::Memory,
                journal_directory: PathBuf::from(".trial-onboarding/journals"),
            },
            database: Some(DatabaseConfig {
                url: ".trial-onboarding/trial-onboarding.db".to_string(),
                max_connections: 5,
                auto_migrate: true,
            }),
        }
    }
}

impl WorkflowConfig {
    pub fn settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            step_delay: Duration::from_millis(self.step_delay_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
        }
    }
}

impl OnboardingConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (trial-onboarding.toml, .trial-onboarding-rc)
    /// 3. Environment variables (TRIAL_ONBOARDING_<SECTION>__<KEY>)
    pub fn load() -> Result<Self> {
        let mut files = Vec::new();
        if Path::new("trial-onboarding.toml").exists() {
            files.push(PathBuf::from("trial-onboarding.toml"));
        }
        if Path::new(".trial-onboarding-rc").exists() {
            files.push(PathBuf::from(".trial-onboarding-rc"));
        }
        Self::load_from(&files)
    }

    /// Defaults, then each file in order, then the environment.
    pub fn load_from(files: &[PathBuf]) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        for file in files {
            builder = builder.add_source(File::from(file.as_path()).format(config::FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("TRIAL_ONBOARDING")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<OnboardingConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = OnboardingConfig::load_env_file();
        OnboardingConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static OnboardingConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}
