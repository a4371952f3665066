#[cfg(feature = "database")]
use anyhow::Result;
#[cfg(feature = "database")]
use async_trait::async_trait;
#[cfg(feature = "database")]
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Row, SqlitePool};
#[cfg(feature = "database")]
use tracing::info;

#[cfg(feature = "database")]
use crate::errors::{JournalError, OnboardingError};
#[cfg(feature = "database")]
use crate::saga::record::{SagaId, SagaRecord, SagaRecordStore, SagaState};
#[cfg(feature = "database")]
use crate::workflow::journal::{Journal, JournalStore};

#[cfg(feature = "database")]
/// Database manager for persistent orchestration state
pub struct DatabaseManager {
    pool: SqlitePool,
}

#[cfg(feature = "database")]
impl DatabaseManager {
    /// Initialize database with automatic migrations
    pub async fn new(database_url: &str, max_connections: u32, auto_migrate: bool) -> Result<Self> {
        if !sqlx::Sqlite::database_exists(database_url).await? {
            info!("Creating database at {}", database_url);
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;

        if auto_migrate {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    /// Get database pool for queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn journal_store(&self) -> SqliteJournalStore {
        SqliteJournalStore {
            pool: self.pool.clone(),
        }
    }

    pub fn saga_record_store(&self) -> SqliteSagaRecordStore {
        SqliteSagaRecordStore {
            pool: self.pool.clone(),
        }
    }

    /// Close database connections gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }
}

#[cfg(feature = "database")]
fn backend(err: sqlx::Error) -> JournalError {
    JournalError::Backend(err.to_string())
}

#[cfg(feature = "database")]
/// Journal rows hold the whole journal as JSON; status and attempts are
/// copied out for querying.
#[derive(Debug, Clone)]
pub struct SqliteJournalStore {
    pool: SqlitePool,
}

#[cfg(feature = "database")]
#[async_trait]
impl JournalStore for SqliteJournalStore {
    async fn load(&self, workflow_id: &str) -> Result<Option<Journal>, JournalError> {
        let row = sqlx::query("SELECT journal FROM workflow_journals WHERE workflow_id = ?1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.get("journal");
        let journal: Journal = serde_json::from_str(&raw)?;
        if journal.workflow_id != workflow_id {
            return Err(JournalError::Corruption {
                workflow_id: workflow_id.to_string(),
                reason: format!("row holds journal for '{}'", journal.workflow_id),
            });
        }
        Ok(Some(journal))
    }

    async fn save(&self, journal: &Journal) -> Result<(), JournalError> {
        let raw = serde_json::to_string(journal)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO workflow_journals (workflow_id, status, attempts, journal, updated_at)
            VALUES (?1, ?2, ?3, ?4, datetime('now'))
            "#,
        )
        .bind(&journal.workflow_id)
        .bind(journal.status.map(|s| s.as_str()))
        .bind(journal.attempts as i64)
        .bind(raw)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}

#[cfg(feature = "database")]
#[derive(Debug, Clone)]
pub struct SqliteSagaRecordStore {
    pool: SqlitePool,
}

#[cfg(feature = "database")]
fn parse_state(raw: &str) -> Result<SagaState, OnboardingError> {
    match raw {
        "STARTED" => Ok(SagaState::Started),
        "SITES_ADDED" => Ok(SagaState::SitesAdded),
        "COMPLETED" => Ok(SagaState::Completed),
        "ERROR" => Ok(SagaState::Error),
        other => Err(OnboardingError::unexpected(format!("unknown saga state '{other}'"))),
    }
}

#[cfg(feature = "database")]
fn transient(err: sqlx::Error) -> OnboardingError {
    OnboardingError::Transient(err.to_string())
}

#[cfg(feature = "database")]
#[async_trait]
impl SagaRecordStore for SqliteSagaRecordStore {
    async fn load(&self, id: SagaId) -> Result<Option<SagaRecord>, OnboardingError> {
        let row = sqlx::query(
            r#"
            SELECT saga_id, trial_id, state, error, created_at, updated_at
            FROM saga_records
            WHERE saga_id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let trial_id: Option<i64> = row.get("trial_id");
        let state: String = row.get("state");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        let timestamp = |raw: &str| {
            chrono::DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&chrono::Utc))
                .map_err(|e| OnboardingError::unexpected(format!("bad saga timestamp '{raw}': {e}")))
        };

        Ok(Some(SagaRecord {
            id,
            trial_id: trial_id.map(|t| t as u64),
            state: parse_state(&state)?,
            error: row.get("error"),
            created_at: timestamp(&created_at)?,
            updated_at: timestamp(&updated_at)?,
        }))
    }

    async fn save(&self, record: &SagaRecord) -> Result<(), OnboardingError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO saga_records (saga_id, trial_id, state, error, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.trial_id.map(|t| t as i64))
        .bind(record.state.as_str())
        .bind(record.error.as_deref())
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }
}

#[cfg(feature = "database")]
static DB_MANAGER: std::sync::LazyLock<std::sync::Arc<tokio::sync::RwLock<Option<DatabaseManager>>>> =
    std::sync::LazyLock::new(|| std::sync::Arc::new(tokio::sync::RwLock::new(None)));

#[cfg(feature = "database")]
/// Initialize the global database manager from configuration
pub async fn init_database() -> Result<()> {
    let config = crate::config::config()?;

    if let Some(db_config) = &config.database {
        info!("Initializing database at {}", db_config.url);

        let manager = DatabaseManager::new(&db_config.url, db_config.max_connections, db_config.auto_migrate).await?;

        let mut db_guard = DB_MANAGER.write().await;
        *db_guard = Some(manager);

        info!("Database manager initialized successfully");
    } else {
        info!("Database not configured, skipping initialization");
    }

    Ok(())
}

#[cfg(feature = "database")]
/// Journal store backed by the global database, if it was initialized
pub async fn journal_store() -> Option<SqliteJournalStore> {
    DB_MANAGER.read().await.as_ref().map(DatabaseManager::journal_store)
}

#[cfg(feature = "database")]
/// Shutdown database connections
pub async fn shutdown_database() {
    let db_guard = DB_MANAGER.read().await;
    if let Some(ref manager) = *db_guard {
        manager.shutdown().await;
    }
}

// Stub implementations for when database feature is not enabled
#[cfg(not(feature = "database"))]
pub async fn init_database() -> anyhow::Result<()> {
    tracing::info!("Database feature not enabled, skipping database initialization");
    Ok(())
}

#[cfg(not(feature = "database"))]
pub async fn shutdown_database() {
    tracing::info!("Database feature not enabled, no database to shutdown");
}
