use std::sync::Arc;
use std::time::Duration;

use cadence_agent::executor::{AcknowledgingExecutor, ActionExecutor};
use cadence_agent::runtime::{DialogueRuntime, RuntimeStores};
use cadence_core::config::{AppConfig, ConfigError};
use cadence_core::templates::{TemplateError, TemplateLoader};
use cadence_db::{
    connect_with_settings, migrations, DbPool, SqlDialogueStateRepository,
    SqlExecutionHistoryRepository,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::executor::HttpActionExecutor;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<DialogueRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Templates(#[from] TemplateError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("action executor client could not be built: {0}")]
    Executor(#[source] reqwest::Error),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let templates = Arc::new(match &config.templates.path {
        Some(path) => TemplateLoader::load_dir(path)?,
        None => TemplateLoader::builtin()?,
    });

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let executor = build_executor(&config)?;
    info!(
        event_name = "system.bootstrap.executor_ready",
        correlation_id = "bootstrap",
        executor = executor.name(),
        "action executor ready"
    );

    let stores = RuntimeStores {
        states: Arc::new(SqlDialogueStateRepository::new(db_pool.clone())),
        history: Arc::new(SqlExecutionHistoryRepository::new(db_pool.clone())),
    };
    let runtime = Arc::new(DialogueRuntime::new(&config.dialogue, templates, stores, executor));

    Ok(Application { config, db_pool, runtime })
}

fn build_executor(config: &AppConfig) -> Result<Arc<dyn ActionExecutor>, BootstrapError> {
    match &config.executor.endpoint {
        Some(endpoint) => {
            let executor = HttpActionExecutor::new(
                endpoint.clone(),
                config.executor.auth_token.clone(),
                Duration::from_secs(config.executor.timeout_secs),
            )
            .map_err(BootstrapError::Executor)?;
            Ok(Arc::new(executor))
        }
        None => {
            warn!(
                event_name = "system.bootstrap.executor_fallback",
                correlation_id = "bootstrap",
                "no executor endpoint configured; actions are acknowledged locally"
            );
            Ok(Arc::new(AcknowledgingExecutor))
        }
    }
}
