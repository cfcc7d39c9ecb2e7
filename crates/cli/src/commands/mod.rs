//! Command implementations.
//!
//! Every command runs against one [`Context`]: an engine over a `PostgreSQL`
//! store, the resolved actor and the output format.

pub mod lots;
pub mod migrate;
pub mod orders;
pub mod production;
pub mod trace;

use std::io::Write;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use lotkeeper_core::ActorId;
use lotkeeper_warehouse::EngineError;
use lotkeeper_warehouse::config::{ConfigError, WarehouseConfig};
use lotkeeper_warehouse::db::{PgStore, create_pool};
use lotkeeper_warehouse::services::{InventoryEngine, TracingAuditSink};

/// Errors that can occur while running a command.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Database connection error.
    #[error("Database connection error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The engine refused the operation.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A mutating command was run without `--actor` / `LK_ACTOR`.
    #[error("This command changes inventory; pass --actor or set LK_ACTOR")]
    MissingActor,

    /// Arguments were inconsistent.
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// A plan file could not be read.
    #[error("Cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization failed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Writing the result failed.
    #[error("Output error: {0}")]
    Output(#[source] std::io::Error),
}

/// How results are rendered on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Json,
    Yaml,
}

/// Shared state for one command invocation.
pub struct Context {
    engine: InventoryEngine<PgStore>,
    actor: Option<ActorId>,
    format: OutputFormat,
}

impl Context {
    /// Connect to the warehouse database and build the engine.
    ///
    /// # Errors
    ///
    /// Returns `CliError::Database` if the pool cannot be created.
    pub async fn connect(
        config: WarehouseConfig,
        actor: Option<i32>,
        format: OutputFormat,
    ) -> Result<Self, CliError> {
        tracing::debug!("Connecting to warehouse database...");
        let pool = create_pool(&config.database_url, config.max_connections).await?;
        let store = PgStore::new(pool, config.engine.lock_timeout);
        let engine = InventoryEngine::new(store, config.engine, Arc::new(TracingAuditSink));
        Ok(Self {
            engine,
            actor: actor.map(ActorId::new),
            format,
        })
    }

    pub const fn engine(&self) -> &InventoryEngine<PgStore> {
        &self.engine
    }

    /// The actor for a mutating command.
    ///
    /// # Errors
    ///
    /// Returns `CliError::MissingActor` when none was given.
    pub fn actor(&self) -> Result<ActorId, CliError> {
        self.actor.ok_or(CliError::MissingActor)
    }

    /// Render a result on stdout.
    ///
    /// # Errors
    ///
    /// Returns `CliError` if serialization or the write fails.
    pub fn emit<T: Serialize>(&self, value: &T) -> Result<(), CliError> {
        let rendered = render(self.format, value)?;
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(rendered.as_bytes())
            .and_then(|()| stdout.flush())
            .map_err(CliError::Output)
    }

    /// Render a mutation result, warning when its audit events were not delivered.
    ///
    /// # Errors
    ///
    /// Returns `CliError` if serialization or the write fails.
    pub fn emit_outcome<T: Serialize>(&self, value: &T, audited: bool) -> Result<(), CliError> {
        if !audited {
            tracing::warn!("Operation committed but its audit events were not delivered");
        }
        self.emit(value)
    }
}

fn render<T: Serialize>(format: OutputFormat, value: &T) -> Result<String, CliError> {
    Ok(match format {
        OutputFormat::Json => {
            let mut out = serde_json::to_string_pretty(value)?;
            out.push('\n');
            out
        }
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Sample {
        lot_number: &'static str,
        quantity: u32,
    }

    #[test]
    fn test_render_json() {
        let out = render(
            OutputFormat::Json,
            &Sample {
                lot_number: "LOT-1",
                quantity: 5,
            },
        )
        .unwrap();
        assert!(out.contains("\"lot_number\": \"LOT-1\""));
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn test_render_yaml() {
        let out = render(
            OutputFormat::Yaml,
            &Sample {
                lot_number: "LOT-1",
                quantity: 5,
            },
        )
        .unwrap();
        assert!(out.contains("lot_number: LOT-1"));
        assert!(out.contains("quantity: 5"));
    }
}
