//! Database migration command.
//!
//! # Usage
//!
//! ```bash
//! lk migrate
//! ```
//!
//! # Environment Variables
//!
//! - `WAREHOUSE_DATABASE_URL` - `PostgreSQL` connection string (falls back to `DATABASE_URL`)
//!
//! # Migration Files
//!
//! Warehouse migrations: `crates/warehouse/migrations/`

use super::{CliError, Context};

/// Run warehouse database migrations.
///
/// # Errors
///
/// Returns `CliError::Migration` if a migration fails to apply.
pub async fn run(ctx: &Context) -> Result<(), CliError> {
    tracing::info!("Running warehouse migrations...");
    sqlx::migrate!("../warehouse/migrations")
        .run(ctx.engine().store().pool())
        .await?;

    tracing::info!("Warehouse migrations complete!");
    Ok(())
}
