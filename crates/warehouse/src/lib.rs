//! Lotkeeper warehouse engine.
//!
//! Tracks inventory lots from receiving to shipment and keeps the genealogy
//! needed for recalls:
//!
//! - Lots carry received, current and reserved quantities
//! - Orders reserve stock FIFO-by-expiry, then pick it physically
//! - Picks can be reverted, shipments unshipped
//! - Production conversions consume N lots into one, recording genealogy edges
//! - Lineage, traversal and recall reports walk that genealogy
//!
//! # Usage
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//!
//! use lotkeeper_warehouse::config::WarehouseConfig;
//! use lotkeeper_warehouse::db::{PgStore, create_pool};
//! use lotkeeper_warehouse::services::{InventoryEngine, TracingAuditSink};
//!
//! let config = WarehouseConfig::from_env()?;
//! let pool = create_pool(&config.database_url, config.max_connections).await?;
//! let store = PgStore::new(pool, config.engine.lock_timeout);
//! let engine = InventoryEngine::new(store, config.engine, Arc::new(TracingAuditSink));
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use error::EngineError;
pub use services::InventoryEngine;
