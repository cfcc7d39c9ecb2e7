//! Engine operations.
//!
//! [`InventoryEngine`] is the single entry point. Each public operation opens
//! one unit of work, commits it or drops it, and only then hands audit events
//! to the configured sink. Operations are split by concern:
//!
//! - [`lot_store`] - receiving, quantity adjustment, reservations, FIFO cursor, expiry
//! - [`allocation`] - FIFO-by-expiry reservation of order demand
//! - [`picking`] - picks, reversals and unship
//! - [`orders`] - order creation and the finalization hooks
//! - [`production`] - many-to-one conversions
//! - [`genealogy`] - lineage, traversal and recall reports
//! - [`audit`] - audit sinks

pub mod allocation;
pub mod audit;
pub mod genealogy;
pub mod lot_store;
pub mod orders;
pub mod picking;
pub mod production;

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::db::Store;
use crate::models::AuditEvent;

pub use audit::{
    AuditError, AuditReporter, AuditSink, ChannelAuditSink, RecordingAuditSink, TracingAuditSink,
};
pub use lot_store::EligibleLots;

/// The inventory lot allocation, picking and genealogy engine.
#[derive(Debug, Clone)]
pub struct InventoryEngine<S: Store> {
    store: S,
    config: EngineConfig,
    audit: AuditReporter,
}

impl<S: Store> InventoryEngine<S> {
    /// Create an engine over a store, delivering audit events to `sink`.
    #[must_use]
    pub fn new(store: S, config: EngineConfig, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            store,
            config,
            audit: AuditReporter::new(sink),
        }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Audit events that failed delivery since the engine was created.
    #[must_use]
    pub fn audit_failures(&self) -> u64 {
        self.audit.failure_count()
    }

    fn emit(&self, events: &[AuditEvent]) -> bool {
        self.audit.emit(events)
    }
}
