//! Audit events emitted by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lotkeeper_core::ActorId;

/// Action an audit event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    LotReceived,
    LotStatusChanged,
    LotExpired,
    OrderCreated,
    Allocated,
    Deallocated,
    Picked,
    PickReverted,
    QuantityAdjusted,
    ReadyToShip,
    Shipped,
    Unshipped,
    QuantityRestored,
    ProductionConverted,
}

impl AuditAction {
    /// Stable snake case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LotReceived => "lot_received",
            Self::LotStatusChanged => "lot_status_changed",
            Self::LotExpired => "lot_expired",
            Self::OrderCreated => "order_created",
            Self::Allocated => "allocated",
            Self::Deallocated => "deallocated",
            Self::Picked => "picked",
            Self::PickReverted => "pick_reverted",
            Self::QuantityAdjusted => "quantity_adjusted",
            Self::ReadyToShip => "ready_to_ship",
            Self::Shipped => "shipped",
            Self::Unshipped => "unshipped",
            Self::QuantityRestored => "quantity_restored",
            Self::ProductionConverted => "production_converted",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of entity an audit event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntity {
    Lot,
    Order,
    OrderAllocation,
    OrderPick,
    ProductionRun,
}

impl AuditEntity {
    /// Stable snake case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lot => "lot",
            Self::Order => "order",
            Self::OrderAllocation => "order_allocation",
            Self::OrderPick => "order_pick",
            Self::ProductionRun => "production_run",
        }
    }
}

/// A single audit record handed to the external audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Idempotency key for the sink.
    pub id: Uuid,
    /// Who performed the action.
    pub actor: ActorId,
    /// What was done.
    pub action: AuditAction,
    /// Kind of entity affected.
    pub entity_type: AuditEntity,
    /// Identifier of the entity affected.
    pub entity_id: String,
    /// Structured details (quantities, related ids).
    pub details: serde_json::Value,
    /// When the event was emitted.
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    /// Build an event stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(
        actor: ActorId,
        action: AuditAction,
        entity_type: AuditEntity,
        entity_id: impl ToString,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor,
            action,
            entity_type,
            entity_id: entity_id.to_string(),
            details,
            recorded_at: Utc::now(),
        }
    }
}
