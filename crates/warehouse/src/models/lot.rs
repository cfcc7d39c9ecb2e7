//! Inventory lot domain models: the unit of physical tracking.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use lotkeeper_core::{InventoryLotId, LotStatus, ProductId};

/// A traceable batch of a single product.
///
/// Quantities satisfy `0 <= quantity_reserved <= quantity_current <= quantity_received`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryLot {
    /// Unique lot ID.
    pub id: InventoryLotId,
    /// Human-scannable lot number, globally unique.
    pub lot_number: String,
    /// Product held in this lot.
    pub product_id: ProductId,
    /// Quantity on receipt (or produced). Never changes.
    pub quantity_received: Decimal,
    /// Quantity physically on hand.
    pub quantity_current: Decimal,
    /// Portion of `quantity_current` held by outstanding allocations.
    pub quantity_reserved: Decimal,
    /// Unit the quantities are expressed in (e.g. "kg", "case").
    pub unit_of_measure: String,
    /// Date received into inventory (or produced).
    pub received_date: NaiveDate,
    /// Best-before date, if the goods have one.
    pub expiry_date: Option<NaiveDate>,
    /// Supplier / farm / country of origin as reported by receiving.
    pub origin: Option<String>,
    /// Lifecycle status.
    pub status: LotStatus,
    /// Status a `DEPLETED` lot returns to when it regains stock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_before_depletion: Option<LotStatus>,
    /// When the lot was created.
    pub created_at: DateTime<Utc>,
    /// When the lot was last updated.
    pub updated_at: DateTime<Utc>,
}

impl InventoryLot {
    /// Quantity that is on hand and not reserved.
    #[must_use]
    pub fn quantity_available(&self) -> Decimal {
        self.quantity_current - self.quantity_reserved
    }

    /// Whether this lot can currently be allocated, picked or consumed.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.status.is_eligible() && self.quantity_current > Decimal::ZERO
    }

    /// Position of this lot in the FIFO-by-expiry ordering.
    #[must_use]
    pub fn fifo_key(&self) -> FifoKey {
        FifoKey {
            expiry_date: self.expiry_date,
            received_date: self.received_date,
            lot_id: self.id,
        }
    }
}

/// Sort key for eligible lots: expiry ascending (lots without expiry last),
/// then received date, then lot id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FifoKey {
    /// Expiry date of the lot, if any.
    pub expiry_date: Option<NaiveDate>,
    /// Received date of the lot.
    pub received_date: NaiveDate,
    /// Lot id, the final tie breaker.
    pub lot_id: InventoryLotId,
}

impl Ord for FifoKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let expiry = match (self.expiry_date, other.expiry_date) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        expiry
            .then_with(|| self.received_date.cmp(&other.received_date))
            .then_with(|| self.lot_id.cmp(&other.lot_id))
    }
}

impl PartialOrd for FifoKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Row-level input for inserting a lot.
#[derive(Debug, Clone)]
pub struct NewLot {
    /// Lot number identifier.
    pub lot_number: String,
    /// Product held in the lot.
    pub product_id: ProductId,
    /// Initial quantity (both received and current).
    pub quantity: Decimal,
    /// Unit of measure.
    pub unit_of_measure: String,
    /// Date received or produced.
    pub received_date: NaiveDate,
    /// Optional expiry date.
    pub expiry_date: Option<NaiveDate>,
    /// Optional origin description.
    pub origin: Option<String>,
    /// Initial status.
    pub status: LotStatus,
}

/// Input for receiving a new lot into the warehouse.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiveLotInput {
    /// Lot number printed on the inbound paperwork.
    pub lot_number: String,
    /// Product received.
    pub product_id: ProductId,
    /// Quantity received.
    pub quantity: Decimal,
    /// Unit of measure.
    pub unit_of_measure: String,
    /// Date received into inventory.
    pub received_date: NaiveDate,
    /// Optional expiry date.
    pub expiry_date: Option<NaiveDate>,
    /// Optional origin description.
    pub origin: Option<String>,
    /// Hold the lot in `QcPending` until released.
    #[serde(default)]
    pub qc_required: bool,
}

/// New quantity/status values written back after an adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LotState {
    /// New on-hand quantity.
    pub quantity_current: Decimal,
    /// New reserved quantity.
    pub quantity_reserved: Decimal,
    /// New status.
    pub status: LotStatus,
    /// Status to restore once a depleted lot is replenished.
    pub status_before_depletion: Option<LotStatus>,
}

impl From<&InventoryLot> for LotState {
    fn from(lot: &InventoryLot) -> Self {
        Self {
            quantity_current: lot.quantity_current,
            quantity_reserved: lot.quantity_reserved,
            status: lot.status,
            status_before_depletion: lot.status_before_depletion,
        }
    }
}

/// Result of a committed change to a single lot.
#[derive(Debug, Clone, Serialize)]
pub struct LotOutcome {
    /// The lot after the change.
    pub lot: InventoryLot,
    /// Whether every audit event was delivered.
    pub audited: bool,
}

/// Result of an expiry sweep.
#[derive(Debug, Clone, Serialize)]
pub struct ExpiryOutcome {
    /// Lots moved to `EXPIRED`, by id.
    pub expired: Vec<InventoryLot>,
    /// Whether every audit event was delivered.
    pub audited: bool,
}
