//! Order demand aggregate, allocations (reservations) and picks (withdrawals).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use lotkeeper_core::{
    ActorId, InventoryLotId, OrderAllocationId, OrderId, OrderItemId, OrderPickId, OrderStatus,
    ProductId,
};

use super::lot::InventoryLot;

/// An outbound order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Unique order ID.
    pub id: OrderId,
    /// Human-facing order number (e.g., "SO-1001").
    pub order_number: String,
    /// Current status.
    pub status: OrderStatus,
    /// When the order was created.
    pub created_at: DateTime<Utc>,
    /// When the order was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Unique item ID.
    pub id: OrderItemId,
    /// Owning order.
    pub order_id: OrderId,
    /// Position within the order, starting at 1.
    pub line_number: i32,
    /// Product demanded.
    pub product_id: ProductId,
    /// Quantity demanded.
    pub quantity_ordered: Decimal,
}

/// A soft reservation of lot quantity for an order item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAllocation {
    /// Unique allocation ID.
    pub id: OrderAllocationId,
    /// Item the reservation serves.
    pub order_item_id: OrderItemId,
    /// Lot reserved from.
    pub lot_id: InventoryLotId,
    /// Quantity reserved.
    pub quantity: Decimal,
    /// Portion of `quantity` already consumed by picks.
    pub quantity_fulfilled: Decimal,
    /// When the allocation was made.
    pub allocated_at: DateTime<Utc>,
    /// Who ran the allocation.
    pub allocated_by: ActorId,
}

impl OrderAllocation {
    /// Reserved quantity not yet consumed by a pick.
    #[must_use]
    pub fn outstanding(&self) -> Decimal {
        self.quantity - self.quantity_fulfilled
    }
}

/// A physical withdrawal from a lot against an order item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPick {
    /// Unique pick ID.
    pub id: OrderPickId,
    /// Item picked for.
    pub order_item_id: OrderItemId,
    /// Lot picked from.
    pub lot_id: InventoryLotId,
    /// Quantity withdrawn.
    pub quantity: Decimal,
    /// How much of the item's allocation on this lot the pick consumed.
    pub reservation_consumed: Decimal,
    /// Who picked.
    pub picked_by: ActorId,
    /// When the pick happened.
    pub picked_at: DateTime<Utc>,
}

/// Input for creating an order.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderInput {
    /// Order number.
    pub order_number: String,
    /// Lines, in order.
    pub items: Vec<CreateOrderItemInput>,
}

/// Input for one order line.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderItemInput {
    /// Product demanded.
    pub product_id: ProductId,
    /// Quantity demanded.
    pub quantity_ordered: Decimal,
}

/// Row-level input for inserting an allocation.
#[derive(Debug, Clone)]
pub struct NewAllocation {
    /// Item reserved for.
    pub order_item_id: OrderItemId,
    /// Lot reserved from.
    pub lot_id: InventoryLotId,
    /// Quantity reserved.
    pub quantity: Decimal,
    /// Who allocated.
    pub allocated_by: ActorId,
}

/// Row-level input for inserting a pick.
#[derive(Debug, Clone)]
pub struct NewPick {
    /// Item picked for.
    pub order_item_id: OrderItemId,
    /// Lot picked from.
    pub lot_id: InventoryLotId,
    /// Quantity withdrawn.
    pub quantity: Decimal,
    /// Allocation quantity consumed by the pick.
    pub reservation_consumed: Decimal,
    /// Who picked.
    pub picked_by: ActorId,
}

/// Result of a committed order creation or status transition.
#[derive(Debug, Clone, Serialize)]
pub struct OrderOutcome {
    /// The order after the change.
    pub order: Order,
    /// Its items.
    pub items: Vec<OrderItem>,
    /// Whether every audit event was delivered.
    pub audited: bool,
}

/// Result of a committed allocation or deallocation.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationOutcome {
    /// The order after the change.
    pub order: Order,
    /// Allocations created (or removed), by item then FIFO position.
    pub allocations: Vec<OrderAllocation>,
    /// Whether every audit event was delivered.
    pub audited: bool,
}

/// Result of a committed pick or pick reversal.
#[derive(Debug, Clone, Serialize)]
pub struct PickOutcome {
    /// The pick created (or deleted).
    pub pick: OrderPick,
    /// The lot after the quantity change.
    pub lot: InventoryLot,
    /// The order after its status was re-derived.
    pub order: Order,
    /// Whether every audit event was delivered.
    pub audited: bool,
}

/// Result of a committed unship.
#[derive(Debug, Clone, Serialize)]
pub struct UnshipOutcome {
    /// The order, back in `READY_TO_SHIP`.
    pub order: Order,
    /// Picks that were restored to their lots and deleted.
    pub restored: Vec<OrderPick>,
    /// Lots after restoration, by id.
    pub lots: Vec<InventoryLot>,
    /// Whether every audit event was delivered.
    pub audited: bool,
}

/// Picking state of a single order item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickProgress {
    /// Nothing picked yet.
    NotStarted,
    /// Some, but not all, of the ordered quantity picked.
    Partial,
    /// Picked quantity covers the ordered quantity.
    Complete,
}

impl PickProgress {
    /// Classify an item from its picked and ordered quantities.
    #[must_use]
    pub fn of(picked: Decimal, ordered: Decimal) -> Self {
        if picked >= ordered {
            Self::Complete
        } else if picked > Decimal::ZERO {
            Self::Partial
        } else {
            Self::NotStarted
        }
    }
}

/// Order item with its picked total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemPickSummary {
    /// The item.
    pub item: OrderItem,
    /// Sum of picks for the item.
    pub quantity_picked: Decimal,
    /// Derived progress.
    pub progress: PickProgress,
}

/// Status an order in the picking phase should have, given its item summaries.
///
/// No picks at all keeps the order `Confirmed`; any partially picked line
/// makes it `PartialPick`; otherwise picking is under way (`Picking`).
#[must_use]
pub fn derive_picking_status(items: &[ItemPickSummary]) -> OrderStatus {
    let any_picked = items
        .iter()
        .any(|s| s.quantity_picked > Decimal::ZERO);
    if !any_picked {
        OrderStatus::Confirmed
    } else if items.iter().any(|s| s.progress == PickProgress::Partial) {
        OrderStatus::PartialPick
    } else {
        OrderStatus::Picking
    }
}
