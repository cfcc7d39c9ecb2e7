//! Unified error handling for the warehouse engine.

use rust_decimal::Decimal;
use thiserror::Error;

use lotkeeper_core::{InventoryLotId, OrderId, OrderItemId, ProductId};

use crate::db::RepositoryError;

/// Failure of an engine operation.
///
/// Every operation is all-or-nothing, so any of these leaves the store exactly
/// as it was before the call.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A quantity is non-positive or would break a lot's quantity bounds.
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// A required identifier is blank, or a list is empty or repeats an entry.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The order already carries allocations.
    #[error("Order {order_id} is already allocated")]
    AlreadyAllocated {
        /// Order that was asked to allocate again.
        order_id: OrderId,
    },

    /// Not enough eligible, unreserved quantity.
    #[error(
        "Insufficient inventory for product {product_id}{}: requested {requested}, available {available}, short {shortfall}",
        lot_suffix(*.lot_id)
    )]
    InsufficientInventory {
        /// Product that ran short.
        product_id: ProductId,
        /// Lot that ran short, when a specific lot was asked for.
        lot_id: Option<InventoryLotId>,
        /// Quantity asked for.
        requested: Decimal,
        /// Quantity that could have been supplied.
        available: Decimal,
        /// `requested - available`.
        shortfall: Decimal,
    },

    /// A pick would take an item past its ordered quantity.
    #[error(
        "Over-pick on order item {order_item_id}: ordered {ordered}, already picked {picked}, requested {requested}"
    )]
    OverPick {
        /// Item being picked.
        order_item_id: OrderItemId,
        /// Quantity ordered.
        ordered: Decimal,
        /// Quantity picked so far.
        picked: Decimal,
        /// Quantity of the rejected pick.
        requested: Decimal,
    },

    /// A picked lot holds a different product than the item asks for.
    #[error("Lot {lot_id} holds product {lot_product}, but order item asks for product {item_product}")]
    ProductMismatch {
        /// Lot scanned.
        lot_id: InventoryLotId,
        /// Product in the lot.
        lot_product: ProductId,
        /// Product on the order item.
        item_product: ProductId,
    },

    /// Referenced entity does not exist.
    #[error("{entity} {key} not found")]
    NotFound {
        /// Kind of entity.
        entity: &'static str,
        /// Identifier looked up.
        key: String,
    },

    /// Entity is in a status that does not permit the operation.
    #[error("Cannot {operation} {entity} {key} in status {status}")]
    InvalidState {
        /// Kind of entity.
        entity: &'static str,
        /// Identifier of the entity.
        key: String,
        /// Its current status.
        status: String,
        /// Operation that was refused.
        operation: &'static str,
    },

    /// Lock timeout, deadlock or serialization failure. Safe to retry.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Conversion yield above the configured bound.
    #[error("Yield {yield_ratio} exceeds the maximum of {max_yield}")]
    YieldExceeded {
        /// `quantity_produced / sum(quantity_consumed)`.
        yield_ratio: Decimal,
        /// Configured bound.
        max_yield: Decimal,
    },

    /// Any other storage failure.
    #[error("Storage error: {0}")]
    Storage(RepositoryError),
}

fn lot_suffix(lot_id: Option<InventoryLotId>) -> String {
    lot_id.map_or_else(String::new, |id| format!(" in lot {id}"))
}

impl EngineError {
    /// Whether the caller may retry the whole operation unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }

    pub(crate) fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub(crate) fn invalid_state(
        entity: &'static str,
        key: impl ToString,
        status: impl ToString,
        operation: &'static str,
    ) -> Self {
        Self::InvalidState {
            entity,
            key: key.to_string(),
            status: status.to_string(),
            operation,
        }
    }
}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        if err.is_transient() {
            Self::ConcurrencyConflict(err.to_string())
        } else {
            Self::Storage(err)
        }
    }
}
