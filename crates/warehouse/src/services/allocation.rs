//! FIFO-by-expiry allocation of order demand against eligible lots.
//!
//! Allocation reserves (`quantity_reserved`) rather than withdraws. An order
//! is allocated at most once; a shortfall on any item aborts the whole call.

use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, instrument, warn};

use lotkeeper_core::{ActorId, OrderId, OrderStatus};

use super::InventoryEngine;
use super::lot_store::{self, EligibleLots};
use super::orders;
use crate::db::{Store, UnitOfWork};
use crate::error::EngineError;
use crate::models::{
    AllocationOutcome, AuditAction, AuditEntity, AuditEvent, NewAllocation, OrderAllocation,
};

impl<S: Store> InventoryEngine<S> {
    /// Reserve stock for every item of a `DRAFT` order, earliest expiry first.
    ///
    /// Each item walks the product's eligible lots and takes
    /// `min(remaining, available)` from each until covered. On success the
    /// order is `CONFIRMED` with one allocation per (item, lot).
    ///
    /// # Errors
    ///
    /// - `EngineError::AlreadyAllocated` if the order carries allocations
    /// - `EngineError::InvalidState` if the order is not `DRAFT`
    /// - `EngineError::InsufficientInventory` naming the first item that ran short
    #[instrument(skip(self))]
    pub async fn allocate(
        &self,
        order_id: OrderId,
        actor: ActorId,
    ) -> Result<AllocationOutcome, EngineError> {
        let mut tx = self.store.begin().await?;
        let order = orders::lock_existing(&mut tx, order_id).await?;
        if !tx.allocations_for_order(order_id).await?.is_empty() {
            return Err(EngineError::AlreadyAllocated { order_id });
        }
        if order.status != OrderStatus::Draft {
            return Err(EngineError::invalid_state(
                "order",
                &order.order_number,
                order.status,
                "allocate",
            ));
        }

        let mut allocations = Vec::new();
        for item in tx.order_items(order_id).await? {
            let mut remaining = item.quantity_ordered;
            let mut cursor = EligibleLots::new(item.product_id, self.config.eligible_page_size);
            while remaining > Decimal::ZERO {
                let Some(lot) = cursor.next_lot(&mut tx).await? else {
                    break;
                };
                let take = remaining.min(lot.quantity_available());
                if take <= Decimal::ZERO {
                    continue;
                }
                lot_store::reserve(&mut tx, lot.id, take).await?;
                allocations.push(
                    tx.insert_allocation(&NewAllocation {
                        order_item_id: item.id,
                        lot_id: lot.id,
                        quantity: take,
                        allocated_by: actor,
                    })
                    .await?,
                );
                remaining -= take;
            }

            if remaining > Decimal::ZERO {
                warn!(
                    product_id = %item.product_id,
                    requested = %item.quantity_ordered,
                    shortfall = %remaining,
                    "Allocation short"
                );
                return Err(EngineError::InsufficientInventory {
                    product_id: item.product_id,
                    lot_id: None,
                    requested: item.quantity_ordered,
                    available: item.quantity_ordered - remaining,
                    shortfall: remaining,
                });
            }
        }

        let order = tx
            .update_order_status(order_id, OrderStatus::Confirmed)
            .await?;
        tx.commit().await?;

        info!(allocations = allocations.len(), "Allocated order");

        let audited = self.emit(&allocation_events(
            actor,
            AuditAction::Allocated,
            &allocations,
        ));
        Ok(AllocationOutcome {
            order,
            allocations,
            audited,
        })
    }

    /// Drop every allocation of a `CONFIRMED` order that has no picks and
    /// return it to `DRAFT`, releasing the reserved stock.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` if the order is not `CONFIRMED` or
    /// already has picks.
    #[instrument(skip(self))]
    pub async fn deallocate(
        &self,
        order_id: OrderId,
        actor: ActorId,
    ) -> Result<AllocationOutcome, EngineError> {
        let mut tx = self.store.begin().await?;
        let order = orders::lock_existing(&mut tx, order_id).await?;
        if order.status != OrderStatus::Confirmed {
            return Err(EngineError::invalid_state(
                "order",
                &order.order_number,
                order.status,
                "deallocate",
            ));
        }
        if !tx.picks_for_order(order_id).await?.is_empty() {
            return Err(EngineError::invalid_state(
                "order",
                &order.order_number,
                "picked",
                "deallocate",
            ));
        }

        let mut allocations = tx.allocations_for_order(order_id).await?;
        allocations.sort_by_key(|a| (a.lot_id, a.id));
        for allocation in &allocations {
            let outstanding = allocation.outstanding();
            if outstanding > Decimal::ZERO {
                lot_store::reserve(&mut tx, allocation.lot_id, -outstanding).await?;
            }
        }
        tx.delete_allocations_for_order(order_id).await?;
        let order = tx.update_order_status(order_id, OrderStatus::Draft).await?;
        tx.commit().await?;

        info!(allocations = allocations.len(), "Deallocated order");

        let audited = self.emit(&allocation_events(
            actor,
            AuditAction::Deallocated,
            &allocations,
        ));
        Ok(AllocationOutcome {
            order,
            allocations,
            audited,
        })
    }
}

fn allocation_events(
    actor: ActorId,
    action: AuditAction,
    allocations: &[OrderAllocation],
) -> Vec<AuditEvent> {
    allocations
        .iter()
        .map(|a| {
            AuditEvent::new(
                actor,
                action,
                AuditEntity::OrderAllocation,
                a.id,
                json!({
                    "order_item_id": a.order_item_id,
                    "lot_id": a.lot_id,
                    "quantity": a.quantity,
                }),
            )
        })
        .collect()
}
