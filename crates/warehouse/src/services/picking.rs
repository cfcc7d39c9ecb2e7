//! Picking: physical withdrawals against order items, and their reversal.
//!
//! A pick first consumes the item's own reservation on the lot, then takes
//! the remainder from unreserved stock. Reverting a pick (or unshipping an
//! order) puts back both the stock and the reservation the pick consumed.

use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, instrument, warn};

use lotkeeper_core::{ActorId, InventoryLotId, OrderId, OrderItemId, OrderPickId, OrderStatus};

use super::InventoryEngine;
use super::lot_store;
use super::orders;
use crate::db::{Store, UnitOfWork};
use crate::error::EngineError;
use crate::models::{
    AuditAction, AuditEntity, AuditEvent, NewPick, OrderPick, PickOutcome, UnshipOutcome,
};

/// Put a pick's quantity and consumed reservation back, then delete it.
async fn restore_pick<U: UnitOfWork>(
    tx: &mut U,
    pick: &OrderPick,
) -> Result<(), EngineError> {
    lot_store::adjust_quantity(tx, pick.lot_id, pick.quantity).await?;
    if pick.reservation_consumed > Decimal::ZERO {
        lot_store::reserve(tx, pick.lot_id, pick.reservation_consumed).await?;
        if let Some(allocation) = tx.find_allocation(pick.order_item_id, pick.lot_id).await? {
            let fulfilled = (allocation.quantity_fulfilled - pick.reservation_consumed)
                .max(Decimal::ZERO);
            tx.set_allocation_fulfilled(allocation.id, fulfilled).await?;
        }
    }
    if !tx.delete_pick(pick.id).await? {
        return Err(EngineError::not_found("pick", pick.id));
    }
    Ok(())
}

impl<S: Store> InventoryEngine<S> {
    /// Withdraw `quantity` of a lot for an order item.
    ///
    /// An unshipped order sits in `READY_TO_SHIP` with nothing picked; it takes
    /// picks again until complete and then needs `mark_ready_to_ship` anew.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidQuantity` for a non-positive or out-of-range quantity
    /// - `EngineError::InvalidState` if the order does not accept picks or the lot is not eligible
    /// - `EngineError::ProductMismatch` if the lot holds another product
    /// - `EngineError::OverPick` if the item would exceed its ordered quantity
    /// - `EngineError::InsufficientInventory` if the lot cannot cover the pick
    #[instrument(skip(self))]
    pub async fn pick(
        &self,
        order_item_id: OrderItemId,
        lot_id: InventoryLotId,
        quantity: Decimal,
        actor: ActorId,
    ) -> Result<PickOutcome, EngineError> {
        if quantity <= Decimal::ZERO {
            return Err(EngineError::InvalidQuantity(format!(
                "pick quantity must be positive, got {quantity}"
            )));
        }

        let mut tx = self.store.begin().await?;
        let item = tx
            .get_order_item(order_item_id)
            .await?
            .ok_or_else(|| EngineError::not_found("order item", order_item_id))?;
        let order = orders::lock_existing(&mut tx, item.order_id).await?;
        let reopened = order.status == OrderStatus::ReadyToShip
            && !orders::fully_picked(&mut tx, order.id).await?;
        if !(order.status.accepts_picks() || reopened) {
            return Err(EngineError::invalid_state(
                "order",
                &order.order_number,
                order.status,
                "pick for",
            ));
        }

        let lot = lot_store::lock_existing(&mut tx, lot_id).await?;
        if !lot.status.is_eligible() {
            return Err(EngineError::invalid_state(
                "lot",
                &lot.lot_number,
                lot.status,
                "pick from",
            ));
        }
        if lot.product_id != item.product_id {
            return Err(EngineError::ProductMismatch {
                lot_id,
                lot_product: lot.product_id,
                item_product: item.product_id,
            });
        }

        let picked = tx
            .picks_for_item(order_item_id)
            .await?
            .iter()
            .try_fold(Decimal::ZERO, |acc, p| acc.checked_add(p.quantity))
            .ok_or_else(|| {
                EngineError::InvalidQuantity(format!(
                    "picked total of order item {order_item_id} is out of range"
                ))
            })?;
        let picked_after = picked.checked_add(quantity).ok_or_else(|| {
            EngineError::InvalidQuantity(format!("pick quantity {quantity} is out of range"))
        })?;
        if picked_after > item.quantity_ordered {
            warn!(ordered = %item.quantity_ordered, picked = %picked, "Refused over-pick");
            return Err(EngineError::OverPick {
                order_item_id,
                ordered: item.quantity_ordered,
                picked,
                requested: quantity,
            });
        }

        let allocation = tx.find_allocation(order_item_id, lot_id).await?;
        let own_reservation = allocation
            .as_ref()
            .map_or(Decimal::ZERO, |a| a.outstanding());
        let available = lot.quantity_available() + own_reservation;
        if available < quantity {
            return Err(EngineError::InsufficientInventory {
                product_id: lot.product_id,
                lot_id: Some(lot_id),
                requested: quantity,
                available,
                shortfall: quantity - available,
            });
        }

        let reservation_consumed = quantity.min(own_reservation);
        if let Some(allocation) = allocation.filter(|_| reservation_consumed > Decimal::ZERO) {
            lot_store::reserve(&mut tx, lot_id, -reservation_consumed).await?;
            tx.set_allocation_fulfilled(
                allocation.id,
                allocation.quantity_fulfilled + reservation_consumed,
            )
            .await?;
        }
        let lot = lot_store::adjust_quantity(&mut tx, lot_id, -quantity).await?;
        let pick = tx
            .insert_pick(&NewPick {
                order_item_id,
                lot_id,
                quantity,
                reservation_consumed,
                picked_by: actor,
            })
            .await?;
        let order = orders::refresh_picking_status(&mut tx, order).await?;
        tx.commit().await?;

        info!(pick_id = %pick.id, order_status = %order.status, "Picked");

        let audited = self.emit(&[AuditEvent::new(
            actor,
            AuditAction::Picked,
            AuditEntity::OrderPick,
            pick.id,
            json!({
                "order_id": order.id,
                "order_item_id": order_item_id,
                "lot_id": lot_id,
                "quantity": quantity,
                "reservation_consumed": reservation_consumed,
            }),
        )]);
        Ok(PickOutcome {
            pick,
            lot,
            order,
            audited,
        })
    }

    /// Undo a pick: restore the lot's quantity and reservation and delete the pick.
    ///
    /// Permitted while the order is being picked or is `READY_TO_SHIP`; a
    /// shipped order is reversed with [`InventoryEngine::unship`] instead.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotFound` for an unknown pick and
    /// `EngineError::InvalidState` if the order has shipped.
    #[instrument(skip(self))]
    pub async fn revert_pick(
        &self,
        pick_id: OrderPickId,
        actor: ActorId,
    ) -> Result<PickOutcome, EngineError> {
        let mut tx = self.store.begin().await?;
        let pick = tx
            .get_pick(pick_id)
            .await?
            .ok_or_else(|| EngineError::not_found("pick", pick_id))?;
        let item = tx
            .get_order_item(pick.order_item_id)
            .await?
            .ok_or_else(|| EngineError::not_found("order item", pick.order_item_id))?;
        let order = orders::lock_existing(&mut tx, item.order_id).await?;
        if !(order.status.accepts_picks() || order.status == OrderStatus::ReadyToShip) {
            return Err(EngineError::invalid_state(
                "order",
                &order.order_number,
                order.status,
                "revert a pick of",
            ));
        }

        restore_pick(&mut tx, &pick).await?;
        let lot = lot_store::lock_existing(&mut tx, pick.lot_id).await?;
        let order = orders::refresh_picking_status(&mut tx, order).await?;
        tx.commit().await?;

        info!(lot_id = %lot.id, restored = %pick.quantity, order_status = %order.status, "Reverted pick");

        let audited = self.emit(&[AuditEvent::new(
            actor,
            AuditAction::PickReverted,
            AuditEntity::OrderPick,
            pick.id,
            json!({
                "order_id": order.id,
                "order_item_id": pick.order_item_id,
                "lot_id": pick.lot_id,
                "quantity_restored": pick.quantity,
                "reservation_restored": pick.reservation_consumed,
            }),
        )]);
        Ok(PickOutcome {
            pick,
            lot,
            order,
            audited,
        })
    }

    /// Reverse a shipment: restore every pick to its lot, delete the picks and
    /// move the order back to `READY_TO_SHIP`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless the order is `SHIPPED`. Any
    /// failure while restoring leaves every lot and pick untouched.
    #[instrument(skip(self))]
    pub async fn unship(
        &self,
        order_id: OrderId,
        actor: ActorId,
    ) -> Result<UnshipOutcome, EngineError> {
        let mut tx = self.store.begin().await?;
        let order = orders::lock_existing(&mut tx, order_id).await?;
        if order.status != OrderStatus::Shipped {
            return Err(EngineError::invalid_state(
                "order",
                &order.order_number,
                order.status,
                "unship",
            ));
        }

        let picks = tx.picks_for_order(order_id).await?;
        let lot_ids: BTreeSet<InventoryLotId> = picks.iter().map(|p| p.lot_id).collect();
        for lot_id in &lot_ids {
            lot_store::lock_existing(&mut tx, *lot_id).await?;
        }
        for pick in &picks {
            restore_pick(&mut tx, pick).await?;
        }
        let lot_ids: Vec<InventoryLotId> = lot_ids.into_iter().collect();
        let lots = tx.get_lots(&lot_ids).await?;
        let order = tx
            .update_order_status(order_id, OrderStatus::ReadyToShip)
            .await?;
        tx.commit().await?;

        info!(restored = picks.len(), "Unshipped order");

        let mut events: Vec<AuditEvent> = picks
            .iter()
            .map(|pick| {
                AuditEvent::new(
                    actor,
                    AuditAction::QuantityRestored,
                    AuditEntity::Lot,
                    pick.lot_id,
                    json!({
                        "order_id": order_id,
                        "pick_id": pick.id,
                        "quantity_restored": pick.quantity,
                        "reservation_restored": pick.reservation_consumed,
                    }),
                )
            })
            .collect();
        events.push(AuditEvent::new(
            actor,
            AuditAction::Unshipped,
            AuditEntity::Order,
            order_id,
            json!({ "order_number": order.order_number, "picks_restored": picks.len() }),
        ));
        let audited = self.emit(&events);
        Ok(UnshipOutcome {
            order,
            restored: picks,
            lots,
            audited,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use lotkeeper_core::{LotStatus, ProductId};

    use super::*;
    use crate::models::{OrderItem, ReceiveLotInput};
    use crate::services::testing::{ACTOR, date, dec, engine, order, receive};

    async fn first_item(
        engine: &InventoryEngine<crate::db::MemoryStore>,
        order_id: OrderId,
    ) -> OrderItem {
        engine.order_progress(order_id).await.unwrap()[0].item.clone()
    }

    #[tokio::test]
    async fn test_fifo_scenario_pick_empties_both_lots() {
        let (engine, _) = engine();
        let a = receive(&engine, "A", 1, 50, Some(date(2024, 1, 10))).await;
        let b = receive(&engine, "B", 1, 50, Some(date(2024, 1, 20))).await;
        let so = order(&engine, "SO-1", &[(1, 60)]).await;
        engine.allocate(so.id, ACTOR).await.unwrap();
        let item = first_item(&engine, so.id).await;

        let first = engine.pick(item.id, a.id, dec(50), ACTOR).await.unwrap();
        assert_eq!(first.lot.quantity_current, Decimal::ZERO);
        assert_eq!(first.lot.status, LotStatus::Depleted);
        assert_eq!(first.order.status, OrderStatus::PartialPick);

        let second = engine.pick(item.id, b.id, dec(10), ACTOR).await.unwrap();
        assert_eq!(second.lot.quantity_current, dec(40));
        assert_eq!(second.lot.quantity_reserved, Decimal::ZERO);
        assert_eq!(second.order.status, OrderStatus::Picking);
        assert!(engine.is_complete(so.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_pick_revert_round_trip_restores_exactly() {
        let (engine, sink) = engine();
        let a = receive(&engine, "A", 1, 50, None).await;
        let so = order(&engine, "SO-1", &[(1, 30)]).await;
        engine.allocate(so.id, ACTOR).await.unwrap();
        let item = first_item(&engine, so.id).await;
        let before = engine.lot(a.id).await.unwrap();

        for _ in 0..5 {
            let picked = engine.pick(item.id, a.id, dec(12), ACTOR).await.unwrap();
            engine.revert_pick(picked.pick.id, ACTOR).await.unwrap();
        }

        let after = engine.lot(a.id).await.unwrap();
        assert_eq!(after.quantity_current, before.quantity_current);
        assert_eq!(after.quantity_reserved, before.quantity_reserved);
        assert_eq!(engine.order(so.id).await.unwrap().status, OrderStatus::Confirmed);
        assert!(sink.events().iter().any(|e| e.action == AuditAction::PickReverted));
    }

    #[tokio::test]
    async fn test_revert_restores_depleted_lot() {
        let (engine, _) = engine();
        let a = receive(&engine, "A", 1, 10, None).await;
        let so = order(&engine, "SO-1", &[(1, 10)]).await;
        engine.allocate(so.id, ACTOR).await.unwrap();
        let item = first_item(&engine, so.id).await;

        let picked = engine.pick(item.id, a.id, dec(10), ACTOR).await.unwrap();
        assert_eq!(picked.lot.status, LotStatus::Depleted);

        let reverted = engine.revert_pick(picked.pick.id, ACTOR).await.unwrap();
        assert_eq!(reverted.lot.status, LotStatus::Received);
        assert_eq!(reverted.lot.quantity_current, dec(10));
        assert_eq!(reverted.lot.quantity_reserved, dec(10));
    }

    #[tokio::test]
    async fn test_revert_keeps_lot_in_qc() {
        let (engine, _) = engine();
        let a = engine
            .receive(
                ReceiveLotInput {
                    lot_number: "QC-1".to_string(),
                    product_id: ProductId::new(1),
                    quantity: dec(10),
                    unit_of_measure: "kg".to_string(),
                    received_date: date(2024, 1, 1),
                    expiry_date: None,
                    origin: None,
                    qc_required: true,
                },
                ACTOR,
            )
            .await
            .unwrap()
            .lot;
        assert_eq!(a.status, LotStatus::QcPending);
        let so = order(&engine, "SO-1", &[(1, 10)]).await;
        engine.allocate(so.id, ACTOR).await.unwrap();
        let item = first_item(&engine, so.id).await;

        let picked = engine.pick(item.id, a.id, dec(10), ACTOR).await.unwrap();
        assert_eq!(picked.lot.status, LotStatus::Depleted);
        assert_eq!(picked.lot.status_before_depletion, Some(LotStatus::QcPending));

        let reverted = engine.revert_pick(picked.pick.id, ACTOR).await.unwrap();
        assert_eq!(reverted.lot.status, LotStatus::QcPending);
        assert_eq!(reverted.lot.status_before_depletion, None);
    }

    #[tokio::test]
    async fn test_over_pick_is_rejected() {
        let (engine, _) = engine();
        let a = receive(&engine, "A", 1, 50, None).await;
        let so = order(&engine, "SO-1", &[(1, 10)]).await;
        engine.allocate(so.id, ACTOR).await.unwrap();
        let item = first_item(&engine, so.id).await;
        engine.pick(item.id, a.id, dec(8), ACTOR).await.unwrap();

        let err = engine.pick(item.id, a.id, dec(3), ACTOR).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::OverPick { picked, requested, .. } if picked == dec(8) && requested == dec(3)
        ));
    }

    #[tokio::test]
    async fn test_pick_respects_other_orders_reservations() {
        let (engine, _) = engine();
        let a = receive(&engine, "A", 1, 20, None).await;
        let b = receive(&engine, "B", 1, 10, None).await;
        let first = order(&engine, "SO-1", &[(1, 15)]).await;
        let second = order(&engine, "SO-2", &[(1, 10)]).await;
        engine.allocate(first.id, ACTOR).await.unwrap();
        // SO-2 gets the last 5 of A and 5 of B.
        engine.allocate(second.id, ACTOR).await.unwrap();
        let item = first_item(&engine, second.id).await;

        let err = engine.pick(item.id, a.id, dec(6), ACTOR).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientInventory { available, .. } if available == dec(5)
        ));
        engine.pick(item.id, a.id, dec(5), ACTOR).await.unwrap();
        engine.pick(item.id, b.id, dec(5), ACTOR).await.unwrap();

        let a = engine.lot(a.id).await.unwrap();
        assert_eq!(a.quantity_current, dec(15));
        assert_eq!(a.quantity_reserved, dec(15));
    }

    #[tokio::test]
    async fn test_pick_rejects_wrong_product_and_bad_quantity() {
        let (engine, _) = engine();
        receive(&engine, "A", 1, 20, None).await;
        let other = receive(&engine, "OTHER", 2, 20, None).await;
        let so = order(&engine, "SO-1", &[(1, 10)]).await;
        engine.allocate(so.id, ACTOR).await.unwrap();
        let item = first_item(&engine, so.id).await;

        let err = engine.pick(item.id, other.id, dec(1), ACTOR).await.unwrap_err();
        assert!(matches!(err, EngineError::ProductMismatch { .. }));

        let err = engine.pick(item.id, other.id, dec(-1), ACTOR).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidQuantity(_)));
    }

    #[tokio::test]
    async fn test_pick_requires_confirmed_order() {
        let (engine, _) = engine();
        let a = receive(&engine, "A", 1, 20, None).await;
        let so = order(&engine, "SO-1", &[(1, 10)]).await;
        let item = first_item(&engine, so.id).await;

        let err = engine.pick(item.id, a.id, dec(1), ACTOR).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { entity: "order", .. }));
    }

    #[tokio::test]
    async fn test_pick_out_of_range_quantity_is_rejected() {
        let (engine, _) = engine();
        let a = receive(&engine, "A", 1, 20, None).await;
        let so = order(&engine, "SO-1", &[(1, 10)]).await;
        engine.allocate(so.id, ACTOR).await.unwrap();
        let item = first_item(&engine, so.id).await;
        engine.pick(item.id, a.id, dec(5), ACTOR).await.unwrap();

        let err = engine
            .pick(item.id, a.id, Decimal::MAX, ACTOR)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidQuantity(_)));
        assert_eq!(engine.lot(a.id).await.unwrap().quantity_current, dec(15));
    }

    #[tokio::test]
    async fn test_unship_restores_everything() {
        let (engine, sink) = engine();
        let a = receive(&engine, "A", 1, 50, Some(date(2024, 1, 10))).await;
        let b = receive(&engine, "B", 1, 50, Some(date(2024, 1, 20))).await;
        let so = order(&engine, "SO-1", &[(1, 60)]).await;
        engine.allocate(so.id, ACTOR).await.unwrap();
        let item = first_item(&engine, so.id).await;
        engine.pick(item.id, a.id, dec(50), ACTOR).await.unwrap();
        engine.pick(item.id, b.id, dec(10), ACTOR).await.unwrap();
        engine.mark_ready_to_ship(so.id, ACTOR).await.unwrap();
        engine.ship(so.id, ACTOR).await.unwrap();

        let outcome = engine.unship(so.id, ACTOR).await.unwrap();
        assert_eq!(outcome.order.status, OrderStatus::ReadyToShip);
        assert_eq!(outcome.restored.len(), 2);

        let a = engine.lot(a.id).await.unwrap();
        let b = engine.lot(b.id).await.unwrap();
        assert_eq!(a.quantity_current, dec(50));
        assert_eq!(a.status, LotStatus::Received);
        assert_eq!(a.quantity_reserved, dec(50));
        assert_eq!(b.quantity_current, dec(50));
        assert_eq!(b.quantity_reserved, dec(10));
        assert!(engine.order_progress(so.id).await.unwrap()[0].quantity_picked.is_zero());
        assert_eq!(
            sink.events()
                .iter()
                .filter(|e| e.action == AuditAction::QuantityRestored)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_unship_failure_changes_nothing() {
        let (engine, _) = engine();
        let a = receive(&engine, "A", 1, 50, Some(date(2024, 1, 10))).await;
        let b = receive(&engine, "B", 1, 50, Some(date(2024, 1, 20))).await;
        let so = order(&engine, "SO-1", &[(1, 60)]).await;
        engine.allocate(so.id, ACTOR).await.unwrap();
        let item = first_item(&engine, so.id).await;
        engine.pick(item.id, a.id, dec(50), ACTOR).await.unwrap();
        engine.pick(item.id, b.id, dec(10), ACTOR).await.unwrap();
        engine.mark_ready_to_ship(so.id, ACTOR).await.unwrap();
        engine.ship(so.id, ACTOR).await.unwrap();

        engine.store().fail_lot_update_after(2);
        let err = engine.unship(so.id, ACTOR).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));

        assert_eq!(engine.order(so.id).await.unwrap().status, OrderStatus::Shipped);
        assert!(engine.lot(a.id).await.unwrap().quantity_current.is_zero());
        assert_eq!(engine.lot(b.id).await.unwrap().quantity_current, dec(40));
        assert_eq!(engine.order_progress(so.id).await.unwrap()[0].quantity_picked, dec(60));
    }

    #[tokio::test]
    async fn test_unship_requires_shipped() {
        let (engine, _) = engine();
        let so = order(&engine, "SO-1", &[(1, 10)]).await;
        let err = engine.unship(so.id, ACTOR).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { operation: "unship", .. }));
    }
}
