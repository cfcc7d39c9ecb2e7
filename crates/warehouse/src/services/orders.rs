//! Order aggregate lifecycle and the hooks used by finalization/shipping.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, instrument, warn};

use lotkeeper_core::{ActorId, OrderId, OrderItemId, OrderStatus};

use super::InventoryEngine;
use super::lot_store;
use crate::db::{Store, UnitOfWork};
use crate::error::EngineError;
use crate::models::order::derive_picking_status;
use crate::models::{
    AuditAction, AuditEntity, AuditEvent, CreateOrderInput, ItemPickSummary, Order, OrderOutcome,
    PickProgress,
};

/// Lock an order, failing with `NotFound` if it does not exist.
pub(crate) async fn lock_existing<U: UnitOfWork>(
    tx: &mut U,
    order_id: OrderId,
) -> Result<Order, EngineError> {
    tx.lock_order(order_id)
        .await?
        .ok_or_else(|| EngineError::not_found("order", order_id))
}

/// Items of an order with their picked totals, by line number.
pub(crate) async fn item_summaries<U: UnitOfWork>(
    tx: &mut U,
    order_id: OrderId,
) -> Result<Vec<ItemPickSummary>, EngineError> {
    let items = tx.order_items(order_id).await?;
    let mut picked: HashMap<OrderItemId, Decimal> = HashMap::new();
    for pick in tx.picks_for_order(order_id).await? {
        *picked.entry(pick.order_item_id).or_default() += pick.quantity;
    }
    Ok(items
        .into_iter()
        .map(|item| {
            let quantity_picked = picked.get(&item.id).copied().unwrap_or_default();
            let progress = PickProgress::of(quantity_picked, item.quantity_ordered);
            ItemPickSummary {
                item,
                quantity_picked,
                progress,
            }
        })
        .collect())
}

/// Re-derive the picking-phase status of a locked order and persist it if it changed.
pub(crate) async fn refresh_picking_status<U: UnitOfWork>(
    tx: &mut U,
    order: Order,
) -> Result<Order, EngineError> {
    let summaries = item_summaries(tx, order.id).await?;
    let status = derive_picking_status(&summaries);
    if status == order.status {
        return Ok(order);
    }
    Ok(tx.update_order_status(order.id, status).await?)
}

fn all_complete(summaries: &[ItemPickSummary]) -> bool {
    summaries
        .iter()
        .all(|s| s.progress == PickProgress::Complete)
}

/// Whether every item of the order has its full ordered quantity picked.
pub(crate) async fn fully_picked<U: UnitOfWork>(
    tx: &mut U,
    order_id: OrderId,
) -> Result<bool, EngineError> {
    Ok(all_complete(&item_summaries(tx, order_id).await?))
}

impl<S: Store> InventoryEngine<S> {
    /// Create an order in `DRAFT`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidInput` for a blank order number or an
    /// order without items, `EngineError::InvalidQuantity` for a non-positive
    /// item quantity or an ordered total out of range, and
    /// `EngineError::Storage` if the order number is taken.
    #[instrument(skip(self, input), fields(order_number = %input.order_number))]
    pub async fn create_order(
        &self,
        input: CreateOrderInput,
        actor: ActorId,
    ) -> Result<OrderOutcome, EngineError> {
        if input.order_number.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "order number must not be blank".to_string(),
            ));
        }
        if input.items.is_empty() {
            return Err(EngineError::InvalidInput(
                "order must have at least one item".to_string(),
            ));
        }
        if let Some(item) = input
            .items
            .iter()
            .find(|i| i.quantity_ordered <= Decimal::ZERO)
        {
            return Err(EngineError::InvalidQuantity(format!(
                "ordered quantity must be positive, got {} for product {}",
                item.quantity_ordered, item.product_id
            )));
        }
        if input
            .items
            .iter()
            .try_fold(Decimal::ZERO, |acc, i| acc.checked_add(i.quantity_ordered))
            .is_none()
        {
            return Err(EngineError::InvalidQuantity(
                "ordered total is out of range".to_string(),
            ));
        }

        let mut tx = self.store.begin().await?;
        let (order, items) = tx.insert_order(&input).await?;
        tx.commit().await?;

        info!(order_id = %order.id, items = items.len(), "Created order");

        let audited = self.emit(&[AuditEvent::new(
            actor,
            AuditAction::OrderCreated,
            AuditEntity::Order,
            order.id,
            json!({
                "order_number": order.order_number,
                "items": items
                    .iter()
                    .map(|i| json!({ "product_id": i.product_id, "quantity_ordered": i.quantity_ordered }))
                    .collect::<Vec<_>>(),
            }),
        )]);
        Ok(OrderOutcome {
            order,
            items,
            audited,
        })
    }

    /// Read an order.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotFound` if the order does not exist.
    pub async fn order(&self, order_id: OrderId) -> Result<Order, EngineError> {
        let mut tx = self.store.begin().await?;
        tx.get_order(order_id)
            .await?
            .ok_or_else(|| EngineError::not_found("order", order_id))
    }

    /// Per-item picking progress of an order, by line number.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotFound` if the order does not exist.
    pub async fn order_progress(
        &self,
        order_id: OrderId,
    ) -> Result<Vec<ItemPickSummary>, EngineError> {
        let mut tx = self.store.begin().await?;
        if tx.get_order(order_id).await?.is_none() {
            return Err(EngineError::not_found("order", order_id));
        }
        item_summaries(&mut tx, order_id).await
    }

    /// Whether every item of the order has been picked in full.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotFound` if the order does not exist.
    pub async fn is_complete(&self, order_id: OrderId) -> Result<bool, EngineError> {
        Ok(all_complete(&self.order_progress(order_id).await?))
    }

    /// Move a fully picked order to `READY_TO_SHIP`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless the order is `PICKING` or
    /// `PARTIAL_PICK` with every item complete.
    #[instrument(skip(self))]
    pub async fn mark_ready_to_ship(
        &self,
        order_id: OrderId,
        actor: ActorId,
    ) -> Result<OrderOutcome, EngineError> {
        let mut tx = self.store.begin().await?;
        let order = lock_existing(&mut tx, order_id).await?;
        if !matches!(order.status, OrderStatus::Picking | OrderStatus::PartialPick) {
            return Err(EngineError::invalid_state(
                "order",
                &order.order_number,
                order.status,
                "mark ready to ship",
            ));
        }
        let summaries = item_summaries(&mut tx, order_id).await?;
        if !all_complete(&summaries) {
            warn!(order_id = %order_id, "Refused to mark an incomplete order ready to ship");
            return Err(EngineError::invalid_state(
                "order",
                &order.order_number,
                "incomplete",
                "mark ready to ship",
            ));
        }
        let order = tx
            .update_order_status(order_id, OrderStatus::ReadyToShip)
            .await?;
        tx.commit().await?;

        info!("Order ready to ship");

        let audited = self.emit(&[AuditEvent::new(
            actor,
            AuditAction::ReadyToShip,
            AuditEntity::Order,
            order.id,
            json!({ "order_number": order.order_number }),
        )]);
        Ok(OrderOutcome {
            order,
            items: summaries.into_iter().map(|s| s.item).collect(),
            audited,
        })
    }

    /// Ship a `READY_TO_SHIP` order, releasing any reservation its picks left unused.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidState` unless the order is `READY_TO_SHIP`
    /// with every item fully picked.
    #[instrument(skip(self))]
    pub async fn ship(&self, order_id: OrderId, actor: ActorId) -> Result<OrderOutcome, EngineError> {
        let mut tx = self.store.begin().await?;
        let order = lock_existing(&mut tx, order_id).await?;
        if order.status != OrderStatus::ReadyToShip {
            return Err(EngineError::invalid_state(
                "order",
                &order.order_number,
                order.status,
                "ship",
            ));
        }
        if !fully_picked(&mut tx, order_id).await? {
            warn!(order_id = %order_id, "Refused to ship an incomplete order");
            return Err(EngineError::invalid_state(
                "order",
                &order.order_number,
                "incomplete",
                "ship",
            ));
        }

        let mut released = Decimal::ZERO;
        let mut allocations = tx.allocations_for_order(order_id).await?;
        allocations.sort_by_key(|a| (a.lot_id, a.id));
        for allocation in allocations {
            let outstanding = allocation.outstanding();
            if outstanding > Decimal::ZERO {
                lot_store::reserve(&mut tx, allocation.lot_id, -outstanding).await?;
                tx.set_allocation_fulfilled(allocation.id, allocation.quantity)
                    .await?;
                released += outstanding;
            }
        }

        let order = tx
            .update_order_status(order_id, OrderStatus::Shipped)
            .await?;
        let items = tx.order_items(order_id).await?;
        tx.commit().await?;

        info!(released = %released, "Shipped order");

        let audited = self.emit(&[AuditEvent::new(
            actor,
            AuditAction::Shipped,
            AuditEntity::Order,
            order.id,
            json!({ "order_number": order.order_number, "reservation_released": released }),
        )]);
        Ok(OrderOutcome {
            order,
            items,
            audited,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use lotkeeper_core::ProductId;

    use super::*;
    use crate::models::CreateOrderItemInput;
    use crate::services::testing::{ACTOR, dec, engine, order, receive};

    #[tokio::test]
    async fn test_create_order_starts_in_draft() {
        let (engine, sink) = engine();
        let outcome = engine
            .create_order(
                CreateOrderInput {
                    order_number: "SO-1".to_string(),
                    items: vec![
                        CreateOrderItemInput {
                            product_id: ProductId::new(1),
                            quantity_ordered: dec(10),
                        },
                        CreateOrderItemInput {
                            product_id: ProductId::new(2),
                            quantity_ordered: dec(5),
                        },
                    ],
                },
                ACTOR,
            )
            .await
            .unwrap();

        assert_eq!(outcome.order.status, OrderStatus::Draft);
        assert_eq!(outcome.items.len(), 2);
        assert_eq!(outcome.items[1].line_number, 2);
        assert!(outcome.audited);
        assert_eq!(sink.events()[0].action, AuditAction::OrderCreated);
    }

    #[tokio::test]
    async fn test_create_order_rejects_bad_input() {
        let (engine, _) = engine();
        let empty = CreateOrderInput {
            order_number: "SO-1".to_string(),
            items: vec![],
        };
        assert!(matches!(
            engine.create_order(empty, ACTOR).await,
            Err(EngineError::InvalidInput(_))
        ));

        let blank = CreateOrderInput {
            order_number: "  ".to_string(),
            items: vec![CreateOrderItemInput {
                product_id: ProductId::new(1),
                quantity_ordered: dec(1),
            }],
        };
        assert!(matches!(
            engine.create_order(blank, ACTOR).await,
            Err(EngineError::InvalidInput(_))
        ));

        let huge = CreateOrderInput {
            order_number: "SO-1".to_string(),
            items: vec![
                CreateOrderItemInput {
                    product_id: ProductId::new(1),
                    quantity_ordered: Decimal::MAX,
                };
                2
            ],
        };
        assert!(matches!(
            engine.create_order(huge, ACTOR).await,
            Err(EngineError::InvalidQuantity(_))
        ));

        let zero = CreateOrderInput {
            order_number: "SO-1".to_string(),
            items: vec![CreateOrderItemInput {
                product_id: ProductId::new(1),
                quantity_ordered: Decimal::ZERO,
            }],
        };
        assert!(matches!(
            engine.create_order(zero, ACTOR).await,
            Err(EngineError::InvalidQuantity(_))
        ));
    }

    #[tokio::test]
    async fn test_ship_workflow() {
        let (engine, _) = engine();
        let lot = receive(&engine, "A", 1, 20, None).await;
        let so = order(&engine, "SO-1", &[(1, 10)]).await;
        engine.allocate(so.id, ACTOR).await.unwrap();
        let item = engine.order_progress(so.id).await.unwrap()[0].item.clone();

        engine.pick(item.id, lot.id, dec(4), ACTOR).await.unwrap();
        assert!(!engine.is_complete(so.id).await.unwrap());
        let err = engine.mark_ready_to_ship(so.id, ACTOR).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));

        engine.pick(item.id, lot.id, dec(6), ACTOR).await.unwrap();
        assert!(engine.is_complete(so.id).await.unwrap());

        let ready = engine.mark_ready_to_ship(so.id, ACTOR).await.unwrap();
        assert_eq!(ready.order.status, OrderStatus::ReadyToShip);

        let shipped = engine.ship(so.id, ACTOR).await.unwrap();
        assert_eq!(shipped.order.status, OrderStatus::Shipped);

        let lot = engine.lot(lot.id).await.unwrap();
        assert_eq!(lot.quantity_current, dec(10));
        assert_eq!(lot.quantity_reserved, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_ship_requires_ready_to_ship() {
        let (engine, _) = engine();
        let so = order(&engine, "SO-1", &[(1, 10)]).await;
        let err = engine.ship(so.id, ACTOR).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { operation: "ship", .. }));
    }

    #[tokio::test]
    async fn test_unshipped_order_ships_again_only_when_fully_picked() {
        let (engine, _) = engine();
        let lot = receive(&engine, "A", 1, 20, None).await;
        let so = order(&engine, "SO-1", &[(1, 10)]).await;
        engine.allocate(so.id, ACTOR).await.unwrap();
        let item = engine.order_progress(so.id).await.unwrap()[0].item.clone();
        engine.pick(item.id, lot.id, dec(10), ACTOR).await.unwrap();
        engine.mark_ready_to_ship(so.id, ACTOR).await.unwrap();
        engine.ship(so.id, ACTOR).await.unwrap();

        let unshipped = engine.unship(so.id, ACTOR).await.unwrap();
        assert_eq!(unshipped.order.status, OrderStatus::ReadyToShip);
        assert!(!engine.is_complete(so.id).await.unwrap());

        let err = engine.ship(so.id, ACTOR).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidState { status, operation: "ship", .. } if status == "incomplete"
        ));
        assert_eq!(
            engine.order(so.id).await.unwrap().status,
            OrderStatus::ReadyToShip
        );

        let picked = engine.pick(item.id, lot.id, dec(10), ACTOR).await.unwrap();
        assert_eq!(picked.order.status, OrderStatus::Picking);
        engine.mark_ready_to_ship(so.id, ACTOR).await.unwrap();
        let shipped = engine.ship(so.id, ACTOR).await.unwrap();
        assert_eq!(shipped.order.status, OrderStatus::Shipped);
        assert_eq!(engine.lot(lot.id).await.unwrap().quantity_current, dec(10));
    }

    #[tokio::test]
    async fn test_fully_picked_ready_order_refuses_more_picks() {
        let (engine, _) = engine();
        let lot = receive(&engine, "A", 1, 20, None).await;
        let so = order(&engine, "SO-1", &[(1, 5)]).await;
        engine.allocate(so.id, ACTOR).await.unwrap();
        let item = engine.order_progress(so.id).await.unwrap()[0].item.clone();
        engine.pick(item.id, lot.id, dec(5), ACTOR).await.unwrap();
        engine.mark_ready_to_ship(so.id, ACTOR).await.unwrap();

        let err = engine.pick(item.id, lot.id, dec(1), ACTOR).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { operation: "pick for", .. }));
    }

    #[tokio::test]
    async fn test_unknown_order_is_not_found() {
        let (engine, _) = engine();
        let err = engine.is_complete(OrderId::new(42)).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: "order", .. }));
    }
}
