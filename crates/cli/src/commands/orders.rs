//! Order lifecycle commands: creation, allocation, picking and shipping.

use rust_decimal::Decimal;
use serde::Serialize;

use lotkeeper_core::{InventoryLotId, OrderId, OrderItemId, OrderPickId};
use lotkeeper_warehouse::models::{
    CreateOrderInput, CreateOrderItemInput, ItemPickSummary, Order, PickProgress,
};

use super::{CliError, Context};

#[derive(Serialize)]
struct OrderView {
    order: Order,
    items: Vec<ItemPickSummary>,
    complete: bool,
}

/// Create a draft order.
///
/// # Errors
///
/// Returns `CliError` if the actor is missing or the order is rejected.
pub async fn create(
    ctx: &Context,
    order_number: String,
    items: Vec<CreateOrderItemInput>,
) -> Result<(), CliError> {
    let outcome = ctx
        .engine()
        .create_order(
            CreateOrderInput {
                order_number,
                items,
            },
            ctx.actor()?,
        )
        .await?;
    ctx.emit_outcome(&outcome, outcome.audited)
}

/// Show an order with per-item pick progress.
///
/// # Errors
///
/// Returns `CliError::Engine` if the order does not exist.
pub async fn show(ctx: &Context, order_id: i32) -> Result<(), CliError> {
    let order_id = OrderId::new(order_id);
    let order = ctx.engine().order(order_id).await?;
    let items = ctx.engine().order_progress(order_id).await?;
    let complete = items.iter().all(|i| i.progress == PickProgress::Complete);
    ctx.emit(&OrderView {
        order,
        items,
        complete,
    })
}

/// Allocate a draft order.
///
/// # Errors
///
/// Returns `CliError` if the actor is missing or stock is short.
pub async fn allocate(ctx: &Context, order_id: i32) -> Result<(), CliError> {
    let outcome = ctx
        .engine()
        .allocate(OrderId::new(order_id), ctx.actor()?)
        .await?;
    ctx.emit_outcome(&outcome, outcome.audited)
}

/// Release a confirmed order's reservations.
///
/// # Errors
///
/// Returns `CliError` if the actor is missing or the order has picks.
pub async fn deallocate(ctx: &Context, order_id: i32) -> Result<(), CliError> {
    let outcome = ctx
        .engine()
        .deallocate(OrderId::new(order_id), ctx.actor()?)
        .await?;
    ctx.emit_outcome(&outcome, outcome.audited)
}

/// Pick quantity from a lot for an order item.
///
/// # Errors
///
/// Returns `CliError` if the actor is missing or the pick is refused.
pub async fn pick(
    ctx: &Context,
    item_id: i32,
    lot_id: i32,
    quantity: Decimal,
) -> Result<(), CliError> {
    let outcome = ctx
        .engine()
        .pick(
            OrderItemId::new(item_id),
            InventoryLotId::new(lot_id),
            quantity,
            ctx.actor()?,
        )
        .await?;
    ctx.emit_outcome(&outcome, outcome.audited)
}

/// Revert a pick.
///
/// # Errors
///
/// Returns `CliError` if the actor is missing or the order no longer accepts reversals.
pub async fn unpick(ctx: &Context, pick_id: i32) -> Result<(), CliError> {
    let outcome = ctx
        .engine()
        .revert_pick(OrderPickId::new(pick_id), ctx.actor()?)
        .await?;
    ctx.emit_outcome(&outcome, outcome.audited)
}

/// Mark a fully picked order ready to ship.
///
/// # Errors
///
/// Returns `CliError` if the actor is missing or the order is incomplete.
pub async fn ready(ctx: &Context, order_id: i32) -> Result<(), CliError> {
    let outcome = ctx
        .engine()
        .mark_ready_to_ship(OrderId::new(order_id), ctx.actor()?)
        .await?;
    ctx.emit_outcome(&outcome, outcome.audited)
}

/// Ship a ready order.
///
/// # Errors
///
/// Returns `CliError` if the actor is missing or the order is not ready.
pub async fn ship(ctx: &Context, order_id: i32) -> Result<(), CliError> {
    let outcome = ctx
        .engine()
        .ship(OrderId::new(order_id), ctx.actor()?)
        .await?;
    ctx.emit_outcome(&outcome, outcome.audited)
}

/// Reverse a shipment.
///
/// # Errors
///
/// Returns `CliError` if the actor is missing or the order was not shipped.
pub async fn unship(ctx: &Context, order_id: i32) -> Result<(), CliError> {
    let outcome = ctx
        .engine()
        .unship(OrderId::new(order_id), ctx.actor()?)
        .await?;
    ctx.emit_outcome(&outcome, outcome.audited)
}
