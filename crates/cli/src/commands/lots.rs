//! Receiving and lot maintenance commands.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;

use lotkeeper_core::{InventoryLotId, LotStatus, ProductId};
use lotkeeper_warehouse::models::ReceiveLotInput;

use super::{CliError, Context};

/// Arguments of `lk receive`.
pub struct ReceiveArgs {
    pub lot_number: String,
    pub product: i32,
    pub quantity: Decimal,
    pub unit: String,
    pub received: Option<NaiveDate>,
    pub expiry: Option<NaiveDate>,
    pub origin: Option<String>,
    pub qc: bool,
}

/// Receive a new lot.
///
/// # Errors
///
/// Returns `CliError` if the actor is missing or the engine refuses the lot.
pub async fn receive(ctx: &Context, args: ReceiveArgs) -> Result<(), CliError> {
    let actor = ctx.actor()?;
    let outcome = ctx
        .engine()
        .receive(
            ReceiveLotInput {
                lot_number: args.lot_number,
                product_id: ProductId::new(args.product),
                quantity: args.quantity,
                unit_of_measure: args.unit,
                received_date: args.received.unwrap_or_else(|| Utc::now().date_naive()),
                expiry_date: args.expiry,
                origin: args.origin,
                qc_required: args.qc,
            },
            actor,
        )
        .await?;
    ctx.emit_outcome(&outcome, outcome.audited)
}

/// Show a lot by numeric ID, falling back to an exact lot number.
///
/// # Errors
///
/// Returns `CliError::Engine` if no lot matches.
pub async fn show(ctx: &Context, lot: &str) -> Result<(), CliError> {
    let found = match lot.parse::<i32>() {
        Ok(id) => ctx.engine().lot(InventoryLotId::new(id)).await,
        Err(_) => ctx.engine().lot_by_number(lot).await,
    }?;
    ctx.emit(&found)
}

/// Change a lot's status.
///
/// # Errors
///
/// Returns `CliError` if the actor is missing or the transition is refused.
pub async fn set_status(ctx: &Context, lot_id: i32, status: LotStatus) -> Result<(), CliError> {
    let outcome = ctx
        .engine()
        .set_status(InventoryLotId::new(lot_id), status, ctx.actor()?)
        .await?;
    ctx.emit_outcome(&outcome, outcome.audited)
}

/// Correct a lot's on-hand quantity.
///
/// # Errors
///
/// Returns `CliError` if the actor is missing or the adjustment breaks the lot bounds.
pub async fn adjust(ctx: &Context, lot_id: i32, delta: Decimal) -> Result<(), CliError> {
    let outcome = ctx
        .engine()
        .adjust_quantity(InventoryLotId::new(lot_id), delta, ctx.actor()?)
        .await?;
    ctx.emit_outcome(&outcome, outcome.audited)
}

/// List a product's eligible lots in FIFO order.
///
/// # Errors
///
/// Returns `CliError::Engine` on storage failure.
pub async fn eligible(ctx: &Context, product_id: i32) -> Result<(), CliError> {
    let lots = ctx
        .engine()
        .list_eligible(ProductId::new(product_id))
        .await?;
    ctx.emit(&lots)
}

/// Expire lots past their expiry date.
///
/// # Errors
///
/// Returns `CliError` if the actor is missing or the update fails.
pub async fn expire(ctx: &Context, as_of: Option<NaiveDate>) -> Result<(), CliError> {
    let as_of = as_of.unwrap_or_else(|| Utc::now().date_naive());
    let outcome = ctx.engine().expire_lots(as_of, ctx.actor()?).await?;
    tracing::info!(expired = outcome.expired.len(), %as_of, "Expiry sweep finished");
    ctx.emit_outcome(&outcome, outcome.audited)
}
