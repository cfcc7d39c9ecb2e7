//! Production conversion: consume N source lots into one new lot.

use std::collections::HashSet;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use lotkeeper_core::{ActorId, LotStatus};

use super::InventoryEngine;
use super::lot_store;
use crate::config::YieldPolicy;
use crate::db::{Store, UnitOfWork};
use crate::error::EngineError;
use crate::models::production::yield_ratio;
use crate::models::{
    AuditAction, AuditEntity, AuditEvent, ConversionOutcome, ConvertInput, NewLot,
    NewProductionRun,
};

/// Lot number for a produced lot, e.g. `PR-20240115-3F2A9C1B`.
fn generate_lot_number(today: chrono::NaiveDate) -> String {
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(8);
    suffix.make_ascii_uppercase();
    format!("PR-{}-{suffix}", today.format("%Y%m%d"))
}

fn validate(input: &ConvertInput) -> Result<(), EngineError> {
    if input.quantity_produced <= Decimal::ZERO {
        return Err(EngineError::InvalidQuantity(format!(
            "produced quantity must be positive, got {}",
            input.quantity_produced
        )));
    }
    if input.sources.is_empty() {
        return Err(EngineError::InvalidInput(
            "conversion needs at least one source lot".to_string(),
        ));
    }
    if input
        .lot_number
        .as_deref()
        .is_some_and(|n| n.trim().is_empty())
    {
        return Err(EngineError::InvalidInput(
            "lot number must not be blank".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for source in &input.sources {
        if source.quantity <= Decimal::ZERO {
            return Err(EngineError::InvalidQuantity(format!(
                "consumed quantity must be positive, got {} for lot {}",
                source.quantity, source.lot_id
            )));
        }
        if !seen.insert(source.lot_id) {
            return Err(EngineError::InvalidInput(format!(
                "lot {} is listed more than once",
                source.lot_id
            )));
        }
    }
    Ok(())
}

impl<S: Store> InventoryEngine<S> {
    /// Consume the source lots (in the given order) and create one `PRODUCED` lot.
    ///
    /// Records one production run per source. The destination lot number is
    /// generated unless supplied; its expiry defaults to the earliest source
    /// expiry.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidQuantity` for non-positive quantities or a total out of range
    /// - `EngineError::InvalidInput` for no sources, duplicated sources or a blank lot number
    /// - `EngineError::YieldExceeded` when the yield policy rejects the ratio
    /// - `EngineError::InvalidState` if a source lot is not eligible
    /// - `EngineError::InsufficientInventory` naming the first source that ran short
    #[instrument(skip(self, input), fields(sources = input.sources.len(), output_product_id = %input.output_product_id))]
    pub async fn convert(
        &self,
        input: ConvertInput,
        actor: ActorId,
    ) -> Result<ConversionOutcome, EngineError> {
        validate(&input)?;
        let ratio = yield_ratio(input.quantity_produced, &input.sources).ok_or_else(|| {
            EngineError::InvalidQuantity("conversion quantities are out of range".to_string())
        })?;
        match self.config.yield_policy {
            YieldPolicy::Permit => {}
            YieldPolicy::Warn => {
                if ratio > Decimal::ONE {
                    warn!(yield_ratio = %ratio, "Conversion yield above one");
                }
            }
            YieldPolicy::Reject { max_yield } => {
                if ratio > max_yield {
                    warn!(yield_ratio = %ratio, max_yield = %max_yield, "Rejected conversion yield");
                    return Err(EngineError::YieldExceeded {
                        yield_ratio: ratio,
                        max_yield,
                    });
                }
            }
        }

        let mut tx = self.store.begin().await?;
        let mut sources = Vec::with_capacity(input.sources.len());
        let mut earliest_expiry = None;
        for source in &input.sources {
            let lot = lot_store::lock_existing(&mut tx, source.lot_id).await?;
            if !lot.status.is_eligible() {
                return Err(EngineError::invalid_state(
                    "lot",
                    &lot.lot_number,
                    lot.status,
                    "consume",
                ));
            }
            let available = lot.quantity_available();
            if available < source.quantity {
                return Err(EngineError::InsufficientInventory {
                    product_id: lot.product_id,
                    lot_id: Some(lot.id),
                    requested: source.quantity,
                    available,
                    shortfall: source.quantity - available,
                });
            }
            earliest_expiry = match (earliest_expiry, lot.expiry_date) {
                (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
                (a, b) => a.or(b),
            };
            sources.push(lot_store::adjust_quantity(&mut tx, lot.id, -source.quantity).await?);
        }

        let today = Utc::now().date_naive();
        let destination = tx
            .insert_lot(&NewLot {
                lot_number: input
                    .lot_number
                    .as_deref()
                    .map_or_else(|| generate_lot_number(today), |n| n.trim().to_string()),
                product_id: input.output_product_id,
                quantity: input.quantity_produced,
                unit_of_measure: input.unit_of_measure.clone(),
                received_date: today,
                expiry_date: input.expiry_date.or(earliest_expiry),
                origin: None,
                status: LotStatus::Produced,
            })
            .await?;

        let mut runs = Vec::with_capacity(input.sources.len());
        for source in &input.sources {
            runs.push(
                tx.insert_production_run(&NewProductionRun {
                    source_lot_id: source.lot_id,
                    destination_lot_id: destination.id,
                    quantity_consumed: source.quantity,
                    quantity_produced: input.quantity_produced,
                    unit_of_measure: input.unit_of_measure.clone(),
                    produced_by: actor,
                })
                .await?,
            );
        }
        tx.commit().await?;

        info!(
            destination_lot_id = %destination.id,
            lot_number = %destination.lot_number,
            yield_ratio = %ratio,
            "Converted lots"
        );

        let events: Vec<AuditEvent> = runs
            .iter()
            .map(|run| {
                AuditEvent::new(
                    actor,
                    AuditAction::ProductionConverted,
                    AuditEntity::ProductionRun,
                    run.id,
                    json!({
                        "source_lot_id": run.source_lot_id,
                        "destination_lot_id": run.destination_lot_id,
                        "quantity_consumed": run.quantity_consumed,
                        "quantity_produced": run.quantity_produced,
                        "unit_of_measure": run.unit_of_measure,
                    }),
                )
            })
            .collect();
        let audited = self.emit(&events);

        Ok(ConversionOutcome {
            destination,
            sources,
            runs,
            yield_ratio: ratio,
            audited,
        })
    }
}
