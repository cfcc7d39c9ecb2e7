//! Production conversion models: genealogy edges between lots.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use lotkeeper_core::{ActorId, InventoryLotId, ProductId, ProductionRunId};

use super::lot::InventoryLot;

/// One genealogy edge: a source lot consumed into a destination lot.
///
/// A conversion with N sources records N runs sharing the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionRun {
    /// Unique run ID.
    pub id: ProductionRunId,
    /// Lot consumed.
    pub source_lot_id: InventoryLotId,
    /// Lot produced.
    pub destination_lot_id: InventoryLotId,
    /// Quantity taken from the source lot.
    pub quantity_consumed: Decimal,
    /// Quantity of the destination lot produced by the whole conversion.
    pub quantity_produced: Decimal,
    /// Unit the destination quantity is expressed in.
    pub unit_of_measure: String,
    /// Who ran the conversion.
    pub produced_by: ActorId,
    /// When the conversion happened.
    pub produced_at: DateTime<Utc>,
}

/// Row-level input for inserting a run.
#[derive(Debug, Clone)]
pub struct NewProductionRun {
    /// Lot consumed.
    pub source_lot_id: InventoryLotId,
    /// Lot produced.
    pub destination_lot_id: InventoryLotId,
    /// Quantity consumed from the source.
    pub quantity_consumed: Decimal,
    /// Quantity produced by the conversion.
    pub quantity_produced: Decimal,
    /// Unit of the destination quantity.
    pub unit_of_measure: String,
    /// Who ran the conversion.
    pub produced_by: ActorId,
}

/// A source lot and the quantity a conversion takes from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionSource {
    /// Lot to consume.
    pub lot_id: InventoryLotId,
    /// Quantity to consume.
    pub quantity: Decimal,
}

/// Input for a production conversion.
#[derive(Debug, Clone, Deserialize)]
pub struct ConvertInput {
    /// Sources, consumed and locked in this order.
    pub sources: Vec<ConversionSource>,
    /// Product of the destination lot.
    pub output_product_id: ProductId,
    /// Quantity of the destination lot.
    pub quantity_produced: Decimal,
    /// Unit of the destination quantity.
    pub unit_of_measure: String,
    /// Lot number for the destination; generated when absent.
    #[serde(default)]
    pub lot_number: Option<String>,
    /// Expiry of the destination lot; defaults to the earliest source expiry.
    #[serde(default)]
    pub expiry_date: Option<NaiveDate>,
}

/// Result of a committed conversion.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionOutcome {
    /// The newly produced lot.
    pub destination: InventoryLot,
    /// Source lots after consumption, in input order.
    pub sources: Vec<InventoryLot>,
    /// One run per source, in input order.
    pub runs: Vec<ProductionRun>,
    /// `quantity_produced / sum(quantity_consumed)`.
    pub yield_ratio: Decimal,
    /// Whether every audit event was delivered.
    pub audited: bool,
}

/// `produced / consumed`, or `None` when nothing was consumed or the
/// arithmetic leaves the `Decimal` range.
#[must_use]
pub fn yield_ratio(quantity_produced: Decimal, consumed: &[ConversionSource]) -> Option<Decimal> {
    let total = consumed
        .iter()
        .try_fold(Decimal::ZERO, |acc, s| acc.checked_add(s.quantity))?;
    quantity_produced.checked_div(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: i32, quantity: i64) -> ConversionSource {
        ConversionSource {
            lot_id: InventoryLotId::new(id),
            quantity: Decimal::from(quantity),
        }
    }

    #[test]
    fn test_yield_ratio() {
        let ratio = yield_ratio(Decimal::from(30), &[source(1, 20), source(2, 15)]);
        assert_eq!(
            ratio.map(|r| r.round_dp(4)),
            Some(Decimal::new(8571, 4))
        );
    }

    #[test]
    fn test_yield_ratio_out_of_range() {
        let huge = ConversionSource {
            lot_id: InventoryLotId::new(1),
            quantity: Decimal::MAX,
        };
        assert_eq!(yield_ratio(Decimal::ONE, &[huge.clone(), huge]), None);
        assert_eq!(yield_ratio(Decimal::ONE, &[]), None);
    }

    #[test]
    fn test_yield_ratio_above_one() {
        let ratio = yield_ratio(Decimal::from(12), &[source(1, 10)]);
        assert_eq!(ratio, Some(Decimal::new(12, 1)));
    }

    #[test]
    fn test_yield_ratio_without_consumption() {
        assert_eq!(yield_ratio(Decimal::ONE, &[]), None);
    }
}
