//! Production conversion command.
//!
//! A conversion is given either inline (`-s lot:qty` per source) or as a plan
//! file in YAML or JSON:
//!
//! ```yaml
//! sources:
//!   - { lot_id: 3, quantity: "20" }
//!   - { lot_id: 4, quantity: "15" }
//! output_product_id: 90
//! quantity_produced: "30"
//! unit_of_measure: jar
//! ```

use std::path::Path;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use lotkeeper_core::ProductId;
use lotkeeper_warehouse::models::{ConversionSource, ConvertInput};

use super::{CliError, Context};

/// Build a conversion from command-line arguments.
///
/// # Errors
///
/// Returns `CliError::InvalidArgs` if a required part is missing.
pub fn input_from_args(
    sources: Vec<ConversionSource>,
    product: Option<i32>,
    quantity: Option<Decimal>,
    unit: Option<String>,
    lot_number: Option<String>,
    expiry: Option<NaiveDate>,
) -> Result<ConvertInput, CliError> {
    let missing = |what: &str| CliError::InvalidArgs(format!("convert needs {what}"));
    Ok(ConvertInput {
        sources,
        output_product_id: ProductId::new(product.ok_or_else(|| missing("--product"))?),
        quantity_produced: quantity.ok_or_else(|| missing("--quantity"))?,
        unit_of_measure: unit.ok_or_else(|| missing("--unit"))?,
        lot_number,
        expiry_date: expiry,
    })
}

/// Read a conversion plan; `.json` files are parsed as JSON, anything else as YAML.
///
/// # Errors
///
/// Returns `CliError` if the file cannot be read or parsed.
pub fn load_plan(path: &Path) -> Result<ConvertInput, CliError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_plan(path, &raw)
}

fn parse_plan(path: &Path, raw: &str) -> Result<ConvertInput, CliError> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        Ok(serde_json::from_str(raw)?)
    } else {
        Ok(serde_yaml::from_str(raw)?)
    }
}

/// Run a conversion.
///
/// # Errors
///
/// Returns `CliError` if the actor is missing or the engine refuses the conversion.
pub async fn convert(ctx: &Context, input: ConvertInput) -> Result<(), CliError> {
    let outcome = ctx.engine().convert(input, ctx.actor()?).await?;
    tracing::info!(
        lot_number = %outcome.destination.lot_number,
        yield_ratio = %outcome.yield_ratio,
        "Conversion committed"
    );
    ctx.emit_outcome(&outcome, outcome.audited)
}
