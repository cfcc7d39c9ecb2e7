//! Traceability commands: lineage, genealogy traversal and recall reports.

use lotkeeper_core::InventoryLotId;
use lotkeeper_warehouse::models::{RecallQuery, TraceDirection};

use super::{CliError, Context};

/// Show the one-hop lineage of a lot.
///
/// # Errors
///
/// Returns `CliError::Engine` if the lot does not exist.
pub async fn lineage(ctx: &Context, lot_id: i32) -> Result<(), CliError> {
    let lineage = ctx.engine().lot_lineage(InventoryLotId::new(lot_id)).await?;
    ctx.emit(&lineage)
}

/// Show the genealogy closure around a lot.
///
/// # Errors
///
/// Returns `CliError::Engine` if the lot does not exist.
pub async fn trace(
    ctx: &Context,
    lot_id: i32,
    direction: TraceDirection,
    max_depth: Option<usize>,
) -> Result<(), CliError> {
    let graph = ctx
        .engine()
        .trace(InventoryLotId::new(lot_id), direction, max_depth)
        .await?;
    if graph.truncated {
        tracing::warn!("Traversal stopped at the depth bound; the graph is incomplete");
    }
    ctx.emit(&graph)
}

/// Build a recall report.
///
/// # Errors
///
/// Returns `CliError::InvalidArgs` unless exactly one fragment is given.
pub async fn recall(
    ctx: &Context,
    lot: Option<String>,
    order: Option<String>,
    max_depth: Option<usize>,
) -> Result<(), CliError> {
    let query = match (lot, order) {
        (Some(lot), None) => RecallQuery::LotNumber(lot),
        (None, Some(order)) => RecallQuery::OrderNumber(order),
        _ => {
            return Err(CliError::InvalidArgs(
                "recall needs exactly one of --lot or --order".to_string(),
            ));
        }
    };
    let report = ctx.engine().recall_report(query, max_depth).await?;
    tracing::info!(
        matched = report.matched_lots.len(),
        affected = report.affected_lots.len(),
        orders = report.orders.len(),
        "Recall report assembled"
    );
    ctx.emit(&report)
}
