//! Traceability views: lineage of a lot, genealogy closure and recall reports.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use lotkeeper_core::{ActorId, InventoryLotId, OrderId, OrderPickId, ProductionRunId};

use super::lot::InventoryLot;
use super::order::{Order, OrderPick};
use super::production::ProductionRun;

/// A pick together with the order it was made for.
#[derive(Debug, Clone, Serialize)]
pub struct PickWithOrder {
    /// The pick itself.
    pub pick: OrderPick,
    /// The order the picked item belongs to.
    pub order: Order,
}

/// One-hop view of a lot's place in the genealogy.
#[derive(Debug, Clone, Serialize)]
pub struct LotLineage {
    /// The lot asked about.
    pub lot: InventoryLot,
    /// Runs that produced this lot (this lot is the destination).
    pub parents: Vec<ProductionRun>,
    /// Runs that consumed this lot (this lot is a source).
    pub children: Vec<ProductionRun>,
    /// Received (non-produced) lots at the root of this lot's chain.
    pub origins: Vec<InventoryLot>,
    /// Every pick that withdrew from this lot, with its order.
    pub picks: Vec<PickWithOrder>,
}

/// Which way a genealogy traversal walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceDirection {
    /// Towards the ingredients (destination -> sources).
    Upstream,
    /// Towards the products (source -> destinations).
    Downstream,
    /// Both ways.
    Both,
}

impl TraceDirection {
    /// Whether the traversal follows edges from destination to source.
    #[must_use]
    pub const fn walks_upstream(self) -> bool {
        matches!(self, Self::Upstream | Self::Both)
    }

    /// Whether the traversal follows edges from source to destination.
    #[must_use]
    pub const fn walks_downstream(self) -> bool {
        matches!(self, Self::Downstream | Self::Both)
    }
}

impl std::str::FromStr for TraceDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "upstream" | "up" => Ok(Self::Upstream),
            "downstream" | "down" => Ok(Self::Downstream),
            "both" => Ok(Self::Both),
            _ => Err(format!("invalid trace direction: {s}")),
        }
    }
}

/// A lot reached by a traversal.
#[derive(Debug, Clone, Serialize)]
pub struct LineageNode {
    /// The lot.
    pub lot: InventoryLot,
    /// Number of production hops from the root.
    pub depth: usize,
}

/// Transitive genealogy closure around a root lot.
#[derive(Debug, Clone, Serialize)]
pub struct LineageGraph {
    /// Lot the traversal started from.
    pub root: InventoryLotId,
    /// Every lot reached, keyed by id (root included at depth 0).
    pub nodes: BTreeMap<InventoryLotId, LineageNode>,
    /// Every run traversed, keyed by id.
    pub edges: BTreeMap<ProductionRunId, ProductionRun>,
    /// True when the depth bound stopped the traversal with edges left unexplored.
    pub truncated: bool,
}

impl LineageGraph {
    /// Lots reached, excluding the root.
    pub fn relatives(&self) -> impl Iterator<Item = &InventoryLot> {
        self.nodes
            .values()
            .filter(|n| n.lot.id != self.root)
            .map(|n| &n.lot)
    }
}

/// What a recall report starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RecallQuery {
    /// Lot number fragment (case-insensitive substring).
    LotNumber(String),
    /// Order number fragment (case-insensitive substring).
    OrderNumber(String),
}

impl RecallQuery {
    /// The raw search fragment.
    #[must_use]
    pub fn fragment(&self) -> &str {
        match self {
            Self::LotNumber(s) | Self::OrderNumber(s) => s,
        }
    }
}

/// An order affected by a recall, with the picks that tie it to affected lots.
#[derive(Debug, Clone, Serialize)]
pub struct AffectedOrder {
    /// The order.
    pub order: Order,
    /// Picks from affected lots, ordered by pick time then id.
    pub picks: Vec<OrderPick>,
    /// Sum of those picks.
    pub quantity_picked: Decimal,
}

/// Kind of entry on a recall audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventKind {
    /// Lot entered the warehouse through receiving.
    Received,
    /// Lot was created by a production conversion.
    Produced,
    /// Lot was consumed by a production conversion.
    Consumed,
    /// Lot quantity was reserved for an order.
    Allocated,
    /// Lot quantity was withdrawn for an order.
    Picked,
}

/// One entry of a recall audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// What happened.
    pub kind: TraceEventKind,
    /// Lot involved.
    pub lot_id: InventoryLotId,
    /// Lot number, for rendering.
    pub lot_number: String,
    /// Quantity moved.
    pub quantity: Decimal,
    /// Who did it, when recorded.
    pub actor: Option<ActorId>,
    /// Order involved, for allocations and picks.
    pub order_id: Option<OrderId>,
    /// Pick involved, for picks.
    pub pick_id: Option<OrderPickId>,
    /// Run involved, for production entries.
    pub run_id: Option<ProductionRunId>,
}

/// Flattened chain-of-custody summary for a recall.
#[derive(Debug, Clone, Serialize)]
pub struct RecallReport {
    /// The query the report answers.
    pub query: RecallQuery,
    /// When the report was assembled.
    pub generated_at: DateTime<Utc>,
    /// Lots the query matched directly (or that matched orders picked from).
    pub matched_lots: Vec<InventoryLot>,
    /// Every lot in the genealogy closure of the matched lots, by id.
    pub affected_lots: Vec<InventoryLot>,
    /// Every production run connecting affected lots, by id.
    pub production_runs: Vec<ProductionRun>,
    /// Every order that picked from an affected lot, by order id.
    pub orders: Vec<AffectedOrder>,
    /// Chronological trail of receiving, production and picking events.
    pub audit_trail: Vec<TraceEvent>,
    /// Whether the genealogy depth bound cut the closure short.
    pub truncated: bool,
}
