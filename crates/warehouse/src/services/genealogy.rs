//! Traceability: one-hop lineage, bounded genealogy traversal and recall reports.
//!
//! Production runs form a DAG over lots (source -> destination). Traversals are
//! breadth-first with a visited set, so a corrupt cycle terminates instead of
//! looping, and stop at a configurable number of hops.
//!
//! Every read here runs in a unit of work that is dropped, never committed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, instrument};

use lotkeeper_core::{InventoryLotId, OrderId, OrderItemId, ProductionRunId};

use super::InventoryEngine;
use crate::db::{RepositoryError, Store, UnitOfWork};
use crate::error::EngineError;
use crate::models::{
    AffectedOrder, InventoryLot, LineageGraph, LineageNode, LotLineage, Order, OrderPick,
    PickWithOrder, ProductionRun, RecallQuery, RecallReport, TraceDirection, TraceEvent,
    TraceEventKind,
};

// =============================================================================
// Traversal
// =============================================================================

/// Lots and runs reached from a set of seed lots.
#[derive(Debug, Default)]
struct Closure {
    nodes: BTreeMap<InventoryLotId, LineageNode>,
    edges: BTreeMap<ProductionRunId, ProductionRun>,
    /// Lots with no edge in the walked direction.
    terminals: BTreeSet<InventoryLotId>,
    truncated: bool,
}

impl Closure {
    fn seed(seeds: &[InventoryLot]) -> Self {
        let mut closure = Self::default();
        for lot in seeds {
            closure.nodes.insert(
                lot.id,
                LineageNode {
                    lot: lot.clone(),
                    depth: 0,
                },
            );
        }
        closure
    }

    /// Breadth-first walk from every depth-0 node, upstream or downstream.
    async fn walk<U: UnitOfWork>(
        &mut self,
        tx: &mut U,
        upstream: bool,
        max_depth: usize,
    ) -> Result<(), EngineError> {
        let mut queue: VecDeque<(InventoryLotId, usize)> = self
            .nodes
            .values()
            .filter(|n| n.depth == 0)
            .map(|n| (n.lot.id, 0))
            .collect();
        let mut visited: HashSet<InventoryLotId> = queue.iter().map(|(id, _)| *id).collect();

        while let Some((lot_id, depth)) = queue.pop_front() {
            let runs = if upstream {
                tx.runs_by_destination(lot_id).await?
            } else {
                tx.runs_by_source(lot_id).await?
            };
            if runs.is_empty() {
                self.terminals.insert(lot_id);
                continue;
            }
            if depth >= max_depth {
                self.truncated = true;
                continue;
            }

            let mut next = Vec::new();
            for run in runs {
                let neighbour = if upstream {
                    run.source_lot_id
                } else {
                    run.destination_lot_id
                };
                if visited.insert(neighbour) {
                    next.push(neighbour);
                }
                self.edges.insert(run.id, run);
            }
            if next.is_empty() {
                continue;
            }

            let lots = tx.get_lots(&next).await?;
            if lots.len() != next.len() {
                return Err(RepositoryError::DataCorruption(format!(
                    "production run from lot {lot_id} references a missing lot"
                ))
                .into());
            }
            for lot in lots {
                let id = lot.id;
                self.nodes
                    .entry(id)
                    .and_modify(|n| n.depth = n.depth.min(depth + 1))
                    .or_insert(LineageNode {
                        lot,
                        depth: depth + 1,
                    });
                queue.push_back((id, depth + 1));
            }
        }
        Ok(())
    }
}

/// Memoised item -> order resolution for picks and allocations.
#[derive(Debug, Default)]
struct OrderLookup {
    item_orders: HashMap<OrderItemId, OrderId>,
    orders: HashMap<OrderId, Order>,
}

impl OrderLookup {
    async fn order_for_item<U: UnitOfWork>(
        &mut self,
        tx: &mut U,
        item_id: OrderItemId,
    ) -> Result<Order, EngineError> {
        let order_id = match self.item_orders.get(&item_id) {
            Some(id) => *id,
            None => {
                let item = tx
                    .get_order_item(item_id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("order item", item_id))?;
                self.item_orders.insert(item_id, item.order_id);
                item.order_id
            }
        };
        if let Some(order) = self.orders.get(&order_id) {
            return Ok(order.clone());
        }
        let order = tx
            .get_order(order_id)
            .await?
            .ok_or_else(|| EngineError::not_found("order", order_id))?;
        self.orders.insert(order_id, order.clone());
        Ok(order)
    }
}

impl<S: Store> InventoryEngine<S> {
    fn depth_bound(&self, max_depth: Option<usize>) -> usize {
        max_depth.map_or(self.config.lineage_max_depth, |d| {
            d.min(self.config.lineage_max_depth)
        })
    }

    /// One-hop lineage of a lot: producing runs, consuming runs, received
    /// origins and the picks that withdrew from it.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotFound` if the lot does not exist.
    #[instrument(skip(self))]
    pub async fn lot_lineage(&self, lot_id: InventoryLotId) -> Result<LotLineage, EngineError> {
        let mut tx = self.store.begin().await?;
        let lot = tx
            .get_lot(lot_id)
            .await?
            .ok_or_else(|| EngineError::not_found("lot", lot_id))?;
        let parents = tx.runs_by_destination(lot_id).await?;
        let children = tx.runs_by_source(lot_id).await?;

        let mut upstream = Closure::seed(std::slice::from_ref(&lot));
        upstream
            .walk(&mut tx, true, self.config.lineage_max_depth)
            .await?;
        let origins = upstream
            .terminals
            .iter()
            .filter_map(|id| upstream.nodes.get(id).map(|n| n.lot.clone()))
            .collect();

        let mut lookup = OrderLookup::default();
        let mut picks = Vec::new();
        for pick in tx.picks_for_lot(lot_id).await? {
            let order = lookup.order_for_item(&mut tx, pick.order_item_id).await?;
            picks.push(PickWithOrder { pick, order });
        }

        Ok(LotLineage {
            lot,
            parents,
            children,
            origins,
            picks,
        })
    }

    /// Transitive genealogy closure around a lot.
    ///
    /// `max_depth` defaults to, and is capped by, the configured
    /// `lineage_max_depth`. `Both` merges an upstream and a downstream walk;
    /// it does not reach sibling lots.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotFound` if the lot does not exist.
    #[instrument(skip(self))]
    pub async fn trace(
        &self,
        lot_id: InventoryLotId,
        direction: TraceDirection,
        max_depth: Option<usize>,
    ) -> Result<LineageGraph, EngineError> {
        let max_depth = self.depth_bound(max_depth);
        let mut tx = self.store.begin().await?;
        let lot = tx
            .get_lot(lot_id)
            .await?
            .ok_or_else(|| EngineError::not_found("lot", lot_id))?;

        let mut closure = Closure::seed(&[lot]);
        if direction.walks_upstream() {
            closure.walk(&mut tx, true, max_depth).await?;
        }
        if direction.walks_downstream() {
            closure.walk(&mut tx, false, max_depth).await?;
        }
        debug!(
            nodes = closure.nodes.len(),
            edges = closure.edges.len(),
            truncated = closure.truncated,
            "Traced genealogy"
        );

        Ok(LineageGraph {
            root: lot_id,
            nodes: closure.nodes,
            edges: closure.edges,
            truncated: closure.truncated,
        })
    }

    /// Chain-of-custody report for every lot and order connected to the query.
    ///
    /// Seeds are the lots whose number matches, or the lots picked by the
    /// orders whose number matches. The report covers the genealogy closure of
    /// the seeds in both directions up to `max_depth` hops (configured bound
    /// when `None`).
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Storage` if the genealogy references missing rows.
    #[instrument(skip(self))]
    pub async fn recall_report(
        &self,
        query: RecallQuery,
        max_depth: Option<usize>,
    ) -> Result<RecallReport, EngineError> {
        let max_depth = self.depth_bound(max_depth);
        let mut tx = self.store.begin().await?;

        let mut matched_lots = match &query {
            RecallQuery::LotNumber(fragment) => tx.search_lots(fragment).await?,
            RecallQuery::OrderNumber(fragment) => {
                let mut lot_ids = BTreeSet::new();
                for order in tx.search_orders(fragment).await? {
                    lot_ids.extend(tx.picks_for_order(order.id).await?.iter().map(|p| p.lot_id));
                }
                let lot_ids: Vec<_> = lot_ids.into_iter().collect();
                tx.get_lots(&lot_ids).await?
            }
        };
        matched_lots.sort_by_key(|l| l.id);

        let mut closure = Closure::seed(&matched_lots);
        closure.walk(&mut tx, true, max_depth).await?;
        closure.walk(&mut tx, false, max_depth).await?;

        let affected_lots: Vec<InventoryLot> =
            closure.nodes.values().map(|n| n.lot.clone()).collect();
        let lot_numbers: HashMap<InventoryLotId, String> = affected_lots
            .iter()
            .map(|l| (l.id, l.lot_number.clone()))
            .collect();
        let lot_number = |id: InventoryLotId| lot_numbers.get(&id).cloned().unwrap_or_default();

        let mut lookup = OrderLookup::default();
        let mut orders: BTreeMap<OrderId, (Order, Vec<OrderPick>)> = BTreeMap::new();
        let mut trail = Vec::new();

        for lot in &affected_lots {
            let parents = tx.runs_by_destination(lot.id).await?;
            trail.push(TraceEvent {
                at: lot.created_at,
                kind: if parents.is_empty() {
                    TraceEventKind::Received
                } else {
                    TraceEventKind::Produced
                },
                lot_id: lot.id,
                lot_number: lot.lot_number.clone(),
                quantity: lot.quantity_received,
                actor: None,
                order_id: None,
                pick_id: None,
                run_id: parents.first().map(|r| r.id),
            });

            for allocation in tx.allocations_for_lot(lot.id).await? {
                let order = lookup
                    .order_for_item(&mut tx, allocation.order_item_id)
                    .await?;
                trail.push(TraceEvent {
                    at: allocation.allocated_at,
                    kind: TraceEventKind::Allocated,
                    lot_id: lot.id,
                    lot_number: lot.lot_number.clone(),
                    quantity: allocation.quantity,
                    actor: Some(allocation.allocated_by),
                    order_id: Some(order.id),
                    pick_id: None,
                    run_id: None,
                });
            }

            for pick in tx.picks_for_lot(lot.id).await? {
                let order = lookup.order_for_item(&mut tx, pick.order_item_id).await?;
                trail.push(TraceEvent {
                    at: pick.picked_at,
                    kind: TraceEventKind::Picked,
                    lot_id: lot.id,
                    lot_number: lot.lot_number.clone(),
                    quantity: pick.quantity,
                    actor: Some(pick.picked_by),
                    order_id: Some(order.id),
                    pick_id: Some(pick.id),
                    run_id: None,
                });
                orders
                    .entry(order.id)
                    .or_insert_with(|| (order, Vec::new()))
                    .1
                    .push(pick);
            }
        }

        for run in closure.edges.values() {
            trail.push(TraceEvent {
                at: run.produced_at,
                kind: TraceEventKind::Consumed,
                lot_id: run.source_lot_id,
                lot_number: lot_number(run.source_lot_id),
                quantity: run.quantity_consumed,
                actor: Some(run.produced_by),
                order_id: None,
                pick_id: None,
                run_id: Some(run.id),
            });
        }
        trail.sort_by(|a, b| {
            (a.at, a.kind, a.lot_id, a.pick_id, a.run_id)
                .cmp(&(b.at, b.kind, b.lot_id, b.pick_id, b.run_id))
        });

        let orders = orders
            .into_values()
            .map(|(order, mut picks)| {
                picks.sort_by_key(|p| (p.picked_at, p.id));
                let quantity_picked = picks.iter().map(|p| p.quantity).sum::<Decimal>();
                AffectedOrder {
                    order,
                    picks,
                    quantity_picked,
                }
            })
            .collect();

        Ok(RecallReport {
            query,
            generated_at: Utc::now(),
            matched_lots,
            affected_lots,
            production_runs: closure.edges.into_values().collect(),
            orders,
            audit_trail: trail,
            truncated: closure.truncated,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use lotkeeper_core::ProductId;

    use super::*;
    use crate::models::{ConversionSource, ConvertInput, NewProductionRun};
    use crate::services::testing::{ACTOR, dec, engine, order, receive};

    async fn convert(
        engine: &InventoryEngine<crate::db::MemoryStore>,
        sources: &[(InventoryLotId, i64)],
        produced: i64,
        lot_number: &str,
    ) -> InventoryLot {
        engine
            .convert(
                ConvertInput {
                    sources: sources
                        .iter()
                        .map(|&(lot_id, q)| ConversionSource {
                            lot_id,
                            quantity: dec(q),
                        })
                        .collect(),
                    output_product_id: ProductId::new(50),
                    quantity_produced: dec(produced),
                    unit_of_measure: "jar".to_string(),
                    lot_number: Some(lot_number.to_string()),
                    expiry_date: None,
                },
                ACTOR,
            )
            .await
            .unwrap()
            .destination
    }

    #[tokio::test]
    async fn test_lineage_of_converted_lot() {
        let (engine, _) = engine();
        let x = receive(&engine, "X", 1, 100, None).await;
        let y = receive(&engine, "Y", 2, 100, None).await;
        let z = convert(&engine, &[(x.id, 20), (y.id, 15)], 30, "Z").await;

        let lineage = engine.lot_lineage(z.id).await.unwrap();
        assert_eq!(lineage.parents.len(), 2);
        assert!(lineage.children.is_empty());
        let origins: Vec<_> = lineage.origins.iter().map(|l| l.id).collect();
        assert_eq!(origins, vec![x.id, y.id]);

        let lineage = engine.lot_lineage(x.id).await.unwrap();
        assert!(lineage.parents.is_empty());
        assert_eq!(lineage.children.len(), 1);
        assert_eq!(lineage.origins.len(), 1);
        assert_eq!(lineage.origins[0].id, x.id);
    }

    #[tokio::test]
    async fn test_every_run_is_parent_and_child_edge() {
        let (engine, _) = engine();
        let x = receive(&engine, "X", 1, 100, None).await;
        let y = receive(&engine, "Y", 2, 100, None).await;
        let z = convert(&engine, &[(x.id, 20), (y.id, 15)], 30, "Z").await;
        let w = convert(&engine, &[(z.id, 10), (x.id, 5)], 12, "W").await;

        let graph = engine.trace(w.id, TraceDirection::Upstream, None).await.unwrap();
        assert_eq!(graph.edges.len(), 4);
        for run in graph.edges.values() {
            let dest = engine.lot_lineage(run.destination_lot_id).await.unwrap();
            assert!(dest.parents.iter().any(|r| r.id == run.id));
            let source = engine.lot_lineage(run.source_lot_id).await.unwrap();
            assert!(source.children.iter().any(|r| r.id == run.id));
        }
    }

    #[tokio::test]
    async fn test_lineage_lists_picks_with_orders() {
        let (engine, _) = engine();
        let a = receive(&engine, "A", 1, 30, None).await;
        let so = order(&engine, "SO-7", &[(1, 10)]).await;
        engine.allocate(so.id, ACTOR).await.unwrap();
        let item = engine.order_progress(so.id).await.unwrap()[0].item.clone();
        engine.pick(item.id, a.id, dec(10), ACTOR).await.unwrap();

        let lineage = engine.lot_lineage(a.id).await.unwrap();
        assert_eq!(lineage.picks.len(), 1);
        assert_eq!(lineage.picks[0].order.order_number, "SO-7");
    }

    #[tokio::test]
    async fn test_trace_depth_and_truncation() {
        let (engine, _) = engine();
        let a = receive(&engine, "A", 1, 100, None).await;
        let b = convert(&engine, &[(a.id, 10)], 10, "B").await;
        let c = convert(&engine, &[(b.id, 5)], 5, "C").await;

        let full = engine.trace(a.id, TraceDirection::Downstream, None).await.unwrap();
        assert!(!full.truncated);
        assert_eq!(full.nodes[&c.id].depth, 2);

        let one = engine
            .trace(a.id, TraceDirection::Downstream, Some(1))
            .await
            .unwrap();
        assert!(one.truncated);
        assert!(one.nodes.contains_key(&b.id));
        assert!(!one.nodes.contains_key(&c.id));

        let both = engine.trace(b.id, TraceDirection::Both, None).await.unwrap();
        let ids: Vec<_> = both.relatives().map(|l| l.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }

    #[tokio::test]
    async fn test_trace_terminates_on_cycle() {
        let (engine, _) = engine();
        let a = receive(&engine, "A", 1, 10, None).await;
        let b = receive(&engine, "B", 1, 10, None).await;
        let mut tx = engine.store().begin().await.unwrap();
        for (source, destination) in [(a.id, b.id), (b.id, a.id)] {
            tx.insert_production_run(&NewProductionRun {
                source_lot_id: source,
                destination_lot_id: destination,
                quantity_consumed: dec(1),
                quantity_produced: dec(1),
                unit_of_measure: "kg".to_string(),
                produced_by: ACTOR,
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        let graph = engine.trace(a.id, TraceDirection::Both, None).await.unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 2);
        assert!(!graph.truncated);
    }

    #[tokio::test]
    async fn test_recall_by_lot_number_reaches_orders_of_products() {
        let (engine, _) = engine();
        let x = receive(&engine, "FARM-X", 1, 100, None).await;
        let y = receive(&engine, "FARM-Y", 2, 100, None).await;
        let z = convert(&engine, &[(x.id, 20), (y.id, 15)], 30, "JAM-Z").await;
        engine
            .set_status(z.id, lotkeeper_core::LotStatus::Available, ACTOR)
            .await
            .unwrap();
        let so = order(&engine, "SO-42", &[(50, 12)]).await;
        engine.allocate(so.id, ACTOR).await.unwrap();
        let item = engine.order_progress(so.id).await.unwrap()[0].item.clone();
        engine.pick(item.id, z.id, dec(12), ACTOR).await.unwrap();

        let report = engine
            .recall_report(RecallQuery::LotNumber("farm-x".to_string()), None)
            .await
            .unwrap();
        assert_eq!(report.matched_lots.len(), 1);
        let affected: Vec<_> = report.affected_lots.iter().map(|l| l.id).collect();
        assert_eq!(affected, vec![x.id, z.id]);
        assert_eq!(report.production_runs.len(), 1);
        assert_eq!(report.orders.len(), 1);
        assert_eq!(report.orders[0].order.order_number, "SO-42");
        assert_eq!(report.orders[0].quantity_picked, dec(12));

        let kinds: Vec<_> = report.audit_trail.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&TraceEventKind::Received));
        assert!(kinds.contains(&TraceEventKind::Produced));
        assert!(kinds.contains(&TraceEventKind::Consumed));
        assert!(kinds.contains(&TraceEventKind::Allocated));
        assert!(kinds.contains(&TraceEventKind::Picked));
        assert!(report.audit_trail.windows(2).all(|w| w[0].at <= w[1].at));
    }

    #[tokio::test]
    async fn test_recall_by_order_number_walks_upstream() {
        let (engine, _) = engine();
        let x = receive(&engine, "X", 1, 100, None).await;
        let z = convert(&engine, &[(x.id, 20)], 20, "Z").await;
        let so = order(&engine, "SO-42", &[(50, 5)]).await;
        engine.allocate(so.id, ACTOR).await.unwrap();
        let item = engine.order_progress(so.id).await.unwrap()[0].item.clone();
        engine.pick(item.id, z.id, dec(5), ACTOR).await.unwrap();

        let report = engine
            .recall_report(RecallQuery::OrderNumber("so-4".to_string()), None)
            .await
            .unwrap();
        assert_eq!(report.matched_lots.len(), 1);
        assert_eq!(report.matched_lots[0].id, z.id);
        assert!(report.affected_lots.iter().any(|l| l.id == x.id));
    }

    #[tokio::test]
    async fn test_recall_without_matches_is_empty() {
        let (engine, _) = engine();
        receive(&engine, "A", 1, 10, None).await;
        let report = engine
            .recall_report(RecallQuery::LotNumber("nothing".to_string()), None)
            .await
            .unwrap();
        assert!(report.matched_lots.is_empty());
        assert!(report.affected_lots.is_empty());
        assert!(report.audit_trail.is_empty());
    }

    #[tokio::test]
    async fn test_lineage_unknown_lot() {
        let (engine, _) = engine();
        let err = engine.lot_lineage(InventoryLotId::new(99)).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }
}
