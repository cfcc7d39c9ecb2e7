//! End-to-end flows through the engine on the in-memory store.

use lotkeeper_core::{LotStatus, OrderStatus};
use lotkeeper_integration_tests::{ACTOR, TestContext, conversion, date, qty};
use lotkeeper_warehouse::EngineError;
use lotkeeper_warehouse::models::{AuditAction, RecallQuery, TraceDirection};

// =============================================================================
// Order lifecycle
// =============================================================================

#[tokio::test]
async fn test_fifo_allocation_pick_ship_and_unship() {
    let ctx = TestContext::memory();
    let a = ctx.receive("A", 1, 50, Some(date(2024, 1, 10))).await;
    let b = ctx.receive("B", 1, 50, Some(date(2024, 1, 20))).await;
    let (order, items) = ctx.order("SO-1", &[(1, 60)]).await;
    let item = &items[0];

    let allocated = ctx.engine.allocate(order.id, ACTOR).await.unwrap();
    assert_eq!(allocated.order.status, OrderStatus::Confirmed);
    let split: Vec<_> = allocated
        .allocations
        .iter()
        .map(|x| (x.lot_id, x.quantity))
        .collect();
    assert_eq!(split, vec![(a.id, qty(50)), (b.id, qty(10))]);

    let first = ctx.engine.pick(item.id, a.id, qty(50), ACTOR).await.unwrap();
    assert_eq!(first.order.status, OrderStatus::PartialPick);
    let second = ctx.engine.pick(item.id, b.id, qty(10), ACTOR).await.unwrap();
    assert_eq!(second.order.status, OrderStatus::Picking);

    let a_now = ctx.lot(a.id).await;
    assert_eq!(a_now.quantity_current, qty(0));
    assert_eq!(a_now.status, LotStatus::Depleted);
    assert_eq!(ctx.lot(b.id).await.quantity_current, qty(40));
    assert!(ctx.engine.is_complete(order.id).await.unwrap());
    ctx.assert_lot_invariants(&[a.id, b.id]).await;

    let ready = ctx.engine.mark_ready_to_ship(order.id, ACTOR).await.unwrap();
    assert_eq!(ready.order.status, OrderStatus::ReadyToShip);
    let shipped = ctx.engine.ship(order.id, ACTOR).await.unwrap();
    assert_eq!(shipped.order.status, OrderStatus::Shipped);
    ctx.assert_lot_invariants(&[a.id, b.id]).await;

    let unshipped = ctx.engine.unship(order.id, ACTOR).await.unwrap();
    assert_eq!(unshipped.order.status, OrderStatus::ReadyToShip);
    assert_eq!(unshipped.restored.len(), 2);
    let a_now = ctx.lot(a.id).await;
    assert_eq!(a_now.quantity_current, qty(50));
    assert_eq!(a_now.status, LotStatus::Received);
    assert_eq!(ctx.lot(b.id).await.quantity_current, qty(50));
    assert_eq!(ctx.picked_total(order.id).await, qty(0));
    ctx.assert_lot_invariants(&[a.id, b.id]).await;

    let actions: Vec<_> = ctx.audit.events().iter().map(|e| e.action).collect();
    for expected in [
        AuditAction::OrderCreated,
        AuditAction::Allocated,
        AuditAction::Picked,
        AuditAction::ReadyToShip,
        AuditAction::Shipped,
        AuditAction::QuantityRestored,
        AuditAction::Unshipped,
    ] {
        assert!(actions.contains(&expected), "missing {expected:?}");
    }
}

#[tokio::test]
async fn test_ready_to_ship_requires_complete_items() {
    let ctx = TestContext::memory();
    let a = ctx.receive("A", 1, 50, None).await;
    let (order, items) = ctx.order("SO-1", &[(1, 20)]).await;
    ctx.engine.allocate(order.id, ACTOR).await.unwrap();
    ctx.engine.pick(items[0].id, a.id, qty(5), ACTOR).await.unwrap();

    let err = ctx.engine.mark_ready_to_ship(order.id, ACTOR).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
    let err = ctx.engine.ship(order.id, ACTOR).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
}

#[tokio::test]
async fn test_ship_releases_reservation_left_by_other_lot_picks() {
    let ctx = TestContext::memory();
    let a = ctx.receive("A", 1, 30, Some(date(2024, 1, 10))).await;
    let b = ctx.receive("B", 1, 30, Some(date(2024, 2, 10))).await;
    let (order, items) = ctx.order("SO-1", &[(1, 20)]).await;
    ctx.engine.allocate(order.id, ACTOR).await.unwrap();

    // Allocated on A, physically picked from B.
    ctx.engine.pick(items[0].id, b.id, qty(20), ACTOR).await.unwrap();
    assert_eq!(ctx.lot(a.id).await.quantity_reserved, qty(20));

    ctx.engine.mark_ready_to_ship(order.id, ACTOR).await.unwrap();
    ctx.engine.ship(order.id, ACTOR).await.unwrap();
    assert_eq!(ctx.lot(a.id).await.quantity_reserved, qty(0));
    assert_eq!(ctx.lot(a.id).await.quantity_current, qty(30));
    assert_eq!(ctx.lot(b.id).await.quantity_current, qty(10));
    ctx.assert_lot_invariants(&[a.id, b.id]).await;
}

// =============================================================================
// Production and traceability
// =============================================================================

#[tokio::test]
async fn test_conversion_and_recall() {
    let ctx = TestContext::memory();
    let x = ctx.receive("FARM-X-001", 1, 100, Some(date(2024, 6, 1))).await;
    let y = ctx.receive("FARM-Y-001", 2, 100, Some(date(2024, 5, 1))).await;

    let converted = ctx
        .engine
        .convert(conversion(&[(x.id, 20), (y.id, 15)], 90, 30), ACTOR)
        .await
        .unwrap();
    let z = converted.destination;
    assert_eq!(ctx.lot(x.id).await.quantity_current, qty(80));
    assert_eq!(ctx.lot(y.id).await.quantity_current, qty(85));
    assert_eq!(z.quantity_current, qty(30));
    assert_eq!(z.status, LotStatus::Produced);
    assert_eq!(z.expiry_date, Some(date(2024, 5, 1)));
    assert_eq!(converted.runs.len(), 2);

    let (order, items) = ctx.order("SO-RECALL-1", &[(90, 12)]).await;
    ctx.engine.allocate(order.id, ACTOR).await.unwrap();
    ctx.engine.pick(items[0].id, z.id, qty(12), ACTOR).await.unwrap();

    // Contaminated ingredient: everything made from it and everyone who got it.
    let report = ctx
        .engine
        .recall_report(RecallQuery::LotNumber("farm-x".to_string()), None)
        .await
        .unwrap();
    let affected: Vec<_> = report.affected_lots.iter().map(|l| l.id).collect();
    assert_eq!(affected, vec![x.id, z.id]);
    assert_eq!(report.orders.len(), 1);
    assert_eq!(report.orders[0].order.id, order.id);
    assert_eq!(report.orders[0].quantity_picked, qty(12));
    assert!(!report.truncated);

    // Complaint on an order: back to every ingredient.
    let report = ctx
        .engine
        .recall_report(RecallQuery::OrderNumber("recall-1".to_string()), None)
        .await
        .unwrap();
    let affected: Vec<_> = report.affected_lots.iter().map(|l| l.id).collect();
    assert_eq!(affected, vec![x.id, y.id, z.id]);
    assert_eq!(report.production_runs.len(), 2);
}

#[tokio::test]
async fn test_multi_stage_genealogy() {
    let ctx = TestContext::memory();
    let berries = ctx.receive("BERRY", 1, 100, None).await;
    let sugar = ctx.receive("SUGAR", 2, 100, None).await;
    let puree = ctx
        .engine
        .convert(conversion(&[(berries.id, 40)], 10, 35), ACTOR)
        .await
        .unwrap()
        .destination;
    let jam = ctx
        .engine
        .convert(conversion(&[(puree.id, 30), (sugar.id, 10)], 11, 40), ACTOR)
        .await
        .unwrap()
        .destination;

    let up = ctx
        .engine
        .trace(jam.id, TraceDirection::Upstream, None)
        .await
        .unwrap();
    assert_eq!(up.nodes[&berries.id].depth, 2);
    assert_eq!(up.nodes[&puree.id].depth, 1);
    assert_eq!(up.edges.len(), 3);

    let lineage = ctx.engine.lot_lineage(jam.id).await.unwrap();
    let origins: Vec<_> = lineage.origins.iter().map(|l| l.id).collect();
    assert_eq!(origins, vec![berries.id, sugar.id]);

    for run in up.edges.values() {
        let dest = ctx.engine.lot_lineage(run.destination_lot_id).await.unwrap();
        assert!(dest.parents.iter().any(|r| r.id == run.id));
        let source = ctx.engine.lot_lineage(run.source_lot_id).await.unwrap();
        assert!(source.children.iter().any(|r| r.id == run.id));
    }

    let one_hop = ctx
        .engine
        .recall_report(RecallQuery::LotNumber("BERRY".to_string()), Some(1))
        .await
        .unwrap();
    assert!(one_hop.truncated);
    assert!(!one_hop.affected_lots.iter().any(|l| l.id == jam.id));
}
