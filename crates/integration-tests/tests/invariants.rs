//! Quantity bounds and reservation accounting, sequential and concurrent.

use std::time::Duration;

use lotkeeper_core::OrderStatus;
use lotkeeper_integration_tests::{ACTOR, TestContext, date, qty};
use lotkeeper_warehouse::EngineError;
use lotkeeper_warehouse::config::EngineConfig;
use lotkeeper_warehouse::db::{MemoryStore, Store};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_picks_on_one_lot() {
    let ctx = TestContext::memory();
    let a = ctx.receive("A", 1, 100, Some(date(2024, 1, 10))).await;
    let c = ctx.receive("C", 1, 5, Some(date(2024, 3, 10))).await;
    let lot_id = a.id;

    let mut items = Vec::new();
    for n in 0..10 {
        let (order, order_items) = ctx.order(&format!("SO-{n}"), &[(1, 10)]).await;
        ctx.engine.allocate(order.id, ACTOR).await.unwrap();
        items.push(order_items[0].id);
    }
    // Lot A is fully reserved; this order lands on C.
    let (outsider, outsider_items) = ctx.order("SO-X", &[(1, 5)]).await;
    let allocated = ctx.engine.allocate(outsider.id, ACTOR).await.unwrap();
    assert_eq!(allocated.allocations[0].lot_id, c.id);

    let mut handles = Vec::new();
    for item_id in items {
        let engine = ctx.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.pick(item_id, lot_id, qty(10), ACTOR).await
        }));
    }
    let mut intruders = Vec::new();
    for _ in 0..3 {
        let engine = ctx.engine.clone();
        let item_id = outsider_items[0].id;
        intruders.push(tokio::spawn(async move {
            engine.pick(item_id, lot_id, qty(5), ACTOR).await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    for handle in intruders {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::InsufficientInventory { .. }), "{err}");
    }

    let a_now = ctx.lot(a.id).await;
    assert_eq!(a_now.quantity_current, qty(0));
    assert_eq!(a_now.quantity_reserved, qty(0));
    assert_eq!(ctx.lot(c.id).await.quantity_reserved, qty(5));
    ctx.assert_lot_invariants(&[a.id, c.id]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_never_oversell() {
    let ctx = TestContext::memory();
    let a = ctx.receive("A", 1, 50, None).await;

    let mut handles = Vec::new();
    for n in 0..10 {
        let (order, _) = ctx.order(&format!("SO-{n}"), &[(1, 10)]).await;
        let engine = ctx.engine.clone();
        handles.push(tokio::spawn(async move { engine.allocate(order.id, ACTOR).await }));
    }

    let mut allocated = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => {
                assert_eq!(outcome.order.status, OrderStatus::Confirmed);
                allocated += 1;
            }
            Err(EngineError::InsufficientInventory { shortfall, .. }) => {
                assert_eq!(shortfall, qty(10));
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(allocated, 5);
    assert_eq!(ctx.lot(a.id).await.quantity_reserved, qty(50));
    ctx.assert_lot_invariants(&[a.id]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pick_revert_round_trips() {
    let ctx = TestContext::memory();
    let a = ctx.receive("A", 1, 80, None).await;
    let lot_id = a.id;

    let mut items = Vec::new();
    for n in 0..8 {
        let (order, order_items) = ctx.order(&format!("SO-{n}"), &[(1, 10)]).await;
        ctx.engine.allocate(order.id, ACTOR).await.unwrap();
        items.push(order_items[0].id);
    }

    let mut handles = Vec::new();
    for item_id in items {
        let engine = ctx.engine.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                let picked = engine.pick(item_id, lot_id, qty(5), ACTOR).await?;
                engine.revert_pick(picked.pick.id, ACTOR).await?;
            }
            Ok::<_, EngineError>(())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let a_now = ctx.lot(a.id).await;
    assert_eq!(a_now.quantity_current, qty(80));
    assert_eq!(a_now.quantity_reserved, qty(80));
    ctx.assert_lot_invariants(&[a.id]).await;
}

#[tokio::test]
async fn test_lock_timeout_is_retryable_conflict() {
    let store = MemoryStore::with_lock_timeout(Duration::from_millis(50));
    let ctx = TestContext::memory_with(store.clone(), EngineConfig::default());
    ctx.receive("A", 1, 10, None).await;
    let (order, _) = ctx.order("SO-1", &[(1, 5)]).await;

    let held = store.begin().await.unwrap();
    let err = ctx.engine.allocate(order.id, ACTOR).await.unwrap_err();
    assert!(matches!(err, EngineError::ConcurrencyConflict(_)), "{err}");
    assert!(err.is_retryable());

    drop(held);
    ctx.engine.allocate(order.id, ACTOR).await.unwrap();
}

#[tokio::test]
async fn test_failed_unship_changes_nothing() {
    let ctx = TestContext::memory();
    let a = ctx.receive("A", 1, 30, Some(date(2024, 1, 10))).await;
    let b = ctx.receive("B", 1, 30, Some(date(2024, 2, 10))).await;
    let (order, items) = ctx.order("SO-1", &[(1, 40)]).await;
    ctx.engine.allocate(order.id, ACTOR).await.unwrap();
    ctx.engine.pick(items[0].id, a.id, qty(30), ACTOR).await.unwrap();
    ctx.engine.pick(items[0].id, b.id, qty(10), ACTOR).await.unwrap();
    ctx.engine.mark_ready_to_ship(order.id, ACTOR).await.unwrap();
    ctx.engine.ship(order.id, ACTOR).await.unwrap();

    ctx.engine.store().fail_lot_update_after(1);
    let err = ctx.engine.unship(order.id, ACTOR).await.unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)), "{err}");

    assert_eq!(ctx.engine.order(order.id).await.unwrap().status, OrderStatus::Shipped);
    assert_eq!(ctx.lot(a.id).await.quantity_current, qty(0));
    assert_eq!(ctx.lot(b.id).await.quantity_current, qty(20));
    assert_eq!(ctx.picked_total(order.id).await, qty(40));
    ctx.assert_lot_invariants(&[a.id, b.id]).await;

    ctx.engine.unship(order.id, ACTOR).await.unwrap();
    assert_eq!(ctx.lot(a.id).await.quantity_current, qty(30));
    assert_eq!(ctx.lot(b.id).await.quantity_current, qty(30));
    ctx.assert_lot_invariants(&[a.id, b.id]).await;
}

#[tokio::test]
async fn test_expiry_removes_lots_from_allocation() {
    let ctx = TestContext::memory();
    let old = ctx.receive("OLD", 1, 50, Some(date(2024, 1, 10))).await;
    let fresh = ctx.receive("FRESH", 1, 50, Some(date(2024, 6, 10))).await;

    let expired = ctx
        .engine
        .expire_lots(date(2024, 2, 1), ACTOR)
        .await
        .unwrap();
    assert_eq!(expired.expired.len(), 1);
    assert_eq!(expired.expired[0].id, old.id);

    let (order, _) = ctx.order("SO-1", &[(1, 60)]).await;
    let err = ctx.engine.allocate(order.id, ACTOR).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InsufficientInventory { available, .. } if available == qty(50)
    ));
    ctx.assert_lot_invariants(&[old.id, fresh.id]).await;
}
