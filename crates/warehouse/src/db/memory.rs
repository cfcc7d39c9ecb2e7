//! In-process store with the same unit-of-work contract as `PostgreSQL`.
//!
//! A unit of work holds the store mutex for its whole lifetime, which makes
//! every unit serialisable and every `lock_*` call trivially exclusive. Writes
//! go to a private working copy that replaces the shared state on commit, so
//! dropping a unit of work discards them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use lotkeeper_core::{
    InventoryLotId, OrderAllocationId, OrderId, OrderItemId, OrderPickId, OrderStatus, ProductId,
    ProductionRunId,
};

use super::{RepositoryError, Store, UnitOfWork};
use crate::models::{
    CreateOrderInput, FifoKey, InventoryLot, LotState, NewAllocation, NewLot, NewPick,
    NewProductionRun, Order, OrderAllocation, OrderItem, OrderPick, ProductionRun,
};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
struct Sequences {
    lot: i32,
    order: i32,
    item: i32,
    allocation: i32,
    pick: i32,
    run: i32,
}

fn next(counter: &mut i32) -> i32 {
    *counter += 1;
    *counter
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    lots: BTreeMap<InventoryLotId, InventoryLot>,
    orders: BTreeMap<OrderId, Order>,
    items: BTreeMap<OrderItemId, OrderItem>,
    allocations: BTreeMap<OrderAllocationId, OrderAllocation>,
    picks: BTreeMap<OrderPickId, OrderPick>,
    runs: BTreeMap<ProductionRunId, ProductionRun>,
    seq: Sequences,
}

impl MemoryState {
    fn item_ids_of(&self, order_id: OrderId) -> Vec<OrderItemId> {
        self.items
            .values()
            .filter(|i| i.order_id == order_id)
            .map(|i| i.id)
            .collect()
    }
}

/// In-memory [`Store`] for tests and embedding.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    lock_timeout: Duration,
    fail_lot_update_after: Arc<AtomicUsize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Create an empty store whose units of work give up waiting after `lock_timeout`.
    #[must_use]
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            lock_timeout,
            fail_lot_update_after: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }

    /// Make the next unit of work fail its lot update number `after + 1`.
    ///
    /// Used to exercise rollback paths; the fault disarms once it fires.
    /// Only built for tests and the `testing` feature.
    #[cfg(any(test, feature = "testing"))]
    pub fn fail_lot_update_after(&self, after: usize) {
        self.fail_lot_update_after.store(after, Ordering::SeqCst);
    }
}

impl Store for MemoryStore {
    type Tx = MemoryUnitOfWork;

    async fn begin(&self) -> Result<Self::Tx, RepositoryError> {
        let guard = tokio::time::timeout(self.lock_timeout, Arc::clone(&self.state).lock_owned())
            .await
            .map_err(|_| {
                RepositoryError::LockTimeout(format!(
                    "memory store busy for more than {}ms",
                    self.lock_timeout.as_millis()
                ))
            })?;
        let work = guard.clone();
        let lot_updates_left = self
            .fail_lot_update_after
            .swap(usize::MAX, Ordering::SeqCst);
        Ok(MemoryUnitOfWork {
            guard,
            work,
            lot_updates_left,
        })
    }
}

/// Unit of work over a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    work: MemoryState,
    lot_updates_left: usize,
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

impl UnitOfWork for MemoryUnitOfWork {
    async fn get_lot(&mut self, id: InventoryLotId) -> Result<Option<InventoryLot>, RepositoryError> {
        Ok(self.work.lots.get(&id).cloned())
    }

    async fn lock_lot(
        &mut self,
        id: InventoryLotId,
    ) -> Result<Option<InventoryLot>, RepositoryError> {
        Ok(self.work.lots.get(&id).cloned())
    }

    async fn get_lots(
        &mut self,
        ids: &[InventoryLotId],
    ) -> Result<Vec<InventoryLot>, RepositoryError> {
        let mut lots: Vec<InventoryLot> = ids
            .iter()
            .filter_map(|id| self.work.lots.get(id).cloned())
            .collect();
        lots.sort_by_key(|l| l.id);
        lots.dedup_by_key(|l| l.id);
        Ok(lots)
    }

    async fn find_lot_by_number(
        &mut self,
        lot_number: &str,
    ) -> Result<Option<InventoryLot>, RepositoryError> {
        Ok(self
            .work
            .lots
            .values()
            .find(|l| l.lot_number == lot_number)
            .cloned())
    }

    async fn search_lots(&mut self, fragment: &str) -> Result<Vec<InventoryLot>, RepositoryError> {
        let mut lots: Vec<InventoryLot> = self
            .work
            .lots
            .values()
            .filter(|l| contains_ignore_case(&l.lot_number, fragment))
            .cloned()
            .collect();
        lots.sort_by(|a, b| a.lot_number.cmp(&b.lot_number).then(a.id.cmp(&b.id)));
        Ok(lots)
    }

    async fn eligible_lots_page(
        &mut self,
        product_id: ProductId,
        after: Option<FifoKey>,
        limit: i64,
    ) -> Result<Vec<InventoryLot>, RepositoryError> {
        let mut lots: Vec<InventoryLot> = self
            .work
            .lots
            .values()
            .filter(|l| l.product_id == product_id && l.is_eligible())
            .filter(|l| after.is_none_or(|cursor| l.fifo_key() > cursor))
            .cloned()
            .collect();
        lots.sort_by_key(InventoryLot::fifo_key);
        lots.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(lots)
    }

    async fn lock_expired_lots(
        &mut self,
        as_of: NaiveDate,
    ) -> Result<Vec<InventoryLot>, RepositoryError> {
        Ok(self
            .work
            .lots
            .values()
            .filter(|l| l.status.is_eligible() && l.expiry_date.is_some_and(|e| e < as_of))
            .cloned()
            .collect())
    }

    async fn insert_lot(&mut self, lot: &NewLot) -> Result<InventoryLot, RepositoryError> {
        if self
            .work
            .lots
            .values()
            .any(|l| l.lot_number == lot.lot_number)
        {
            return Err(RepositoryError::Conflict(format!(
                "Lot number {} already exists",
                lot.lot_number
            )));
        }
        let now = Utc::now();
        let id = InventoryLotId::new(next(&mut self.work.seq.lot));
        let row = InventoryLot {
            id,
            lot_number: lot.lot_number.clone(),
            product_id: lot.product_id,
            quantity_received: lot.quantity,
            quantity_current: lot.quantity,
            quantity_reserved: Decimal::ZERO,
            unit_of_measure: lot.unit_of_measure.clone(),
            received_date: lot.received_date,
            expiry_date: lot.expiry_date,
            origin: lot.origin.clone(),
            status: lot.status,
            status_before_depletion: None,
            created_at: now,
            updated_at: now,
        };
        self.work.lots.insert(id, row.clone());
        Ok(row)
    }

    async fn update_lot_state(
        &mut self,
        id: InventoryLotId,
        state: LotState,
    ) -> Result<InventoryLot, RepositoryError> {
        if self.lot_updates_left == 0 {
            self.lot_updates_left = usize::MAX;
            return Err(RepositoryError::DataCorruption(format!(
                "injected fault updating lot {id}"
            )));
        }
        self.lot_updates_left = self.lot_updates_left.saturating_sub(1);

        let lot = self
            .work
            .lots
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound)?;
        lot.quantity_current = state.quantity_current;
        lot.quantity_reserved = state.quantity_reserved;
        lot.status = state.status;
        lot.status_before_depletion = state.status_before_depletion;
        lot.updated_at = Utc::now();
        Ok(lot.clone())
    }

    async fn insert_order(
        &mut self,
        input: &CreateOrderInput,
    ) -> Result<(Order, Vec<OrderItem>), RepositoryError> {
        if self
            .work
            .orders
            .values()
            .any(|o| o.order_number == input.order_number)
        {
            return Err(RepositoryError::Conflict(format!(
                "Order number {} already exists",
                input.order_number
            )));
        }
        let now = Utc::now();
        let order = Order {
            id: OrderId::new(next(&mut self.work.seq.order)),
            order_number: input.order_number.clone(),
            status: OrderStatus::Draft,
            created_at: now,
            updated_at: now,
        };
        let mut items = Vec::with_capacity(input.items.len());
        for (line, item) in (1..).zip(&input.items) {
            let row = OrderItem {
                id: OrderItemId::new(next(&mut self.work.seq.item)),
                order_id: order.id,
                line_number: line,
                product_id: item.product_id,
                quantity_ordered: item.quantity_ordered,
            };
            self.work.items.insert(row.id, row.clone());
            items.push(row);
        }
        self.work.orders.insert(order.id, order.clone());
        Ok((order, items))
    }

    async fn get_order(&mut self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        Ok(self.work.orders.get(&id).cloned())
    }

    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        Ok(self.work.orders.get(&id).cloned())
    }

    async fn search_orders(&mut self, fragment: &str) -> Result<Vec<Order>, RepositoryError> {
        Ok(self
            .work
            .orders
            .values()
            .filter(|o| contains_ignore_case(&o.order_number, fragment))
            .cloned()
            .collect())
    }

    async fn order_items(&mut self, order_id: OrderId) -> Result<Vec<OrderItem>, RepositoryError> {
        let mut items: Vec<OrderItem> = self
            .work
            .items
            .values()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.line_number, i.id));
        Ok(items)
    }

    async fn get_order_item(
        &mut self,
        id: OrderItemId,
    ) -> Result<Option<OrderItem>, RepositoryError> {
        Ok(self.work.items.get(&id).cloned())
    }

    async fn update_order_status(
        &mut self,
        id: OrderId,
        status: OrderStatus,
    ) -> Result<Order, RepositoryError> {
        let order = self
            .work
            .orders
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound)?;
        order.status = status;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn allocations_for_order(
        &mut self,
        order_id: OrderId,
    ) -> Result<Vec<OrderAllocation>, RepositoryError> {
        let items = self.work.item_ids_of(order_id);
        Ok(self
            .work
            .allocations
            .values()
            .filter(|a| items.contains(&a.order_item_id))
            .cloned()
            .collect())
    }

    async fn allocations_for_lot(
        &mut self,
        lot_id: InventoryLotId,
    ) -> Result<Vec<OrderAllocation>, RepositoryError> {
        Ok(self
            .work
            .allocations
            .values()
            .filter(|a| a.lot_id == lot_id)
            .cloned()
            .collect())
    }

    async fn find_allocation(
        &mut self,
        order_item_id: OrderItemId,
        lot_id: InventoryLotId,
    ) -> Result<Option<OrderAllocation>, RepositoryError> {
        Ok(self
            .work
            .allocations
            .values()
            .find(|a| a.order_item_id == order_item_id && a.lot_id == lot_id)
            .cloned())
    }

    async fn insert_allocation(
        &mut self,
        allocation: &NewAllocation,
    ) -> Result<OrderAllocation, RepositoryError> {
        if self
            .work
            .allocations
            .values()
            .any(|a| a.order_item_id == allocation.order_item_id && a.lot_id == allocation.lot_id)
        {
            return Err(RepositoryError::Conflict(
                "Line item already allocated to this lot".to_string(),
            ));
        }
        let row = OrderAllocation {
            id: OrderAllocationId::new(next(&mut self.work.seq.allocation)),
            order_item_id: allocation.order_item_id,
            lot_id: allocation.lot_id,
            quantity: allocation.quantity,
            quantity_fulfilled: Decimal::ZERO,
            allocated_at: Utc::now(),
            allocated_by: allocation.allocated_by,
        };
        self.work.allocations.insert(row.id, row.clone());
        Ok(row)
    }

    async fn set_allocation_fulfilled(
        &mut self,
        id: OrderAllocationId,
        quantity_fulfilled: Decimal,
    ) -> Result<(), RepositoryError> {
        let allocation = self
            .work
            .allocations
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound)?;
        allocation.quantity_fulfilled = quantity_fulfilled;
        Ok(())
    }

    async fn delete_allocations_for_order(&mut self, order_id: OrderId) -> Result<u64, RepositoryError> {
        let items = self.work.item_ids_of(order_id);
        let before = self.work.allocations.len();
        self.work
            .allocations
            .retain(|_, a| !items.contains(&a.order_item_id));
        Ok(u64::try_from(before - self.work.allocations.len()).unwrap_or(u64::MAX))
    }

    async fn insert_pick(&mut self, pick: &NewPick) -> Result<OrderPick, RepositoryError> {
        let row = OrderPick {
            id: OrderPickId::new(next(&mut self.work.seq.pick)),
            order_item_id: pick.order_item_id,
            lot_id: pick.lot_id,
            quantity: pick.quantity,
            reservation_consumed: pick.reservation_consumed,
            picked_by: pick.picked_by,
            picked_at: Utc::now(),
        };
        self.work.picks.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_pick(&mut self, id: OrderPickId) -> Result<Option<OrderPick>, RepositoryError> {
        Ok(self.work.picks.get(&id).cloned())
    }

    async fn picks_for_item(
        &mut self,
        order_item_id: OrderItemId,
    ) -> Result<Vec<OrderPick>, RepositoryError> {
        Ok(self
            .work
            .picks
            .values()
            .filter(|p| p.order_item_id == order_item_id)
            .cloned()
            .collect())
    }

    async fn picks_for_order(&mut self, order_id: OrderId) -> Result<Vec<OrderPick>, RepositoryError> {
        let items = self.work.item_ids_of(order_id);
        Ok(self
            .work
            .picks
            .values()
            .filter(|p| items.contains(&p.order_item_id))
            .cloned()
            .collect())
    }

    async fn picks_for_lot(
        &mut self,
        lot_id: InventoryLotId,
    ) -> Result<Vec<OrderPick>, RepositoryError> {
        let mut picks: Vec<OrderPick> = self
            .work
            .picks
            .values()
            .filter(|p| p.lot_id == lot_id)
            .cloned()
            .collect();
        picks.sort_by_key(|p| (p.picked_at, p.id));
        Ok(picks)
    }

    async fn delete_pick(&mut self, id: OrderPickId) -> Result<bool, RepositoryError> {
        Ok(self.work.picks.remove(&id).is_some())
    }

    async fn insert_production_run(
        &mut self,
        run: &NewProductionRun,
    ) -> Result<ProductionRun, RepositoryError> {
        for lot_id in [run.source_lot_id, run.destination_lot_id] {
            if !self.work.lots.contains_key(&lot_id) {
                return Err(RepositoryError::Conflict(format!(
                    "production run references unknown lot {lot_id}"
                )));
            }
        }
        let row = ProductionRun {
            id: ProductionRunId::new(next(&mut self.work.seq.run)),
            source_lot_id: run.source_lot_id,
            destination_lot_id: run.destination_lot_id,
            quantity_consumed: run.quantity_consumed,
            quantity_produced: run.quantity_produced,
            unit_of_measure: run.unit_of_measure.clone(),
            produced_by: run.produced_by,
            produced_at: Utc::now(),
        };
        self.work.runs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn runs_by_destination(
        &mut self,
        lot_id: InventoryLotId,
    ) -> Result<Vec<ProductionRun>, RepositoryError> {
        Ok(self
            .work
            .runs
            .values()
            .filter(|r| r.destination_lot_id == lot_id)
            .cloned()
            .collect())
    }

    async fn runs_by_source(
        &mut self,
        lot_id: InventoryLotId,
    ) -> Result<Vec<ProductionRun>, RepositoryError> {
        Ok(self
            .work
            .runs
            .values()
            .filter(|r| r.source_lot_id == lot_id)
            .cloned()
            .collect())
    }

    async fn commit(self) -> Result<(), RepositoryError> {
        let Self {
            mut guard, work, ..
        } = self;
        *guard = work;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use lotkeeper_core::LotStatus;

    use super::*;

    fn new_lot(number: &str) -> NewLot {
        NewLot {
            lot_number: number.to_string(),
            product_id: ProductId::new(1),
            quantity: Decimal::TEN,
            unit_of_measure: "kg".to_string(),
            received_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            expiry_date: None,
            origin: None,
            status: LotStatus::Available,
        }
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let lot = tx.insert_lot(&new_lot("L-1")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get_lot(lot.id).await.unwrap(), Some(lot));
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_lot(&new_lot("L-1")).await.unwrap();
        }
        let mut tx = store.begin().await.unwrap();
        assert!(tx.find_lot_by_number("L-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_lot_number_conflicts() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_lot(&new_lot("L-1")).await.unwrap();
        let err = tx.insert_lot(&new_lot("L-1")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_second_unit_times_out_while_first_is_open() {
        let store = MemoryStore::with_lock_timeout(Duration::from_millis(20));
        let _held = store.begin().await.unwrap();
        let err = store.begin().await.unwrap_err();
        assert!(matches!(err, RepositoryError::LockTimeout(_)));
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let lot = tx.insert_lot(&new_lot("L-1")).await.unwrap();
        tx.commit().await.unwrap();

        store.fail_lot_update_after(0);
        let mut tx = store.begin().await.unwrap();
        let state = LotState::from(&lot);
        assert!(tx.update_lot_state(lot.id, state).await.is_err());
        assert!(tx.update_lot_state(lot.id, state).await.is_ok());
    }

    #[tokio::test]
    async fn test_search_lots_is_case_insensitive() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_lot(&new_lot("APL-2024-001")).await.unwrap();
        tx.insert_lot(&new_lot("PEAR-2024-001")).await.unwrap();
        let found = tx.search_lots("apl").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].lot_number, "APL-2024-001");
    }
}
