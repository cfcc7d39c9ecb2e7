//! `PostgreSQL` implementation of the unit-of-work contract.
//!
//! Each unit of work is one `sqlx` transaction. `lock_*` reads use
//! `SELECT ... FOR UPDATE`, and `lock_timeout` is set per transaction so a
//! blocked row lock surfaces as [`RepositoryError::LockTimeout`] instead of
//! hanging.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};

use lotkeeper_core::{
    ActorId, InventoryLotId, LotStatus, OrderAllocationId, OrderId, OrderItemId, OrderPickId,
    OrderStatus, ProductId, ProductionRunId,
};

use super::{RepositoryError, Store, UnitOfWork};
use crate::models::{
    CreateOrderInput, FifoKey, InventoryLot, LotState, NewAllocation, NewLot, NewPick,
    NewProductionRun, Order, OrderAllocation, OrderItem, OrderPick, ProductionRun,
};

macro_rules! lot_select {
    ($tail:literal) => {
        concat!(
            "SELECT id, lot_number, product_id, quantity_received, quantity_current, ",
            "quantity_reserved, unit_of_measure, received_date, expiry_date, origin, ",
            "status, status_before_depletion, created_at, updated_at FROM warehouse.inventory_lot ",
            $tail
        )
    };
}

const LOT_RETURNING: &str = "RETURNING id, lot_number, product_id, quantity_received, \
    quantity_current, quantity_reserved, unit_of_measure, received_date, expiry_date, origin, \
    status, status_before_depletion, created_at, updated_at";

macro_rules! order_select {
    ($tail:literal) => {
        concat!(
            "SELECT id, order_number, status, created_at, updated_at FROM warehouse.customer_order ",
            $tail
        )
    };
}

macro_rules! allocation_select {
    ($tail:literal) => {
        concat!(
            "SELECT a.id, a.order_item_id, a.lot_id, a.quantity, a.quantity_fulfilled, ",
            "a.allocated_at, a.allocated_by FROM warehouse.order_allocation a ",
            $tail
        )
    };
}

macro_rules! pick_select {
    ($tail:literal) => {
        concat!(
            "SELECT p.id, p.order_item_id, p.lot_id, p.quantity, p.reservation_consumed, ",
            "p.picked_by, p.picked_at FROM warehouse.order_pick p ",
            $tail
        )
    };
}

macro_rules! run_select {
    ($tail:literal) => {
        concat!(
            "SELECT id, source_lot_id, destination_lot_id, quantity_consumed, quantity_produced, ",
            "unit_of_measure, produced_by, produced_at FROM warehouse.production_run ",
            $tail
        )
    };
}

// =============================================================================
// Internal Row Types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct LotRow {
    id: i32,
    lot_number: String,
    product_id: i32,
    quantity_received: Decimal,
    quantity_current: Decimal,
    quantity_reserved: Decimal,
    unit_of_measure: String,
    received_date: NaiveDate,
    expiry_date: Option<NaiveDate>,
    origin: Option<String>,
    status: LotStatus,
    status_before_depletion: Option<LotStatus>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<LotRow> for InventoryLot {
    fn from(row: LotRow) -> Self {
        Self {
            id: InventoryLotId::new(row.id),
            lot_number: row.lot_number,
            product_id: ProductId::new(row.product_id),
            quantity_received: row.quantity_received,
            quantity_current: row.quantity_current,
            quantity_reserved: row.quantity_reserved,
            unit_of_measure: row.unit_of_measure,
            received_date: row.received_date,
            expiry_date: row.expiry_date,
            origin: row.origin,
            status: row.status,
            status_before_depletion: row.status_before_depletion,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: i32,
    order_number: String,
    status: OrderStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<OrderRow> for Order {
    fn from(row: OrderRow) -> Self {
        Self {
            id: OrderId::new(row.id),
            order_number: row.order_number,
            status: row.status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderItemRow {
    id: i32,
    order_id: i32,
    line_number: i32,
    product_id: i32,
    quantity_ordered: Decimal,
}

impl From<OrderItemRow> for OrderItem {
    fn from(row: OrderItemRow) -> Self {
        Self {
            id: OrderItemId::new(row.id),
            order_id: OrderId::new(row.order_id),
            line_number: row.line_number,
            product_id: ProductId::new(row.product_id),
            quantity_ordered: row.quantity_ordered,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AllocationRow {
    id: i32,
    order_item_id: i32,
    lot_id: i32,
    quantity: Decimal,
    quantity_fulfilled: Decimal,
    allocated_at: DateTime<Utc>,
    allocated_by: i32,
}

impl From<AllocationRow> for OrderAllocation {
    fn from(row: AllocationRow) -> Self {
        Self {
            id: OrderAllocationId::new(row.id),
            order_item_id: OrderItemId::new(row.order_item_id),
            lot_id: InventoryLotId::new(row.lot_id),
            quantity: row.quantity,
            quantity_fulfilled: row.quantity_fulfilled,
            allocated_at: row.allocated_at,
            allocated_by: ActorId::new(row.allocated_by),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PickRow {
    id: i32,
    order_item_id: i32,
    lot_id: i32,
    quantity: Decimal,
    reservation_consumed: Decimal,
    picked_by: i32,
    picked_at: DateTime<Utc>,
}

impl From<PickRow> for OrderPick {
    fn from(row: PickRow) -> Self {
        Self {
            id: OrderPickId::new(row.id),
            order_item_id: OrderItemId::new(row.order_item_id),
            lot_id: InventoryLotId::new(row.lot_id),
            quantity: row.quantity,
            reservation_consumed: row.reservation_consumed,
            picked_by: ActorId::new(row.picked_by),
            picked_at: row.picked_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProductionRunRow {
    id: i32,
    source_lot_id: i32,
    destination_lot_id: i32,
    quantity_consumed: Decimal,
    quantity_produced: Decimal,
    unit_of_measure: String,
    produced_by: i32,
    produced_at: DateTime<Utc>,
}

impl From<ProductionRunRow> for ProductionRun {
    fn from(row: ProductionRunRow) -> Self {
        Self {
            id: ProductionRunId::new(row.id),
            source_lot_id: InventoryLotId::new(row.source_lot_id),
            destination_lot_id: InventoryLotId::new(row.destination_lot_id),
            quantity_consumed: row.quantity_consumed,
            quantity_produced: row.quantity_produced,
            unit_of_measure: row.unit_of_measure,
            produced_by: ActorId::new(row.produced_by),
            produced_at: row.produced_at,
        }
    }
}

/// Map driver errors onto repository errors.
///
/// `55P03` is `lock_not_available`; `40001` and `40P01` are serialization
/// failure and deadlock detected.
fn map_db_error(e: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e {
        match db_err.code().as_deref() {
            Some("55P03") => return RepositoryError::LockTimeout(db_err.message().to_owned()),
            Some("40001" | "40P01") => {
                return RepositoryError::Serialization(db_err.message().to_owned());
            }
            _ => {}
        }
        if db_err.is_unique_violation() {
            return RepositoryError::Conflict(
                db_err
                    .constraint()
                    .map_or_else(|| db_err.message().to_owned(), ToOwned::to_owned),
            );
        }
        if db_err.is_foreign_key_violation() || db_err.is_check_violation() {
            return RepositoryError::Conflict(db_err.message().to_owned());
        }
    }
    RepositoryError::Database(e)
}

// =============================================================================
// Store
// =============================================================================

/// [`Store`] backed by a `PostgreSQL` pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgStore {
    /// Wrap a pool; every unit of work waits at most `lock_timeout` for a row lock.
    #[must_use]
    pub const fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Store for PgStore {
    type Tx = PgUnitOfWork;

    async fn begin(&self) -> Result<Self::Tx, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        Ok(PgUnitOfWork { tx })
    }
}

/// Unit of work over a `PostgreSQL` transaction.
#[derive(Debug)]
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl PgUnitOfWork {
    async fn fetch_lot(
        &mut self,
        sql: &'static str,
        id: InventoryLotId,
    ) -> Result<Option<InventoryLot>, RepositoryError> {
        let row = sqlx::query_as::<_, LotRow>(sql)
            .bind(id.as_i32())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        Ok(row.map(Into::into))
    }

    async fn fetch_order(
        &mut self,
        sql: &'static str,
        id: OrderId,
    ) -> Result<Option<Order>, RepositoryError> {
        let row = sqlx::query_as::<_, OrderRow>(sql)
            .bind(id.as_i32())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        Ok(row.map(Into::into))
    }

    async fn fetch_runs(
        &mut self,
        sql: &'static str,
        lot_id: InventoryLotId,
    ) -> Result<Vec<ProductionRun>, RepositoryError> {
        let rows = sqlx::query_as::<_, ProductionRunRow>(sql)
            .bind(lot_id.as_i32())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

impl UnitOfWork for PgUnitOfWork {
    // =========================================================================
    // Lots
    // =========================================================================

    async fn get_lot(&mut self, id: InventoryLotId) -> Result<Option<InventoryLot>, RepositoryError> {
        self.fetch_lot(lot_select!("WHERE id = $1"), id).await
    }

    async fn lock_lot(
        &mut self,
        id: InventoryLotId,
    ) -> Result<Option<InventoryLot>, RepositoryError> {
        self.fetch_lot(lot_select!("WHERE id = $1 FOR UPDATE"), id)
            .await
    }

    async fn get_lots(
        &mut self,
        ids: &[InventoryLotId],
    ) -> Result<Vec<InventoryLot>, RepositoryError> {
        let ids: Vec<i32> = ids.iter().map(InventoryLotId::as_i32).collect();
        let rows = sqlx::query_as::<_, LotRow>(lot_select!("WHERE id = ANY($1) ORDER BY id"))
            .bind(ids)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn find_lot_by_number(
        &mut self,
        lot_number: &str,
    ) -> Result<Option<InventoryLot>, RepositoryError> {
        let row = sqlx::query_as::<_, LotRow>(lot_select!("WHERE lot_number = $1"))
            .bind(lot_number)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        Ok(row.map(Into::into))
    }

    async fn search_lots(&mut self, fragment: &str) -> Result<Vec<InventoryLot>, RepositoryError> {
        let rows = sqlx::query_as::<_, LotRow>(lot_select!(
            "WHERE strpos(lower(lot_number), lower($1)) > 0 ORDER BY lot_number, id"
        ))
        .bind(fragment)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn eligible_lots_page(
        &mut self,
        product_id: ProductId,
        after: Option<FifoKey>,
        limit: i64,
    ) -> Result<Vec<InventoryLot>, RepositoryError> {
        // Keyset pagination over (expiry NULLS LAST, received, id). A cursor
        // with a dated expiry continues into the undated tail; an undated
        // cursor stays inside it.
        let rows = sqlx::query_as::<_, LotRow>(lot_select!(
            r"
            WHERE product_id = $1
              AND status IN ('received', 'qc_pending', 'available', 'produced')
              AND quantity_current > 0
              AND (
                NOT $2::bool
                OR ($3::date IS NOT NULL AND (
                    expiry_date IS NULL
                    OR (expiry_date, received_date, id) > ($3::date, $4::date, $5::int)
                ))
                OR ($3::date IS NULL AND expiry_date IS NULL
                    AND (received_date, id) > ($4::date, $5::int))
              )
            ORDER BY expiry_date ASC NULLS LAST, received_date ASC, id ASC
            LIMIT $6
            FOR UPDATE
            "
        ))
        .bind(product_id.as_i32())
        .bind(after.is_some())
        .bind(after.and_then(|k| k.expiry_date))
        .bind(after.map(|k| k.received_date))
        .bind(after.map(|k| k.lot_id.as_i32()))
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn lock_expired_lots(
        &mut self,
        as_of: NaiveDate,
    ) -> Result<Vec<InventoryLot>, RepositoryError> {
        let rows = sqlx::query_as::<_, LotRow>(lot_select!(
            r"
            WHERE status IN ('received', 'qc_pending', 'available', 'produced')
              AND expiry_date < $1
            ORDER BY id
            FOR UPDATE
            "
        ))
        .bind(as_of)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_lot(&mut self, lot: &NewLot) -> Result<InventoryLot, RepositoryError> {
        let sql = format!(
            "INSERT INTO warehouse.inventory_lot (
                lot_number, product_id, quantity_received, quantity_current, quantity_reserved,
                unit_of_measure, received_date, expiry_date, origin, status
            )
            VALUES ($1, $2, $3, $3, 0, $4, $5, $6, $7, $8)
            {LOT_RETURNING}"
        );
        let row = sqlx::query_as::<_, LotRow>(&sql)
            .bind(&lot.lot_number)
            .bind(lot.product_id.as_i32())
            .bind(lot.quantity)
            .bind(&lot.unit_of_measure)
            .bind(lot.received_date)
            .bind(lot.expiry_date)
            .bind(&lot.origin)
            .bind(lot.status)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        Ok(row.into())
    }

    async fn update_lot_state(
        &mut self,
        id: InventoryLotId,
        state: LotState,
    ) -> Result<InventoryLot, RepositoryError> {
        let sql = format!(
            "UPDATE warehouse.inventory_lot
            SET quantity_current = $2, quantity_reserved = $3, status = $4,
                status_before_depletion = $5, updated_at = NOW()
            WHERE id = $1
            {LOT_RETURNING}"
        );
        let row = sqlx::query_as::<_, LotRow>(&sql)
            .bind(id.as_i32())
            .bind(state.quantity_current)
            .bind(state.quantity_reserved)
            .bind(state.status)
            .bind(state.status_before_depletion)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_error)?
            .ok_or(RepositoryError::NotFound)?;
        Ok(row.into())
    }

    // =========================================================================
    // Orders
    // =========================================================================

    async fn insert_order(
        &mut self,
        input: &CreateOrderInput,
    ) -> Result<(Order, Vec<OrderItem>), RepositoryError> {
        let order: Order = sqlx::query_as::<_, OrderRow>(
            r"
            INSERT INTO warehouse.customer_order (order_number, status)
            VALUES ($1, 'draft')
            RETURNING id, order_number, status, created_at, updated_at
            ",
        )
        .bind(&input.order_number)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_error)?
        .into();

        let mut items = Vec::with_capacity(input.items.len());
        for (line, item) in (1_i32..).zip(&input.items) {
            let row = sqlx::query_as::<_, OrderItemRow>(
                r"
                INSERT INTO warehouse.order_item (order_id, line_number, product_id, quantity_ordered)
                VALUES ($1, $2, $3, $4)
                RETURNING id, order_id, line_number, product_id, quantity_ordered
                ",
            )
            .bind(order.id.as_i32())
            .bind(line)
            .bind(item.product_id.as_i32())
            .bind(item.quantity_ordered)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
            items.push(row.into());
        }

        Ok((order, items))
    }

    async fn get_order(&mut self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        self.fetch_order(order_select!("WHERE id = $1"), id).await
    }

    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        self.fetch_order(order_select!("WHERE id = $1 FOR UPDATE"), id)
            .await
    }

    async fn search_orders(&mut self, fragment: &str) -> Result<Vec<Order>, RepositoryError> {
        let rows = sqlx::query_as::<_, OrderRow>(order_select!(
            "WHERE strpos(lower(order_number), lower($1)) > 0 ORDER BY id"
        ))
        .bind(fragment)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn order_items(&mut self, order_id: OrderId) -> Result<Vec<OrderItem>, RepositoryError> {
        let rows = sqlx::query_as::<_, OrderItemRow>(
            r"
            SELECT id, order_id, line_number, product_id, quantity_ordered
            FROM warehouse.order_item
            WHERE order_id = $1
            ORDER BY line_number, id
            ",
        )
        .bind(order_id.as_i32())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_order_item(
        &mut self,
        id: OrderItemId,
    ) -> Result<Option<OrderItem>, RepositoryError> {
        let row = sqlx::query_as::<_, OrderItemRow>(
            r"
            SELECT id, order_id, line_number, product_id, quantity_ordered
            FROM warehouse.order_item
            WHERE id = $1
            ",
        )
        .bind(id.as_i32())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(row.map(Into::into))
    }

    async fn update_order_status(
        &mut self,
        id: OrderId,
        status: OrderStatus,
    ) -> Result<Order, RepositoryError> {
        let row = sqlx::query_as::<_, OrderRow>(
            r"
            UPDATE warehouse.customer_order
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, order_number, status, created_at, updated_at
            ",
        )
        .bind(id.as_i32())
        .bind(status)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error)?
        .ok_or(RepositoryError::NotFound)?;
        Ok(row.into())
    }

    // =========================================================================
    // Allocations
    // =========================================================================

    async fn allocations_for_order(
        &mut self,
        order_id: OrderId,
    ) -> Result<Vec<OrderAllocation>, RepositoryError> {
        let rows = sqlx::query_as::<_, AllocationRow>(allocation_select!(
            r"
            INNER JOIN warehouse.order_item i ON i.id = a.order_item_id
            WHERE i.order_id = $1
            ORDER BY a.id
            "
        ))
        .bind(order_id.as_i32())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn allocations_for_lot(
        &mut self,
        lot_id: InventoryLotId,
    ) -> Result<Vec<OrderAllocation>, RepositoryError> {
        let rows = sqlx::query_as::<_, AllocationRow>(allocation_select!(
            "WHERE a.lot_id = $1 ORDER BY a.id"
        ))
        .bind(lot_id.as_i32())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn find_allocation(
        &mut self,
        order_item_id: OrderItemId,
        lot_id: InventoryLotId,
    ) -> Result<Option<OrderAllocation>, RepositoryError> {
        let row = sqlx::query_as::<_, AllocationRow>(allocation_select!(
            "WHERE a.order_item_id = $1 AND a.lot_id = $2"
        ))
        .bind(order_item_id.as_i32())
        .bind(lot_id.as_i32())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(row.map(Into::into))
    }

    async fn insert_allocation(
        &mut self,
        allocation: &NewAllocation,
    ) -> Result<OrderAllocation, RepositoryError> {
        let row = sqlx::query_as::<_, AllocationRow>(
            r"
            INSERT INTO warehouse.order_allocation (order_item_id, lot_id, quantity, allocated_by)
            VALUES ($1, $2, $3, $4)
            RETURNING id, order_item_id, lot_id, quantity, quantity_fulfilled,
                      allocated_at, allocated_by
            ",
        )
        .bind(allocation.order_item_id.as_i32())
        .bind(allocation.lot_id.as_i32())
        .bind(allocation.quantity)
        .bind(allocation.allocated_by.as_i32())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(row.into())
    }

    async fn set_allocation_fulfilled(
        &mut self,
        id: OrderAllocationId,
        quantity_fulfilled: Decimal,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE warehouse.order_allocation SET quantity_fulfilled = $2 WHERE id = $1",
        )
        .bind(id.as_i32())
        .bind(quantity_fulfilled)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_allocations_for_order(&mut self, order_id: OrderId) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r"
            DELETE FROM warehouse.order_allocation a
            USING warehouse.order_item i
            WHERE i.id = a.order_item_id AND i.order_id = $1
            ",
        )
        .bind(order_id.as_i32())
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Picks
    // =========================================================================

    async fn insert_pick(&mut self, pick: &NewPick) -> Result<OrderPick, RepositoryError> {
        let row = sqlx::query_as::<_, PickRow>(
            r"
            INSERT INTO warehouse.order_pick (
                order_item_id, lot_id, quantity, reservation_consumed, picked_by
            )
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, order_item_id, lot_id, quantity, reservation_consumed,
                      picked_by, picked_at
            ",
        )
        .bind(pick.order_item_id.as_i32())
        .bind(pick.lot_id.as_i32())
        .bind(pick.quantity)
        .bind(pick.reservation_consumed)
        .bind(pick.picked_by.as_i32())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(row.into())
    }

    async fn get_pick(&mut self, id: OrderPickId) -> Result<Option<OrderPick>, RepositoryError> {
        let row = sqlx::query_as::<_, PickRow>(pick_select!("WHERE p.id = $1"))
            .bind(id.as_i32())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        Ok(row.map(Into::into))
    }

    async fn picks_for_item(
        &mut self,
        order_item_id: OrderItemId,
    ) -> Result<Vec<OrderPick>, RepositoryError> {
        let rows = sqlx::query_as::<_, PickRow>(pick_select!(
            "WHERE p.order_item_id = $1 ORDER BY p.id"
        ))
        .bind(order_item_id.as_i32())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn picks_for_order(&mut self, order_id: OrderId) -> Result<Vec<OrderPick>, RepositoryError> {
        let rows = sqlx::query_as::<_, PickRow>(pick_select!(
            r"
            INNER JOIN warehouse.order_item i ON i.id = p.order_item_id
            WHERE i.order_id = $1
            ORDER BY p.id
            "
        ))
        .bind(order_id.as_i32())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn picks_for_lot(
        &mut self,
        lot_id: InventoryLotId,
    ) -> Result<Vec<OrderPick>, RepositoryError> {
        let rows = sqlx::query_as::<_, PickRow>(pick_select!(
            "WHERE p.lot_id = $1 ORDER BY p.picked_at, p.id"
        ))
        .bind(lot_id.as_i32())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_pick(&mut self, id: OrderPickId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM warehouse.order_pick WHERE id = $1")
            .bind(id.as_i32())
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Production runs
    // =========================================================================

    async fn insert_production_run(
        &mut self,
        run: &NewProductionRun,
    ) -> Result<ProductionRun, RepositoryError> {
        let row = sqlx::query_as::<_, ProductionRunRow>(
            r"
            INSERT INTO warehouse.production_run (
                source_lot_id, destination_lot_id, quantity_consumed, quantity_produced,
                unit_of_measure, produced_by
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, source_lot_id, destination_lot_id, quantity_consumed,
                      quantity_produced, unit_of_measure, produced_by, produced_at
            ",
        )
        .bind(run.source_lot_id.as_i32())
        .bind(run.destination_lot_id.as_i32())
        .bind(run.quantity_consumed)
        .bind(run.quantity_produced)
        .bind(&run.unit_of_measure)
        .bind(run.produced_by.as_i32())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(row.into())
    }

    async fn runs_by_destination(
        &mut self,
        lot_id: InventoryLotId,
    ) -> Result<Vec<ProductionRun>, RepositoryError> {
        self.fetch_runs(run_select!("WHERE destination_lot_id = $1 ORDER BY id"), lot_id)
            .await
    }

    async fn runs_by_source(
        &mut self,
        lot_id: InventoryLotId,
    ) -> Result<Vec<ProductionRun>, RepositoryError> {
        self.fetch_runs(run_select!("WHERE source_lot_id = $1 ORDER BY id"), lot_id)
            .await
    }

    async fn commit(self) -> Result<(), RepositoryError> {
        self.tx.commit().await.map_err(map_db_error)
    }
}
