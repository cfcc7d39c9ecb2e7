//! Persistence for the warehouse engine.
//!
//! # Units of work
//!
//! Every engine operation runs inside one [`UnitOfWork`] obtained from a
//! [`Store`]. A unit of work is a database transaction: `lock_*` methods take
//! row-level locks that are held until [`UnitOfWork::commit`] returns, and
//! dropping a unit of work without committing rolls everything back.
//!
//! Two stores implement the contract:
//!
//! - [`PgStore`] - `PostgreSQL` via `sqlx`, `SELECT ... FOR UPDATE` row locks
//! - [`MemoryStore`] - in-process state behind a mutex, serialising units of work
//!
//! # Database: `warehouse` schema
//!
//! ## Tables
//!
//! - `inventory_lot` - Lots with received/current/reserved quantities
//! - `customer_order` / `order_item` - Demand aggregate
//! - `order_allocation` - Reservations (unique per item and lot)
//! - `order_pick` - Physical withdrawals
//! - `production_run` - Genealogy edges (source lot -> destination lot)
//!
//! # Migrations
//!
//! Migrations are stored in `crates/warehouse/migrations/` and run via:
//! ```bash
//! cargo run -p lotkeeper-cli -- migrate
//! ```

pub mod memory;
pub mod postgres;

use std::future::Future;
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use lotkeeper_core::{
    InventoryLotId, OrderAllocationId, OrderId, OrderItemId, OrderPickId, OrderStatus, ProductId,
};

use crate::models::{
    CreateOrderInput, FifoKey, InventoryLot, LotState, NewAllocation, NewLot, NewPick,
    NewProductionRun, Order, OrderAllocation, OrderItem, OrderPick, ProductionRun,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,

    /// Constraint violation (e.g., duplicate lot number).
    #[error("constraint violation: {0}")]
    Conflict(String),

    /// A row lock or the store itself could not be acquired in time.
    #[error("lock timeout: {0}")]
    LockTimeout(String),

    /// The database aborted the transaction (serialization failure or deadlock).
    #[error("transaction aborted: {0}")]
    Serialization(String),
}

impl RepositoryError {
    /// Whether retrying the whole unit of work may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout(_) | Self::Serialization(_))
    }
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Arguments
///
/// * `database_url` - `PostgreSQL` connection string (wrapped in `SecretString`)
/// * `max_connections` - Upper bound on pooled connections
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(
    database_url: &secrecy::SecretString,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}

/// Source of units of work.
pub trait Store: Clone + Send + Sync + 'static {
    /// Transaction type handed out by this store.
    type Tx: UnitOfWork;

    /// Begin a unit of work.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::LockTimeout` if the store cannot start a
    /// transaction within its lock timeout, or `RepositoryError::Database`.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx, RepositoryError>> + Send;
}

/// One transaction against the store.
///
/// All reads observe the unit's own uncommitted writes. `lock_*` reads take an
/// exclusive row lock held until commit or rollback.
pub trait UnitOfWork: Send {
    // =========================================================================
    // Lots
    // =========================================================================

    /// Read a lot without locking it.
    fn get_lot(
        &mut self,
        id: InventoryLotId,
    ) -> impl Future<Output = Result<Option<InventoryLot>, RepositoryError>> + Send;

    /// Read and lock a lot.
    fn lock_lot(
        &mut self,
        id: InventoryLotId,
    ) -> impl Future<Output = Result<Option<InventoryLot>, RepositoryError>> + Send;

    /// Read several lots, ordered by id. Missing ids are skipped.
    fn get_lots(
        &mut self,
        ids: &[InventoryLotId],
    ) -> impl Future<Output = Result<Vec<InventoryLot>, RepositoryError>> + Send;

    /// Find a lot by exact lot number.
    fn find_lot_by_number(
        &mut self,
        lot_number: &str,
    ) -> impl Future<Output = Result<Option<InventoryLot>, RepositoryError>> + Send;

    /// Lots whose number contains `fragment`, case-insensitively, ordered by
    /// lot number then id.
    fn search_lots(
        &mut self,
        fragment: &str,
    ) -> impl Future<Output = Result<Vec<InventoryLot>, RepositoryError>> + Send;

    /// Lock and return the next page of eligible lots for a product in FIFO
    /// order, strictly after `after`.
    ///
    /// Eligible means status in {received, `qc_pending`, available, produced}
    /// and `quantity_current > 0`.
    fn eligible_lots_page(
        &mut self,
        product_id: ProductId,
        after: Option<FifoKey>,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<InventoryLot>, RepositoryError>> + Send;

    /// Lock and return eligible lots whose expiry date is before `as_of`,
    /// ordered by id.
    fn lock_expired_lots(
        &mut self,
        as_of: NaiveDate,
    ) -> impl Future<Output = Result<Vec<InventoryLot>, RepositoryError>> + Send;

    /// Insert a lot.
    ///
    /// Returns `RepositoryError::Conflict` if the lot number is taken.
    fn insert_lot(
        &mut self,
        lot: &NewLot,
    ) -> impl Future<Output = Result<InventoryLot, RepositoryError>> + Send;

    /// Write new quantity/status values for a (locked) lot.
    fn update_lot_state(
        &mut self,
        id: InventoryLotId,
        state: LotState,
    ) -> impl Future<Output = Result<InventoryLot, RepositoryError>> + Send;

    // =========================================================================
    // Orders
    // =========================================================================

    /// Insert an order and its items in `DRAFT`.
    fn insert_order(
        &mut self,
        input: &CreateOrderInput,
    ) -> impl Future<Output = Result<(Order, Vec<OrderItem>), RepositoryError>> + Send;

    /// Read an order without locking it.
    fn get_order(
        &mut self,
        id: OrderId,
    ) -> impl Future<Output = Result<Option<Order>, RepositoryError>> + Send;

    /// Read and lock an order.
    fn lock_order(
        &mut self,
        id: OrderId,
    ) -> impl Future<Output = Result<Option<Order>, RepositoryError>> + Send;

    /// Orders whose number contains `fragment`, case-insensitively, ordered by id.
    fn search_orders(
        &mut self,
        fragment: &str,
    ) -> impl Future<Output = Result<Vec<Order>, RepositoryError>> + Send;

    /// Items of an order, by line number.
    fn order_items(
        &mut self,
        order_id: OrderId,
    ) -> impl Future<Output = Result<Vec<OrderItem>, RepositoryError>> + Send;

    /// Read one order item.
    fn get_order_item(
        &mut self,
        id: OrderItemId,
    ) -> impl Future<Output = Result<Option<OrderItem>, RepositoryError>> + Send;

    /// Set an order's status.
    fn update_order_status(
        &mut self,
        id: OrderId,
        status: OrderStatus,
    ) -> impl Future<Output = Result<Order, RepositoryError>> + Send;

    // =========================================================================
    // Allocations
    // =========================================================================

    /// Allocations for every item of an order, by id.
    fn allocations_for_order(
        &mut self,
        order_id: OrderId,
    ) -> impl Future<Output = Result<Vec<OrderAllocation>, RepositoryError>> + Send;

    /// Allocations on a lot, by id.
    fn allocations_for_lot(
        &mut self,
        lot_id: InventoryLotId,
    ) -> impl Future<Output = Result<Vec<OrderAllocation>, RepositoryError>> + Send;

    /// The allocation of an item on a lot, if any.
    fn find_allocation(
        &mut self,
        order_item_id: OrderItemId,
        lot_id: InventoryLotId,
    ) -> impl Future<Output = Result<Option<OrderAllocation>, RepositoryError>> + Send;

    /// Insert an allocation.
    ///
    /// Returns `RepositoryError::Conflict` if the item is already allocated to the lot.
    fn insert_allocation(
        &mut self,
        allocation: &NewAllocation,
    ) -> impl Future<Output = Result<OrderAllocation, RepositoryError>> + Send;

    /// Set how much of an allocation has been consumed by picks.
    fn set_allocation_fulfilled(
        &mut self,
        id: OrderAllocationId,
        quantity_fulfilled: Decimal,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete every allocation of an order, returning how many were removed.
    fn delete_allocations_for_order(
        &mut self,
        order_id: OrderId,
    ) -> impl Future<Output = Result<u64, RepositoryError>> + Send;

    // =========================================================================
    // Picks
    // =========================================================================

    /// Insert a pick.
    fn insert_pick(
        &mut self,
        pick: &NewPick,
    ) -> impl Future<Output = Result<OrderPick, RepositoryError>> + Send;

    /// Read one pick.
    fn get_pick(
        &mut self,
        id: OrderPickId,
    ) -> impl Future<Output = Result<Option<OrderPick>, RepositoryError>> + Send;

    /// Picks for an order item, by id.
    fn picks_for_item(
        &mut self,
        order_item_id: OrderItemId,
    ) -> impl Future<Output = Result<Vec<OrderPick>, RepositoryError>> + Send;

    /// Picks for every item of an order, by id.
    fn picks_for_order(
        &mut self,
        order_id: OrderId,
    ) -> impl Future<Output = Result<Vec<OrderPick>, RepositoryError>> + Send;

    /// Picks drawn from a lot, by pick time then id.
    fn picks_for_lot(
        &mut self,
        lot_id: InventoryLotId,
    ) -> impl Future<Output = Result<Vec<OrderPick>, RepositoryError>> + Send;

    /// Delete a pick, returning whether it existed.
    fn delete_pick(
        &mut self,
        id: OrderPickId,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    // =========================================================================
    // Production runs
    // =========================================================================

    /// Insert a production run.
    fn insert_production_run(
        &mut self,
        run: &NewProductionRun,
    ) -> impl Future<Output = Result<ProductionRun, RepositoryError>> + Send;

    /// Runs whose destination is the lot, by id.
    fn runs_by_destination(
        &mut self,
        lot_id: InventoryLotId,
    ) -> impl Future<Output = Result<Vec<ProductionRun>, RepositoryError>> + Send;

    /// Runs whose source is the lot, by id.
    fn runs_by_source(
        &mut self,
        lot_id: InventoryLotId,
    ) -> impl Future<Output = Result<Vec<ProductionRun>, RepositoryError>> + Send;

    // =========================================================================
    // Completion
    // =========================================================================

    /// Make every write of this unit durable and release its locks.
    fn commit(self) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(RepositoryError::LockTimeout("lot 1".into()).is_transient());
        assert!(RepositoryError::Serialization("40001".into()).is_transient());
        assert!(!RepositoryError::NotFound.is_transient());
        assert!(!RepositoryError::Conflict("dup".into()).is_transient());
    }
}
