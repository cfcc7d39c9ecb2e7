//! Integration tests for Lotkeeper.
//!
//! # Running Tests
//!
//! ```bash
//! # In-memory store only
//! cargo test -p lotkeeper-integration-tests
//!
//! # Also exercise PostgreSQL (tests skip when unset)
//! WAREHOUSE_TEST_DATABASE_URL=postgres://localhost/lotkeeper_test \
//!     cargo test -p lotkeeper-integration-tests
//! ```
//!
//! # Test Categories
//!
//! - `scenarios` - End-to-end receive, allocate, pick, ship, convert flows
//! - `invariants` - Quantity bounds and reservation accounting, including concurrency
//! - `audit` - Audit delivery failures never roll back a committed mutation
//! - `postgres` - The same flows against a real database

#![allow(clippy::unwrap_used, clippy::missing_panics_doc)]

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use secrecy::SecretString;
use sqlx::PgPool;

use lotkeeper_core::{ActorId, InventoryLotId, OrderId, ProductId};
use lotkeeper_warehouse::config::EngineConfig;
use lotkeeper_warehouse::db::{MemoryStore, PgStore, Store, UnitOfWork, create_pool};
use lotkeeper_warehouse::models::{
    ConversionSource, ConvertInput, CreateOrderInput, CreateOrderItemInput, InventoryLot, Order,
    OrderItem, ReceiveLotInput,
};
use lotkeeper_warehouse::services::{AuditSink, InventoryEngine, RecordingAuditSink};

/// Actor used by every fixture.
pub const ACTOR: ActorId = ActorId::new(7);

/// Shorthand for whole-number quantities.
#[must_use]
pub fn qty(v: i64) -> Decimal {
    Decimal::from(v)
}

/// Calendar date shorthand.
#[must_use]
pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// An engine plus the sink recording its audit events.
pub struct TestContext<S: Store> {
    pub engine: InventoryEngine<S>,
    pub audit: Arc<RecordingAuditSink>,
}

impl TestContext<MemoryStore> {
    /// Engine over a fresh in-memory store with default configuration.
    #[must_use]
    pub fn memory() -> Self {
        Self::memory_with(MemoryStore::new(), EngineConfig::default())
    }

    /// Engine over the given in-memory store and configuration.
    #[must_use]
    pub fn memory_with(store: MemoryStore, config: EngineConfig) -> Self {
        let audit = Arc::new(RecordingAuditSink::new());
        let sink: Arc<dyn AuditSink> = audit.clone();
        Self {
            engine: InventoryEngine::new(store, config, sink),
            audit,
        }
    }
}

impl TestContext<PgStore> {
    /// Engine over `WAREHOUSE_TEST_DATABASE_URL`, migrated; `None` when unset.
    pub async fn postgres() -> Option<Self> {
        let url = std::env::var("WAREHOUSE_TEST_DATABASE_URL").ok()?;
        let pool: PgPool = create_pool(&SecretString::from(url), 5).await.unwrap();
        sqlx::migrate!("../warehouse/migrations")
            .run(&pool)
            .await
            .unwrap();
        let config = EngineConfig::default();
        let audit = Arc::new(RecordingAuditSink::new());
        let sink: Arc<dyn AuditSink> = audit.clone();
        Some(Self {
            engine: InventoryEngine::new(PgStore::new(pool, config.lock_timeout), config, sink),
            audit,
        })
    }
}

impl<S: Store> TestContext<S> {
    /// Receive an available lot of `product` received on 2024-01-01.
    pub async fn receive(
        &self,
        lot_number: &str,
        product: i32,
        quantity: i64,
        expiry: Option<NaiveDate>,
    ) -> InventoryLot {
        self.engine
            .receive(
                ReceiveLotInput {
                    lot_number: lot_number.to_string(),
                    product_id: ProductId::new(product),
                    quantity: qty(quantity),
                    unit_of_measure: "kg".to_string(),
                    received_date: date(2024, 1, 1),
                    expiry_date: expiry,
                    origin: Some("Integration Farm".to_string()),
                    qc_required: false,
                },
                ACTOR,
            )
            .await
            .unwrap()
            .lot
    }

    /// Create a draft order from `(product, quantity)` lines.
    pub async fn order(&self, number: &str, lines: &[(i32, i64)]) -> (Order, Vec<OrderItem>) {
        let outcome = self
            .engine
            .create_order(
                CreateOrderInput {
                    order_number: number.to_string(),
                    items: lines
                        .iter()
                        .map(|&(product, quantity)| CreateOrderItemInput {
                            product_id: ProductId::new(product),
                            quantity_ordered: qty(quantity),
                        })
                        .collect(),
                },
                ACTOR,
            )
            .await
            .unwrap();
        (outcome.order, outcome.items)
    }

    /// Current state of a lot.
    pub async fn lot(&self, id: InventoryLotId) -> InventoryLot {
        self.engine.lot(id).await.unwrap()
    }

    /// Assert the quantity bounds and that reservations match outstanding allocations.
    pub async fn assert_lot_invariants(&self, lot_ids: &[InventoryLotId]) {
        let mut tx = self.engine.store().begin().await.unwrap();
        for lot in tx.get_lots(lot_ids).await.unwrap() {
            assert!(lot.quantity_current >= Decimal::ZERO, "{lot:?}");
            assert!(lot.quantity_current <= lot.quantity_received, "{lot:?}");
            assert!(lot.quantity_reserved >= Decimal::ZERO, "{lot:?}");
            assert!(lot.quantity_reserved <= lot.quantity_current, "{lot:?}");
            let outstanding: Decimal = tx
                .allocations_for_lot(lot.id)
                .await
                .unwrap()
                .iter()
                .map(|a| a.outstanding())
                .sum();
            assert_eq!(outstanding, lot.quantity_reserved, "{lot:?}");
        }
    }

    /// Sum of picks recorded for an order.
    pub async fn picked_total(&self, order_id: OrderId) -> Decimal {
        let mut tx = self.engine.store().begin().await.unwrap();
        tx.picks_for_order(order_id)
            .await
            .unwrap()
            .iter()
            .map(|p| p.quantity)
            .sum()
    }
}

/// Conversion input from `(lot, quantity)` sources.
#[must_use]
pub fn conversion(
    sources: &[(InventoryLotId, i64)],
    product: i32,
    produced: i64,
) -> ConvertInput {
    ConvertInput {
        sources: sources
            .iter()
            .map(|&(lot_id, quantity)| ConversionSource {
                lot_id,
                quantity: qty(quantity),
            })
            .collect(),
        output_product_id: ProductId::new(product),
        quantity_produced: qty(produced),
        unit_of_measure: "jar".to_string(),
        lot_number: None,
        expiry_date: None,
    }
}

/// A lot or order number unique to this run, for shared databases.
#[must_use]
pub fn unique(prefix: &str) -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(12);
    format!("{prefix}-{id}")
}

/// A product ID unlikely to collide with other runs on a shared database.
#[must_use]
pub fn unique_product() -> i32 {
    let raw = uuid::Uuid::new_v4().as_u128() % 1_000_000_000;
    i32::try_from(raw).unwrap() + 1_000_000
}
