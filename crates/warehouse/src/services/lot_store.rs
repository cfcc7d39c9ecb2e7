//! Lot store: the canonical quantity and status of each lot.
//!
//! Quantity changes go through [`adjust_quantity`] and [`reserve`], which
//! lock the lot inside the caller's unit of work and enforce
//! `0 <= quantity_reserved <= quantity_current <= quantity_received`.

use std::collections::VecDeque;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, instrument, warn};

use lotkeeper_core::{ActorId, InventoryLotId, LotStatus, ProductId};

use super::InventoryEngine;
use crate::db::{RepositoryError, Store, UnitOfWork};
use crate::error::EngineError;
use crate::models::{
    AuditAction, AuditEntity, AuditEvent, ExpiryOutcome, FifoKey, InventoryLot, LotOutcome,
    LotState, NewLot, ReceiveLotInput,
};

// =============================================================================
// FIFO cursor
// =============================================================================

/// Lazy, restartable walk over a product's eligible lots in FIFO-by-expiry order.
///
/// Lots are fetched (and, on `PostgreSQL`, locked) a page at a time from the
/// unit of work passed to [`EligibleLots::next_lot`]. The walk ends when a
/// page comes back short.
#[derive(Debug, Clone)]
pub struct EligibleLots {
    product_id: ProductId,
    page_size: i64,
    buffer: VecDeque<InventoryLot>,
    last: Option<FifoKey>,
    exhausted: bool,
}

impl EligibleLots {
    /// Start a walk over `product_id`'s eligible lots.
    #[must_use]
    pub fn new(product_id: ProductId, page_size: i64) -> Self {
        Self {
            product_id,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            last: None,
            exhausted: false,
        }
    }

    /// The next lot, or `None` once every eligible lot has been yielded.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError` if fetching a page fails.
    pub async fn next_lot<U: UnitOfWork>(
        &mut self,
        tx: &mut U,
    ) -> Result<Option<InventoryLot>, RepositoryError> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = tx
                .eligible_lots_page(self.product_id, self.last, self.page_size)
                .await?;
            self.exhausted = i64::try_from(page.len()).unwrap_or(i64::MAX) < self.page_size;
            self.buffer.extend(page);
        }
        let lot = self.buffer.pop_front();
        if let Some(lot) = &lot {
            self.last = Some(lot.fifo_key());
        }
        Ok(lot)
    }

    /// Restart the walk from the first eligible lot.
    pub fn rewind(&mut self) {
        self.buffer.clear();
        self.last = None;
        self.exhausted = false;
    }
}

// =============================================================================
// Unit-of-work primitives
// =============================================================================

/// Lock a lot, failing with `NotFound` if it does not exist.
pub(crate) async fn lock_existing<U: UnitOfWork>(
    tx: &mut U,
    lot_id: InventoryLotId,
) -> Result<InventoryLot, EngineError> {
    tx.lock_lot(lot_id)
        .await?
        .ok_or_else(|| EngineError::not_found("lot", lot_id))
}

/// New state of `lot` after changing its on-hand quantity by `delta`.
///
/// Reaching zero depletes the lot unless it is already terminal, remembering
/// the status it had. Restoring stock to a depleted lot brings that status back.
pub(crate) fn adjusted_state(lot: &InventoryLot, delta: Decimal) -> Result<LotState, EngineError> {
    let current = lot.quantity_current.checked_add(delta).ok_or_else(|| {
        EngineError::InvalidQuantity(format!(
            "lot {} change {delta} is out of range",
            lot.lot_number
        ))
    })?;
    if current < Decimal::ZERO {
        return Err(EngineError::InvalidQuantity(format!(
            "lot {} would go negative: current {}, change {delta}",
            lot.lot_number, lot.quantity_current
        )));
    }
    if current > lot.quantity_received {
        return Err(EngineError::InvalidQuantity(format!(
            "lot {} would exceed its received quantity {}: current {}, change {delta}",
            lot.lot_number, lot.quantity_received, lot.quantity_current
        )));
    }
    if current < lot.quantity_reserved {
        return Err(EngineError::InvalidQuantity(format!(
            "lot {} would drop below its reserved quantity {}: current {}, change {delta}",
            lot.lot_number, lot.quantity_reserved, lot.quantity_current
        )));
    }

    let (status, status_before_depletion) = if current.is_zero() && !lot.status.is_terminal() {
        (LotStatus::Depleted, Some(lot.status))
    } else if lot.status == LotStatus::Depleted && current > Decimal::ZERO {
        (lot.status_before_depletion.unwrap_or(LotStatus::Available), None)
    } else {
        (lot.status, lot.status_before_depletion)
    };

    Ok(LotState {
        quantity_current: current,
        quantity_reserved: lot.quantity_reserved,
        status,
        status_before_depletion,
    })
}

/// New state of `lot` after changing its reserved quantity by `delta`.
pub(crate) fn reserved_state(lot: &InventoryLot, delta: Decimal) -> Result<LotState, EngineError> {
    let reserved = lot.quantity_reserved.checked_add(delta).ok_or_else(|| {
        EngineError::InvalidQuantity(format!(
            "lot {} reservation change {delta} is out of range",
            lot.lot_number
        ))
    })?;
    if reserved < Decimal::ZERO || reserved > lot.quantity_current {
        return Err(EngineError::InvalidQuantity(format!(
            "lot {} reservation {} out of range 0..={}: change {delta}",
            lot.lot_number, reserved, lot.quantity_current
        )));
    }
    Ok(LotState {
        quantity_reserved: reserved,
        ..LotState::from(lot)
    })
}

/// Change a lot's on-hand quantity inside `tx`.
///
/// # Errors
///
/// Returns `EngineError::NotFound` for an unknown lot and
/// `EngineError::InvalidQuantity` if the result would be negative, exceed the
/// received quantity or drop below the reserved quantity.
pub async fn adjust_quantity<U: UnitOfWork>(
    tx: &mut U,
    lot_id: InventoryLotId,
    delta: Decimal,
) -> Result<InventoryLot, EngineError> {
    let lot = lock_existing(tx, lot_id).await?;
    let state = adjusted_state(&lot, delta)?;
    Ok(tx.update_lot_state(lot_id, state).await?)
}

/// Change a lot's reserved quantity inside `tx`, keeping it within `[0, quantity_current]`.
///
/// # Errors
///
/// Returns `EngineError::NotFound` for an unknown lot and
/// `EngineError::InvalidQuantity` if the reservation would leave its bounds.
pub async fn reserve<U: UnitOfWork>(
    tx: &mut U,
    lot_id: InventoryLotId,
    delta: Decimal,
) -> Result<InventoryLot, EngineError> {
    let lot = lock_existing(tx, lot_id).await?;
    let state = reserved_state(&lot, delta)?;
    Ok(tx.update_lot_state(lot_id, state).await?)
}

const fn status_change_allowed(from: LotStatus, to: LotStatus) -> bool {
    match (from, to) {
        (LotStatus::Received, LotStatus::QcPending | LotStatus::Available)
        | (LotStatus::QcPending | LotStatus::Produced, LotStatus::Available)
        | (LotStatus::Available | LotStatus::Produced, LotStatus::QcPending) => true,
        (from, LotStatus::Expired) => from.is_eligible(),
        _ => false,
    }
}

// =============================================================================
// Engine operations
// =============================================================================

impl<S: Store> InventoryEngine<S> {
    /// Read a lot.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotFound` if the lot does not exist.
    pub async fn lot(&self, lot_id: InventoryLotId) -> Result<InventoryLot, EngineError> {
        let mut tx = self.store.begin().await?;
        tx.get_lot(lot_id)
            .await?
            .ok_or_else(|| EngineError::not_found("lot", lot_id))
    }

    /// Read a lot by its exact lot number.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotFound` if no lot carries the number.
    pub async fn lot_by_number(&self, lot_number: &str) -> Result<InventoryLot, EngineError> {
        let mut tx = self.store.begin().await?;
        tx.find_lot_by_number(lot_number)
            .await?
            .ok_or_else(|| EngineError::not_found("lot", lot_number))
    }

    /// Create a lot from a receiving event.
    ///
    /// The lot starts `QC_PENDING` when `qc_required`, `RECEIVED` otherwise.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidQuantity` for a non-positive quantity,
    /// `EngineError::InvalidInput` for a blank lot number, and
    /// `EngineError::Storage` if the lot number is taken.
    #[instrument(skip(self, input), fields(lot_number = %input.lot_number, product_id = %input.product_id))]
    pub async fn receive(
        &self,
        input: ReceiveLotInput,
        actor: ActorId,
    ) -> Result<LotOutcome, EngineError> {
        if input.quantity <= Decimal::ZERO {
            return Err(EngineError::InvalidQuantity(format!(
                "received quantity must be positive, got {}",
                input.quantity
            )));
        }
        let lot_number = input.lot_number.trim();
        if lot_number.is_empty() {
            return Err(EngineError::InvalidInput(
                "lot number must not be blank".to_string(),
            ));
        }

        let mut tx = self.store.begin().await?;
        let lot = tx
            .insert_lot(&NewLot {
                lot_number: lot_number.to_string(),
                product_id: input.product_id,
                quantity: input.quantity,
                unit_of_measure: input.unit_of_measure,
                received_date: input.received_date,
                expiry_date: input.expiry_date,
                origin: input.origin,
                status: if input.qc_required {
                    LotStatus::QcPending
                } else {
                    LotStatus::Received
                },
            })
            .await?;
        tx.commit().await?;

        info!(lot_id = %lot.id, quantity = %lot.quantity_received, "Received lot");

        let audited = self.emit(&[AuditEvent::new(
            actor,
            AuditAction::LotReceived,
            AuditEntity::Lot,
            lot.id,
            json!({
                "lot_number": lot.lot_number,
                "product_id": lot.product_id,
                "quantity": lot.quantity_received,
                "unit_of_measure": lot.unit_of_measure,
                "expiry_date": lot.expiry_date,
                "origin": lot.origin,
                "status": lot.status,
            }),
        )]);
        Ok(LotOutcome { lot, audited })
    }

    /// Move a lot to another status (QC release, quarantine, manual expiry).
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotFound` for an unknown lot and
    /// `EngineError::InvalidState` if the transition is not permitted.
    #[instrument(skip(self))]
    pub async fn set_status(
        &self,
        lot_id: InventoryLotId,
        status: LotStatus,
        actor: ActorId,
    ) -> Result<LotOutcome, EngineError> {
        let mut tx = self.store.begin().await?;
        let lot = lock_existing(&mut tx, lot_id).await?;
        if !status_change_allowed(lot.status, status) {
            warn!(from = %lot.status, to = %status, "Refused lot status change");
            return Err(EngineError::invalid_state(
                "lot",
                &lot.lot_number,
                lot.status,
                "change status of",
            ));
        }
        let previous = lot.status;
        let lot = tx
            .update_lot_state(
                lot_id,
                LotState {
                    status,
                    ..LotState::from(&lot)
                },
            )
            .await?;
        tx.commit().await?;

        info!(from = %previous, to = %status, "Changed lot status");

        let audited = self.emit(&[AuditEvent::new(
            actor,
            AuditAction::LotStatusChanged,
            AuditEntity::Lot,
            lot.id,
            json!({ "from": previous, "to": status }),
        )]);
        Ok(LotOutcome { lot, audited })
    }

    /// Correct a lot's on-hand quantity (cycle count, damage write-off).
    ///
    /// # Errors
    ///
    /// See [`adjust_quantity`].
    #[instrument(skip(self))]
    pub async fn adjust_quantity(
        &self,
        lot_id: InventoryLotId,
        delta: Decimal,
        actor: ActorId,
    ) -> Result<LotOutcome, EngineError> {
        let mut tx = self.store.begin().await?;
        let lot = adjust_quantity(&mut tx, lot_id, delta).await?;
        tx.commit().await?;

        info!(quantity_current = %lot.quantity_current, status = %lot.status, "Adjusted lot quantity");

        let audited = self.emit(&[AuditEvent::new(
            actor,
            AuditAction::QuantityAdjusted,
            AuditEntity::Lot,
            lot.id,
            json!({ "delta": delta, "quantity_current": lot.quantity_current }),
        )]);
        Ok(LotOutcome { lot, audited })
    }

    /// Every eligible lot of a product, in FIFO-by-expiry order.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Storage` if the store fails.
    #[instrument(skip(self))]
    pub async fn list_eligible(
        &self,
        product_id: ProductId,
    ) -> Result<Vec<InventoryLot>, EngineError> {
        let mut tx = self.store.begin().await?;
        let mut cursor = EligibleLots::new(product_id, self.config.eligible_page_size);
        let mut lots = Vec::new();
        while let Some(lot) = cursor.next_lot(&mut tx).await? {
            lots.push(lot);
        }
        Ok(lots)
    }

    /// Mark every eligible lot whose expiry date is before `as_of` as `EXPIRED`.
    ///
    /// Outstanding reservations on those lots stay recorded.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Storage` if the store fails.
    #[instrument(skip(self))]
    pub async fn expire_lots(
        &self,
        as_of: NaiveDate,
        actor: ActorId,
    ) -> Result<ExpiryOutcome, EngineError> {
        let mut tx = self.store.begin().await?;
        let mut expired = Vec::new();
        for lot in tx.lock_expired_lots(as_of).await? {
            let state = LotState {
                status: LotStatus::Expired,
                ..LotState::from(&lot)
            };
            expired.push(tx.update_lot_state(lot.id, state).await?);
        }
        tx.commit().await?;

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired lots");
        }

        let events: Vec<AuditEvent> = expired
            .iter()
            .map(|lot| {
                AuditEvent::new(
                    actor,
                    AuditAction::LotExpired,
                    AuditEntity::Lot,
                    lot.id,
                    json!({
                        "lot_number": lot.lot_number,
                        "expiry_date": lot.expiry_date,
                        "as_of": as_of,
                        "quantity_current": lot.quantity_current,
                    }),
                )
            })
            .collect();
        let audited = self.emit(&events);
        Ok(ExpiryOutcome { expired, audited })
    }
}
