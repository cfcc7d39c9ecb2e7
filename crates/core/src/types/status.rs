//! Lifecycle status enums for lots and orders.
//!
//! Both enums map to `PostgreSQL` enum types in the `warehouse` schema when the
//! `postgres` feature is enabled, and serialize as `SCREAMING_SNAKE_CASE` so
//! that API payloads match the names used on warehouse paperwork.

use serde::{Deserialize, Serialize};

/// Inventory lot lifecycle status.
///
/// `Received -> QcPending -> Available -> {Depleted | Expired}`. Lots created by
/// a production conversion start in `Produced`, which behaves like `Received`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "warehouse.lot_status", rename_all = "snake_case")
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LotStatus {
    #[default]
    Received,
    QcPending,
    Available,
    Produced,
    Depleted,
    Expired,
}

impl LotStatus {
    /// Whether lots in this status may be allocated, picked or consumed.
    #[must_use]
    pub const fn is_eligible(self) -> bool {
        matches!(
            self,
            Self::Received | Self::QcPending | Self::Available | Self::Produced
        )
    }

    /// Terminal statuses are never left through a status change.
    ///
    /// `Depleted` is the one exception on the quantity path: restoring stock to
    /// a depleted lot makes it `Available` again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Depleted | Self::Expired)
    }

    /// Stable lowercase name, identical to the database label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::QcPending => "qc_pending",
            Self::Available => "available",
            Self::Produced => "produced",
            Self::Depleted => "depleted",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for LotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "received" => Ok(Self::Received),
            "qc_pending" => Ok(Self::QcPending),
            "available" => Ok(Self::Available),
            "produced" => Ok(Self::Produced),
            "depleted" => Ok(Self::Depleted),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("invalid lot status: {s}")),
        }
    }
}

/// Order status state machine.
///
/// `Draft -> Confirmed -> Picking -> PartialPick -> ReadyToShip -> Shipped`,
/// with `Shipped -> ReadyToShip` as the only backwards edge (unship).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "warehouse.order_status", rename_all = "snake_case")
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[default]
    Draft,
    Confirmed,
    Picking,
    PartialPick,
    ReadyToShip,
    Shipped,
}

impl OrderStatus {
    /// Whether picks may be created for an order in this status.
    #[must_use]
    pub const fn accepts_picks(self) -> bool {
        matches!(self, Self::Confirmed | Self::Picking | Self::PartialPick)
    }

    /// Stable lowercase name, identical to the database label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Confirmed => "confirmed",
            Self::Picking => "picking",
            Self::PartialPick => "partial_pick",
            Self::ReadyToShip => "ready_to_ship",
            Self::Shipped => "shipped",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "confirmed" => Ok(Self::Confirmed),
            "picking" => Ok(Self::Picking),
            "partial_pick" => Ok(Self::PartialPick),
            "ready_to_ship" => Ok(Self::ReadyToShip),
            "shipped" => Ok(Self::Shipped),
            _ => Err(format!("invalid order status: {s}")),
        }
    }
}
