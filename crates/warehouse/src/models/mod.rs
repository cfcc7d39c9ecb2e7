//! Domain models for the warehouse engine.

pub mod audit;
pub mod genealogy;
pub mod lot;
pub mod order;
pub mod production;

pub use audit::{AuditAction, AuditEntity, AuditEvent};
pub use genealogy::{
    AffectedOrder, LineageGraph, LineageNode, LotLineage, PickWithOrder, RecallQuery,
    RecallReport, TraceDirection, TraceEvent, TraceEventKind,
};
pub use lot::{
    ExpiryOutcome, FifoKey, InventoryLot, LotOutcome, LotState, NewLot, ReceiveLotInput,
};
pub use order::{
    AllocationOutcome, CreateOrderInput, CreateOrderItemInput, ItemPickSummary, NewAllocation,
    NewPick, Order, OrderAllocation, OrderItem, OrderOutcome, OrderPick, PickOutcome,
    PickProgress, UnshipOutcome,
};
pub use production::{
    ConversionOutcome, ConversionSource, ConvertInput, NewProductionRun, ProductionRun,
};
