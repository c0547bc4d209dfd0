//! Stock ledger and admission controller.
//!
//! The [`ledger`] holds the relational source of truth for each product's
//! stock buckets. The [`admission`] controller sits in front of it in the
//! cache tier and absorbs burst demand against per-SKU snapshots, so only
//! admitted preorders ever reach a ledger row.

pub mod admission;
pub mod error;
pub mod ledger;
pub mod service;

pub use admission::{
    AdmissionController, AdmissionItem, AdmissionStore, Epoch, EpochMinter, EpochSnapshot,
    GrantOutcome, InMemoryAdmissionStore, RedisAdmissionStore, ReturnReport, SnapshotState, Ticket,
    TicketItem,
};
pub use error::{InventoryError, Result};
pub use ledger::{
    AuditEntry, AuditStatus, InMemoryStockLedger, LedgerOp, LedgerOutcome, PostgresStockLedger,
    StockLedger, StockRecord,
};
pub use service::InventoryService;
