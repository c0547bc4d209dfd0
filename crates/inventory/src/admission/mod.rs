//! Cache-resident admission control.
//!
//! Demand is gated against a per-SKU snapshot of the ledger's available stock
//! before it reaches the relational row. Each SKU has one live [`Epoch`]; the
//! epoch owns a `threshold` (stock at snapshot time) and an `issued` counter.
//! A grant is admitted only if `issued + quantity <= threshold` for every item
//! of the request, and all items are evaluated and incremented atomically.
//!
//! A granted preorder holds a [`Ticket`] recording the epoch each item was
//! counted against, so returns decrement the right counters even after the
//! SKU has moved to a newer epoch.

mod controller;
mod epoch;
mod memory;
mod redis;

pub use controller::AdmissionController;
pub use epoch::EpochMinter;
pub use memory::InMemoryAdmissionStore;
pub use redis::RedisAdmissionStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{PreorderId, ProductId};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Generation id of a SKU's admission snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(i64);

impl Epoch {
    /// Creates an epoch from its raw value.
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One requested line of an admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionItem {
    pub product_id: ProductId,
    pub quantity: i64,
}

impl AdmissionItem {
    /// Creates a request line.
    pub fn new(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            quantity,
        }
    }
}

/// One granted line of a ticket, pinned to the epoch it was counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketItem {
    pub product_id: ProductId,
    pub quantity: i64,
    pub epoch: Epoch,
}

/// Proof that a preorder was granted capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub preorder_id: PreorderId,
    pub issued_at: DateTime<Utc>,
    pub items: Vec<TicketItem>,
}

impl Ticket {
    /// Returns the granted line for a product, if any.
    pub fn item(&self, product_id: ProductId) -> Option<&TicketItem> {
        self.items.iter().find(|item| item.product_id == product_id)
    }
}

/// Counters of a live epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochSnapshot {
    pub epoch: Epoch,
    pub threshold: i64,
    pub issued: i64,
}

impl EpochSnapshot {
    /// Capacity still available in this epoch.
    pub fn remaining(&self) -> i64 {
        (self.threshold - self.issued).max(0)
    }
}

/// What the store knows about a SKU's admission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    /// No epoch pointer exists.
    Missing,
    /// The pointer names an epoch whose threshold is gone (evicted or never written).
    Orphaned(Epoch),
    /// The epoch is usable.
    Live(EpochSnapshot),
}

/// Result of an atomic multi-item grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    /// Every item fit; counters were incremented and the ticket written.
    Granted(Ticket),
    /// One item did not fit; nothing was mutated.
    Insufficient {
        product_id: ProductId,
        epoch: Epoch,
        requested: i64,
        remaining: i64,
    },
    /// The preorder already holds a ticket; nothing was mutated.
    Duplicate,
    /// The epoch resolved for this product is no longer live; nothing was mutated.
    StaleEpoch(ProductId),
}

/// Counts reported by a token return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnReport {
    /// Items whose capacity was given back to their epoch.
    pub restored: usize,
    /// Items that could not be restored (epoch rolled over, or not on the ticket).
    pub skipped: usize,
    /// Whether a live ticket was found.
    pub ticket_found: bool,
}

impl ReturnReport {
    /// Report for a return that found no live ticket.
    pub fn not_found(requested: usize) -> Self {
        Self {
            restored: 0,
            skipped: requested,
            ticket_found: false,
        }
    }

    /// Returns true if nothing was restored.
    pub fn is_noop(&self) -> bool {
        self.restored == 0
    }
}

/// Atomic primitives over the admission keyspace.
///
/// Every method is a single atomic step against the store; the controller
/// composes them.
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    /// Reads the current epoch pointer and its counters.
    async fn snapshot(&self, product_id: ProductId) -> Result<SnapshotState>;

    /// Installs `next` with `threshold` and `issued = 0` if the pointer still
    /// equals `expected_previous`, deleting the previous epoch's counters.
    ///
    /// Returns the epoch that is live afterwards: `next` on success, the
    /// winner's epoch if another refresh got there first.
    async fn install_epoch(
        &self,
        product_id: ProductId,
        expected_previous: Option<Epoch>,
        next: Epoch,
        threshold: i64,
    ) -> Result<Option<Epoch>>;

    /// Checks every item against its epoch and, only if all fit, increments
    /// the counters and writes the ticket with `ttl`.
    async fn grant(
        &self,
        preorder_id: PreorderId,
        items: &[TicketItem],
        ttl: Duration,
        issued_at: DateTime<Utc>,
    ) -> Result<GrantOutcome>;

    /// Reads the ticket, deleting it in the same step when `consume` is set.
    async fn read_ticket(&self, preorder_id: PreorderId, consume: bool) -> Result<Option<Ticket>>;

    /// Gives back the capacity of the requested items (all ticket items when
    /// `items` is empty) to the epochs recorded on the ticket and deletes the
    /// ticket. Does nothing if the ticket is gone.
    async fn release(
        &self,
        preorder_id: PreorderId,
        items: &[AdmissionItem],
    ) -> Result<ReturnReport>;

    /// Drops the SKU's epoch pointer and counters.
    async fn clear(&self, product_id: ProductId) -> Result<()>;
}

/// Selects the ticket lines a return applies to. Requested products missing
/// from the ticket are counted separately as skipped.
pub(crate) fn select_returned(
    ticket: &Ticket,
    items: &[AdmissionItem],
) -> (Vec<TicketItem>, usize) {
    if items.is_empty() {
        return (ticket.items.clone(), 0);
    }
    let mut selected: Vec<TicketItem> = Vec::with_capacity(items.len());
    let mut missing = 0;
    for item in items {
        if selected.iter().any(|s| s.product_id == item.product_id) {
            continue;
        }
        match ticket.item(item.product_id) {
            Some(granted) => selected.push(*granted),
            None => missing += 1,
        }
    }
    (selected, missing)
}
