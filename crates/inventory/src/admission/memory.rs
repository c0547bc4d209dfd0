use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Clock, PreorderId, ProductId, SystemClock};
use tokio::sync::Mutex;

use super::{
    AdmissionItem, AdmissionStore, Epoch, EpochSnapshot, GrantOutcome, ReturnReport,
    SnapshotState, Ticket, TicketItem, select_returned,
};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct Counters {
    threshold: i64,
    issued: i64,
}

#[derive(Default)]
struct KeySpace {
    pointers: HashMap<ProductId, Epoch>,
    counters: HashMap<(ProductId, Epoch), Counters>,
    tickets: HashMap<PreorderId, (Ticket, DateTime<Utc>)>,
}

impl KeySpace {
    fn live_ticket(&mut self, preorder_id: PreorderId, now: DateTime<Utc>) -> Option<&Ticket> {
        let expired = self
            .tickets
            .get(&preorder_id)
            .is_some_and(|(_, expires_at)| *expires_at <= now);
        if expired {
            self.tickets.remove(&preorder_id);
        }
        self.tickets.get(&preorder_id).map(|(ticket, _)| ticket)
    }
}

/// In-memory admission store.
///
/// One mutex guards the whole keyspace, so each trait call observes and
/// mutates it as a single atomic step, like a server-side script would.
/// Tickets expire by comparing against the injected clock.
#[derive(Clone)]
pub struct InMemoryAdmissionStore {
    keys: Arc<Mutex<KeySpace>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryAdmissionStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryAdmissionStore {
    /// Creates an empty store whose tickets expire against `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: Arc::new(Mutex::new(KeySpace::default())),
            clock,
        }
    }

    /// Drops the threshold of the live epoch while keeping the pointer,
    /// as a cache eviction would.
    pub async fn evict_threshold(&self, product_id: ProductId) {
        let mut keys = self.keys.lock().await;
        if let Some(epoch) = keys.pointers.get(&product_id).copied() {
            keys.counters.remove(&(product_id, epoch));
        }
    }
}

#[async_trait]
impl AdmissionStore for InMemoryAdmissionStore {
    async fn snapshot(&self, product_id: ProductId) -> Result<SnapshotState> {
        let keys = self.keys.lock().await;
        let Some(epoch) = keys.pointers.get(&product_id).copied() else {
            return Ok(SnapshotState::Missing);
        };
        Ok(match keys.counters.get(&(product_id, epoch)) {
            Some(c) => SnapshotState::Live(EpochSnapshot {
                epoch,
                threshold: c.threshold,
                issued: c.issued,
            }),
            None => SnapshotState::Orphaned(epoch),
        })
    }

    async fn install_epoch(
        &self,
        product_id: ProductId,
        expected_previous: Option<Epoch>,
        next: Epoch,
        threshold: i64,
    ) -> Result<Option<Epoch>> {
        let mut keys = self.keys.lock().await;
        let current = keys.pointers.get(&product_id).copied();
        if current != expected_previous {
            return Ok(current);
        }

        keys.counters.insert(
            (product_id, next),
            Counters {
                threshold,
                issued: 0,
            },
        );
        if let Some(previous) = expected_previous {
            keys.counters.remove(&(product_id, previous));
        }
        keys.pointers.insert(product_id, next);
        Ok(Some(next))
    }

    async fn grant(
        &self,
        preorder_id: PreorderId,
        items: &[TicketItem],
        ttl: Duration,
        issued_at: DateTime<Utc>,
    ) -> Result<GrantOutcome> {
        let now = self.clock.now();
        let mut keys = self.keys.lock().await;

        if keys.live_ticket(preorder_id, now).is_some() {
            return Ok(GrantOutcome::Duplicate);
        }

        for item in items {
            let Some(c) = keys.counters.get(&(item.product_id, item.epoch)) else {
                return Ok(GrantOutcome::StaleEpoch(item.product_id));
            };
            let remaining = c.threshold - c.issued;
            if item.quantity > remaining {
                return Ok(GrantOutcome::Insufficient {
                    product_id: item.product_id,
                    epoch: item.epoch,
                    requested: item.quantity,
                    remaining: remaining.max(0),
                });
            }
        }

        for item in items {
            if let Some(c) = keys.counters.get_mut(&(item.product_id, item.epoch)) {
                c.issued += item.quantity;
            }
        }

        let ticket = Ticket {
            preorder_id,
            issued_at,
            items: items.to_vec(),
        };
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        keys.tickets.insert(preorder_id, (ticket.clone(), now + ttl));
        Ok(GrantOutcome::Granted(ticket))
    }

    async fn read_ticket(&self, preorder_id: PreorderId, consume: bool) -> Result<Option<Ticket>> {
        let now = self.clock.now();
        let mut keys = self.keys.lock().await;
        let ticket = keys.live_ticket(preorder_id, now).cloned();
        if consume {
            keys.tickets.remove(&preorder_id);
        }
        Ok(ticket)
    }

    async fn release(
        &self,
        preorder_id: PreorderId,
        items: &[AdmissionItem],
    ) -> Result<ReturnReport> {
        let now = self.clock.now();
        let mut keys = self.keys.lock().await;

        let Some(ticket) = keys.live_ticket(preorder_id, now).cloned() else {
            return Ok(ReturnReport::not_found(items.len()));
        };

        let (selected, missing) = select_returned(&ticket, items);
        let mut report = ReturnReport {
            restored: 0,
            skipped: missing,
            ticket_found: true,
        };
        for item in selected {
            match keys.counters.get_mut(&(item.product_id, item.epoch)) {
                Some(c) => {
                    c.issued = (c.issued - item.quantity).max(0);
                    report.restored += 1;
                }
                None => report.skipped += 1,
            }
        }
        keys.tickets.remove(&preorder_id);
        Ok(report)
    }

    async fn clear(&self, product_id: ProductId) -> Result<()> {
        let mut keys = self.keys.lock().await;
        if let Some(epoch) = keys.pointers.remove(&product_id) {
            keys.counters.remove(&(product_id, epoch));
        }
        Ok(())
    }
}
