use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{Clock, PreorderId, ProductId};

use super::{
    AdmissionItem, AdmissionStore, Epoch, EpochMinter, GrantOutcome, ReturnReport, SnapshotState,
    Ticket, TicketItem,
};
use crate::error::{InventoryError, Result};
use crate::ledger::StockLedger;

const MAX_ATTEMPTS: usize = 3;

/// Gates demand against per-SKU epoch snapshots of the stock ledger.
///
/// The store is the sole admission authority; the ledger is only read when a
/// snapshot is missing or has to be rebuilt.
pub struct AdmissionController {
    store: Arc<dyn AdmissionStore>,
    ledger: Arc<dyn StockLedger>,
    minter: EpochMinter,
    clock: Arc<dyn Clock>,
    ticket_ttl: Duration,
}

impl AdmissionController {
    /// Creates a controller issuing tickets that live for `ticket_ttl`.
    pub fn new(
        store: Arc<dyn AdmissionStore>,
        ledger: Arc<dyn StockLedger>,
        clock: Arc<dyn Clock>,
        ticket_ttl: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            minter: EpochMinter::new(Arc::clone(&clock)),
            clock,
            ticket_ttl,
        }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn AdmissionStore> {
        &self.store
    }

    /// Grants capacity for every item of the request, or for none of them.
    ///
    /// Fails with [`InventoryError::InsufficientStock`] naming the first item
    /// that did not fit, or [`InventoryError::DuplicateTicket`] if the
    /// preorder already holds a ticket.
    #[tracing::instrument(skip(self, items), fields(items = items.len()))]
    pub async fn try_get_token(
        &self,
        preorder_id: PreorderId,
        items: &[AdmissionItem],
    ) -> Result<Ticket> {
        let merged = merge_items(preorder_id, items)?;

        let mut contended = merged[0].0;
        for attempt in 1..=MAX_ATTEMPTS {
            let mut lines = Vec::with_capacity(merged.len());
            for &(product_id, quantity) in &merged {
                lines.push(TicketItem {
                    product_id,
                    quantity,
                    epoch: self.resolve_epoch(product_id).await?,
                });
            }

            let outcome = self
                .store
                .grant(preorder_id, &lines, self.ticket_ttl, self.clock.now())
                .await?;

            match outcome {
                GrantOutcome::Granted(ticket) => {
                    metrics::counter!("admission_tokens_granted_total").increment(1);
                    tracing::debug!(%preorder_id, "Admission ticket granted");
                    return Ok(ticket);
                }
                GrantOutcome::Insufficient {
                    product_id,
                    epoch,
                    requested,
                    remaining,
                } => {
                    metrics::counter!("admission_tokens_rejected_total", "reason" => "insufficient")
                        .increment(1);
                    return Err(InventoryError::InsufficientStock {
                        product_id,
                        epoch,
                        requested,
                        remaining,
                    });
                }
                GrantOutcome::Duplicate => {
                    metrics::counter!("admission_tokens_rejected_total", "reason" => "duplicate")
                        .increment(1);
                    return Err(InventoryError::DuplicateTicket(preorder_id));
                }
                GrantOutcome::StaleEpoch(product_id) => {
                    tracing::debug!(%preorder_id, %product_id, attempt, "Epoch rolled over during grant");
                    contended = product_id;
                }
            }
        }

        tracing::warn!(%preorder_id, product_id = %contended, "Admission gave up after epoch contention");
        Err(InventoryError::EpochContention(contended))
    }

    /// Reads the preorder's ticket, atomically deleting it when `consume` is set.
    #[tracing::instrument(skip(self))]
    pub async fn check_token(&self, preorder_id: PreorderId, consume: bool) -> Result<Ticket> {
        self.store
            .read_ticket(preorder_id, consume)
            .await?
            .ok_or(InventoryError::TicketNotFound(preorder_id))
    }

    /// Returns the ticket's capacity to the epochs it was counted against.
    ///
    /// Never fails on a rolled-over epoch; such items are reported as skipped.
    #[tracing::instrument(skip(self, items))]
    pub async fn return_token(
        &self,
        preorder_id: PreorderId,
        items: &[AdmissionItem],
    ) -> Result<ReturnReport> {
        let report = self.store.release(preorder_id, items).await?;
        if report.ticket_found {
            tracing::debug!(
                %preorder_id,
                restored = report.restored,
                skipped = report.skipped,
                "Admission ticket returned"
            );
        } else {
            tracing::debug!(%preorder_id, "No live ticket to return");
        }
        Ok(report)
    }

    /// Rebuilds the SKU's snapshot from the ledger under a new epoch.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_snapshot(&self, product_id: ProductId) -> Result<Epoch> {
        let previous = match self.store.snapshot(product_id).await? {
            SnapshotState::Missing => None,
            SnapshotState::Orphaned(epoch) => Some(epoch),
            SnapshotState::Live(snapshot) => Some(snapshot.epoch),
        };
        self.resync(product_id, previous).await
    }

    /// Drops the SKU's admission state.
    pub async fn clear(&self, product_id: ProductId) -> Result<()> {
        self.store.clear(product_id).await
    }

    async fn resolve_epoch(&self, product_id: ProductId) -> Result<Epoch> {
        match self.store.snapshot(product_id).await? {
            SnapshotState::Live(snapshot) => Ok(snapshot.epoch),
            SnapshotState::Missing => self.resync(product_id, None).await,
            SnapshotState::Orphaned(epoch) => self.resync(product_id, Some(epoch)).await,
        }
    }

    async fn resync(&self, product_id: ProductId, previous: Option<Epoch>) -> Result<Epoch> {
        let record = self
            .ledger
            .get(product_id)
            .await?
            .ok_or(InventoryError::InventoryNotFound(product_id))?;

        let next = self.minter.mint(previous);
        let installed = self
            .store
            .install_epoch(product_id, previous, next, record.stock)
            .await?;

        match installed {
            Some(epoch) if epoch == next => {
                metrics::counter!("admission_resyncs_total").increment(1);
                tracing::info!(%product_id, %epoch, threshold = record.stock, "Admission snapshot installed");
                Ok(epoch)
            }
            // Lost the race to a concurrent refresh; the winner's epoch is live.
            Some(epoch) => Ok(epoch),
            None => Err(InventoryError::EpochContention(product_id)),
        }
    }
}

/// Validates the request and merges repeated SKUs, in SKU order.
fn merge_items(preorder_id: PreorderId, items: &[AdmissionItem]) -> Result<Vec<(ProductId, i64)>> {
    if items.is_empty() {
        return Err(InventoryError::EmptyRequest(preorder_id));
    }
    let mut merged = BTreeMap::new();
    for item in items {
        if item.quantity <= 0 {
            return Err(InventoryError::InvalidQuantity {
                product_id: item.product_id,
                quantity: item.quantity,
            });
        }
        *merged.entry(item.product_id).or_insert(0) += item.quantity;
    }
    Ok(merged.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{EpochSnapshot, InMemoryAdmissionStore};
    use crate::ledger::InMemoryStockLedger;
    use common::ManualClock;

    const SKU: ProductId = ProductId::new(42);

    struct Fixture {
        controller: AdmissionController,
        store: InMemoryAdmissionStore,
        ledger: InMemoryStockLedger,
    }

    async fn fixture(stock: i64) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let store = InMemoryAdmissionStore::new(Arc::clone(&clock));
        let ledger = InMemoryStockLedger::new();
        ledger.create(SKU, stock).await.unwrap();
        let controller = AdmissionController::new(
            Arc::new(store.clone()),
            Arc::new(ledger.clone()),
            clock,
            Duration::from_secs(3600),
        );
        Fixture {
            controller,
            store,
            ledger,
        }
    }

    async fn live(store: &InMemoryAdmissionStore) -> EpochSnapshot {
        match store.snapshot(SKU).await.unwrap() {
            SnapshotState::Live(snapshot) => snapshot,
            other => panic!("expected live epoch, got {other:?}"),
        }
    }

    #[test]
    fn merge_rejects_empty_and_non_positive() {
        assert!(matches!(
            merge_items(PreorderId::new(1), &[]),
            Err(InventoryError::EmptyRequest(_))
        ));
        assert!(matches!(
            merge_items(PreorderId::new(1), &[AdmissionItem::new(SKU, 0)]),
            Err(InventoryError::InvalidQuantity { .. })
        ));
    }

    #[test]
    fn merge_sums_repeated_skus() {
        let merged = merge_items(
            PreorderId::new(1),
            &[
                AdmissionItem::new(SKU, 1),
                AdmissionItem::new(ProductId::new(1), 4),
                AdmissionItem::new(SKU, 2),
            ],
        )
        .unwrap();
        assert_eq!(merged, vec![(ProductId::new(1), 4), (SKU, 3)]);
    }

    #[tokio::test]
    async fn first_request_resyncs_from_ledger() {
        let f = fixture(7).await;

        let ticket = f
            .controller
            .try_get_token(PreorderId::new(1), &[AdmissionItem::new(SKU, 7)])
            .await
            .unwrap();

        let snapshot = live(&f.store).await;
        assert_eq!(snapshot.threshold, 7);
        assert_eq!(snapshot.issued, 7);
        assert_eq!(ticket.items[0].epoch, snapshot.epoch);

        let rejected = f
            .controller
            .try_get_token(PreorderId::new(2), &[AdmissionItem::new(SKU, 1)])
            .await;
        assert!(matches!(
            rejected,
            Err(InventoryError::InsufficientStock { remaining: 0, .. })
        ));
    }

    #[tokio::test]
    async fn orphaned_epoch_is_rebuilt() {
        let f = fixture(4).await;
        f.controller.refresh_snapshot(SKU).await.unwrap();
        let before = live(&f.store).await.epoch;

        f.store.evict_threshold(SKU).await;
        f.controller
            .try_get_token(PreorderId::new(1), &[AdmissionItem::new(SKU, 1)])
            .await
            .unwrap();

        let after = live(&f.store).await;
        assert!(after.epoch > before);
        assert_eq!((after.threshold, after.issued), (4, 1));
    }

    #[tokio::test]
    async fn duplicate_request_is_distinct_error() {
        let f = fixture(5).await;
        let items = [AdmissionItem::new(SKU, 1)];
        f.controller
            .try_get_token(PreorderId::new(1), &items)
            .await
            .unwrap();

        let again = f.controller.try_get_token(PreorderId::new(1), &items).await;
        assert!(matches!(again, Err(InventoryError::DuplicateTicket(_))));
        assert_eq!(live(&f.store).await.issued, 1);
    }

    #[tokio::test]
    async fn unknown_product_is_not_found() {
        let f = fixture(5).await;
        let result = f
            .controller
            .try_get_token(PreorderId::new(1), &[AdmissionItem::new(ProductId::new(9), 1)])
            .await;
        assert!(matches!(result, Err(InventoryError::InventoryNotFound(_))));
    }

    #[tokio::test]
    async fn return_token_is_idempotent() {
        let f = fixture(5).await;
        let preorder = PreorderId::new(1);
        f.controller
            .try_get_token(preorder, &[AdmissionItem::new(SKU, 3)])
            .await
            .unwrap();

        let first = f.controller.return_token(preorder, &[]).await.unwrap();
        assert_eq!(first.restored, 1);
        let second = f.controller.return_token(preorder, &[]).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(live(&f.store).await.issued, 0);
    }

    #[tokio::test]
    async fn refresh_picks_up_ledger_changes() {
        let f = fixture(5).await;
        let preorder = PreorderId::new(1);
        f.controller
            .try_get_token(preorder, &[AdmissionItem::new(SKU, 2)])
            .await
            .unwrap();

        f.ledger.set_stock(SKU, 9).await.unwrap();
        f.controller.refresh_snapshot(SKU).await.unwrap();
        let snapshot = live(&f.store).await;
        assert_eq!((snapshot.threshold, snapshot.issued), (9, 0));

        let report = f.controller.return_token(preorder, &[]).await.unwrap();
        assert_eq!((report.restored, report.skipped), (0, 1));
    }

    #[tokio::test]
    async fn check_token_consumes_once() {
        let f = fixture(5).await;
        let preorder = PreorderId::new(1);
        f.controller
            .try_get_token(preorder, &[AdmissionItem::new(SKU, 1)])
            .await
            .unwrap();

        f.controller.check_token(preorder, false).await.unwrap();
        f.controller.check_token(preorder, true).await.unwrap();
        assert!(matches!(
            f.controller.check_token(preorder, true).await,
            Err(InventoryError::TicketNotFound(_))
        ));
    }
}
