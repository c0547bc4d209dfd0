//! Redis integration tests for the admission store scripts.
//!
//! These tests need a Docker daemon. Run with:
//!
//! ```bash
//! cargo test -p inventory --test redis_admission -- --ignored --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{PreorderId, ProductId};
use futures_util::future::join_all;
use inventory::{
    AdmissionStore, Epoch, GrantOutcome, RedisAdmissionStore, SnapshotState, TicketItem,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Redis>,
    url: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_test_store() -> RedisAdmissionStore {
    let info = CONTAINER
        .get_or_init(|| async {
            let container = Redis::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(6379).await.unwrap();
            Arc::new(ContainerInfo {
                container,
                url: format!("redis://{}:{}", host, port),
            })
        })
        .await
        .clone();

    let client = redis::Client::open(info.url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();

    RedisAdmissionStore::connect(&info.url).await.unwrap()
}

const SKU: ProductId = ProductId::new(900);
const TTL: Duration = Duration::from_secs(60);

fn line(quantity: i64, epoch: Epoch) -> TicketItem {
    TicketItem {
        product_id: SKU,
        quantity,
        epoch,
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn install_and_snapshot() {
    let store = get_test_store().await;
    assert_eq!(store.snapshot(SKU).await.unwrap(), SnapshotState::Missing);

    let epoch = Epoch::new(1_000);
    assert_eq!(
        store.install_epoch(SKU, None, epoch, 4).await.unwrap(),
        Some(epoch)
    );
    // A second installer that expected no epoch loses and learns the winner.
    assert_eq!(
        store
            .install_epoch(SKU, None, Epoch::new(1_001), 9)
            .await
            .unwrap(),
        Some(epoch)
    );

    let SnapshotState::Live(snapshot) = store.snapshot(SKU).await.unwrap() else {
        panic!("expected live epoch");
    };
    assert_eq!((snapshot.threshold, snapshot.issued), (4, 0));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn concurrent_grants_respect_threshold() {
    let store = get_test_store().await;
    let epoch = Epoch::new(2_000);
    store.install_epoch(SKU, None, epoch, 10).await.unwrap();

    let grants = (1..=20).map(|n| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .grant(PreorderId::new(n), &[line(1, epoch)], TTL, Utc::now())
                .await
        })
    });
    let granted = join_all(grants)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(GrantOutcome::Granted(_)))))
        .count();
    assert_eq!(granted, 10);

    let SnapshotState::Live(snapshot) = store.snapshot(SKU).await.unwrap() else {
        panic!("expected live epoch");
    };
    assert_eq!(snapshot.issued, 10);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn consume_and_release() {
    let store = get_test_store().await;
    let epoch = Epoch::new(3_000);
    store.install_epoch(SKU, None, epoch, 5).await.unwrap();

    let preorder = PreorderId::new(1);
    store
        .grant(preorder, &[line(2, epoch)], TTL, Utc::now())
        .await
        .unwrap();
    assert_eq!(
        store
            .grant(preorder, &[line(2, epoch)], TTL, Utc::now())
            .await
            .unwrap(),
        GrantOutcome::Duplicate
    );

    let report = store.release(preorder, &[]).await.unwrap();
    assert_eq!((report.restored, report.skipped), (1, 0));
    assert!(store.release(preorder, &[]).await.unwrap().is_noop());

    let other = PreorderId::new(2);
    store
        .grant(other, &[line(1, epoch)], TTL, Utc::now())
        .await
        .unwrap();
    assert!(store.read_ticket(other, true).await.unwrap().is_some());
    assert!(store.read_ticket(other, true).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn rollover_makes_grants_stale_and_returns_skipped() {
    let store = get_test_store().await;
    let old = Epoch::new(4_000);
    store.install_epoch(SKU, None, old, 5).await.unwrap();

    let preorder = PreorderId::new(1);
    store
        .grant(preorder, &[line(1, old)], TTL, Utc::now())
        .await
        .unwrap();

    let new = Epoch::new(4_001);
    store.install_epoch(SKU, Some(old), new, 5).await.unwrap();

    assert_eq!(
        store
            .grant(PreorderId::new(2), &[line(1, old)], TTL, Utc::now())
            .await
            .unwrap(),
        GrantOutcome::StaleEpoch(SKU)
    );
    let report = store.release(preorder, &[]).await.unwrap();
    assert_eq!((report.restored, report.skipped), (0, 1));
}
