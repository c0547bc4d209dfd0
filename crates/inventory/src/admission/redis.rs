use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{PreorderId, ProductId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use super::{
    AdmissionItem, AdmissionStore, Epoch, EpochSnapshot, GrantOutcome, ReturnReport,
    SnapshotState, Ticket, TicketItem, select_returned,
};
use crate::error::{InventoryError, Result};

// KEYS[1] ticket, then (threshold, issued) per item.
// ARGV[1] payload, ARGV[2] ttl seconds, then quantity per item.
// Returns {code, item index, remaining}: 0 ok, 1 duplicate, 2 stale, 3 insufficient.
static GRANT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 1 then
            return {1, 0, 0}
        end
        local n = (#KEYS - 1) / 2
        for i = 1, n do
            local threshold = redis.call('GET', KEYS[2 * i])
            if not threshold then
                return {2, i, 0}
            end
            local issued = tonumber(redis.call('GET', KEYS[2 * i + 1]) or '0')
            local remaining = tonumber(threshold) - issued
            if tonumber(ARGV[2 + i]) > remaining then
                return {3, i, remaining}
            end
        end
        for i = 1, n do
            redis.call('INCRBY', KEYS[2 * i + 1], ARGV[2 + i])
        end
        redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
        return {0, 0, 0}
        ",
    )
});

// KEYS[1] ticket.
static TAKE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local payload = redis.call('GET', KEYS[1])
        if payload then
            redis.call('DEL', KEYS[1])
        end
        return payload
        ",
    )
});

// KEYS[1] ticket, then issued per item. ARGV[1] expected payload, then quantity per item.
// Returns {restored, skipped}, or {0, -1} if the ticket is gone or was replaced.
static RELEASE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local current = redis.call('GET', KEYS[1])
        if (not current) or current ~= ARGV[1] then
            return {0, -1}
        end
        local restored, skipped = 0, 0
        for i = 2, #KEYS do
            if redis.call('EXISTS', KEYS[i]) == 1 then
                local left = redis.call('DECRBY', KEYS[i], ARGV[i])
                if left < 0 then
                    redis.call('SET', KEYS[i], 0)
                end
                restored = restored + 1
            else
                skipped = skipped + 1
            end
        end
        redis.call('DEL', KEYS[1])
        return {restored, skipped}
        ",
    )
});

// KEYS[1] pointer, KEYS[2..3] new threshold/issued, optional KEYS[4..5] old threshold/issued.
// ARGV[1] expected pointer ('' for none), ARGV[2] next epoch, ARGV[3] threshold.
// Returns the pointer value live afterwards.
static INSTALL: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local current = redis.call('GET', KEYS[1])
        if (current or '') ~= ARGV[1] then
            return current
        end
        redis.call('SET', KEYS[2], ARGV[3])
        redis.call('SET', KEYS[3], 0)
        if #KEYS > 3 then
            redis.call('DEL', KEYS[4], KEYS[5])
        end
        redis.call('SET', KEYS[1], ARGV[2])
        return ARGV[2]
        ",
    )
});

/// Redis-backed admission store.
///
/// Every multi-key step runs as one Lua script, so Redis executes it without
/// interleaving other clients' commands.
#[derive(Clone)]
pub struct RedisAdmissionStore {
    conn_manager: ConnectionManager,
}

impl RedisAdmissionStore {
    /// Connects to Redis at `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;
        Ok(Self { conn_manager })
    }

    /// Wraps an existing connection manager.
    pub fn new(conn_manager: ConnectionManager) -> Self {
        Self { conn_manager }
    }

    fn epoch_key(product_id: ProductId) -> String {
        format!("admission:epoch:{product_id}")
    }

    fn threshold_key(product_id: ProductId, epoch: Epoch) -> String {
        format!("admission:threshold:{product_id}:{epoch}")
    }

    fn issued_key(product_id: ProductId, epoch: Epoch) -> String {
        format!("admission:issued:{product_id}:{epoch}")
    }

    fn ticket_key(preorder_id: PreorderId) -> String {
        format!("admission:ticket:{preorder_id}")
    }

    fn decode_ticket(payload: Option<String>) -> Result<Option<Ticket>> {
        payload
            .map(|p| serde_json::from_str(&p).map_err(InventoryError::from))
            .transpose()
    }
}

#[async_trait]
impl AdmissionStore for RedisAdmissionStore {
    async fn snapshot(&self, product_id: ProductId) -> Result<SnapshotState> {
        let mut conn = self.conn_manager.clone();
        let pointer: Option<i64> = conn.get(Self::epoch_key(product_id)).await?;
        let Some(epoch) = pointer.map(Epoch::new) else {
            return Ok(SnapshotState::Missing);
        };

        let (threshold, issued): (Option<i64>, Option<i64>) = redis::cmd("MGET")
            .arg(Self::threshold_key(product_id, epoch))
            .arg(Self::issued_key(product_id, epoch))
            .query_async(&mut conn)
            .await?;

        Ok(match threshold {
            Some(threshold) => SnapshotState::Live(EpochSnapshot {
                epoch,
                threshold,
                issued: issued.unwrap_or(0),
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
        let mut conn = self.conn_manager.clone();
        let mut invocation = INSTALL.prepare_invoke();
        invocation
            .key(Self::epoch_key(product_id))
            .key(Self::threshold_key(product_id, next))
            .key(Self::issued_key(product_id, next));
        if let Some(previous) = expected_previous {
            invocation
                .key(Self::threshold_key(product_id, previous))
                .key(Self::issued_key(product_id, previous));
        }
        invocation
            .arg(expected_previous.map_or_else(String::new, |e| e.to_string()))
            .arg(next.get())
            .arg(threshold);

        let live: Option<i64> = invocation.invoke_async(&mut conn).await?;
        Ok(live.map(Epoch::new))
    }

    async fn grant(
        &self,
        preorder_id: PreorderId,
        items: &[TicketItem],
        ttl: Duration,
        issued_at: DateTime<Utc>,
    ) -> Result<GrantOutcome> {
        let ticket = Ticket {
            preorder_id,
            issued_at,
            items: items.to_vec(),
        };
        let payload = serde_json::to_string(&ticket)?;

        let mut invocation = GRANT.prepare_invoke();
        invocation.key(Self::ticket_key(preorder_id));
        for item in items {
            invocation
                .key(Self::threshold_key(item.product_id, item.epoch))
                .key(Self::issued_key(item.product_id, item.epoch));
        }
        invocation.arg(payload).arg(ttl.as_secs().max(1));
        for item in items {
            invocation.arg(item.quantity);
        }

        let mut conn = self.conn_manager.clone();
        let reply: (i64, usize, i64) = invocation.invoke_async(&mut conn).await?;

        let failed = |index: usize| {
            index
                .checked_sub(1)
                .and_then(|i| items.get(i))
                .copied()
                .ok_or_else(|| InventoryError::Corrupt(format!("grant script index {index}")))
        };

        match reply {
            (0, _, _) => Ok(GrantOutcome::Granted(ticket)),
            (1, _, _) => Ok(GrantOutcome::Duplicate),
            (2, index, _) => Ok(GrantOutcome::StaleEpoch(failed(index)?.product_id)),
            (3, index, remaining) => {
                let item = failed(index)?;
                Ok(GrantOutcome::Insufficient {
                    product_id: item.product_id,
                    epoch: item.epoch,
                    requested: item.quantity,
                    remaining: remaining.max(0),
                })
            }
            (code, _, _) => Err(InventoryError::Corrupt(format!("grant script code {code}"))),
        }
    }

    async fn read_ticket(&self, preorder_id: PreorderId, consume: bool) -> Result<Option<Ticket>> {
        let mut conn = self.conn_manager.clone();
        let key = Self::ticket_key(preorder_id);
        let payload: Option<String> = if consume {
            TAKE.key(key).invoke_async(&mut conn).await?
        } else {
            conn.get(key).await?
        };
        Self::decode_ticket(payload)
    }

    async fn release(
        &self,
        preorder_id: PreorderId,
        items: &[AdmissionItem],
    ) -> Result<ReturnReport> {
        let mut conn = self.conn_manager.clone();
        let key = Self::ticket_key(preorder_id);

        let payload: Option<String> = conn.get(&key).await?;
        let Some(payload) = payload else {
            return Ok(ReturnReport::not_found(items.len()));
        };
        let ticket: Ticket = serde_json::from_str(&payload)?;
        let (selected, missing) = select_returned(&ticket, items);

        let mut invocation = RELEASE.prepare_invoke();
        invocation.key(key).arg(payload);
        for item in &selected {
            invocation
                .key(Self::issued_key(item.product_id, item.epoch))
                .arg(item.quantity);
        }

        let (restored, skipped): (i64, i64) = invocation.invoke_async(&mut conn).await?;
        if skipped < 0 {
            return Ok(ReturnReport::not_found(items.len()));
        }
        Ok(ReturnReport {
            restored: usize::try_from(restored).unwrap_or(0),
            skipped: usize::try_from(skipped).unwrap_or(0) + missing,
            ticket_found: true,
        })
    }

    async fn clear(&self, product_id: ProductId) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let pointer_key = Self::epoch_key(product_id);
        let pointer: Option<i64> = conn.get(&pointer_key).await?;

        let mut keys = vec![pointer_key];
        if let Some(epoch) = pointer.map(Epoch::new) {
            keys.push(Self::threshold_key(product_id, epoch));
            keys.push(Self::issued_key(product_id, epoch));
        }
        let _: () = conn.del(keys).await?;
        Ok(())
    }
}
