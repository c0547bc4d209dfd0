//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::SagaConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `pretty` or `json` (default: `pretty`)
/// - `DATABASE_URL`: Postgres backends when set, in-memory otherwise
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `10`)
/// - `REDIS_URL`: Redis admission store when set, in-memory otherwise
/// - `NODE_ID`: id generator node (default: `1`)
/// - `TICKET_TTL_SECS`, `PREORDER_TTL_SECS`, `ORDER_TTL_SECS`,
///   `PAYMENT_TTL_SECS`: lifetimes (defaults: 7200, 900, 1800, 600)
/// - `DELAY_POLL_MS`: delay worker poll interval (default: `500`)
/// - `OUTBOX_RECOVERY_SECS`: half message sweep interval (default: `5`)
/// - `EXPIRY_SWEEP_SECS`: overdue preorder and order sweep interval (default: `60`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
    pub node_id: u16,
    pub ticket_ttl: Duration,
    pub preorder_ttl: Duration,
    pub order_ttl: Duration,
    pub payment_ttl: Duration,
    pub delay_poll: Duration,
    pub outbox_recovery: Duration,
    pub expiry_sweep: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults for
    /// missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let secs = |key: &str, default: Duration| parsed(key).map_or(default, Duration::from_secs);

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            database_url: lookup("DATABASE_URL").filter(|u| !u.is_empty()),
            database_max_connections: lookup("DATABASE_MAX_CONNECTIONS")
                .and_then(|n| n.parse().ok())
                .unwrap_or(defaults.database_max_connections),
            redis_url: lookup("REDIS_URL").filter(|u| !u.is_empty()),
            node_id: lookup("NODE_ID")
                .and_then(|n| n.parse().ok())
                .unwrap_or(defaults.node_id),
            ticket_ttl: secs("TICKET_TTL_SECS", defaults.ticket_ttl),
            preorder_ttl: secs("PREORDER_TTL_SECS", defaults.preorder_ttl),
            order_ttl: secs("ORDER_TTL_SECS", defaults.order_ttl),
            payment_ttl: secs("PAYMENT_TTL_SECS", defaults.payment_ttl),
            delay_poll: parsed("DELAY_POLL_MS").map_or(defaults.delay_poll, Duration::from_millis),
            outbox_recovery: secs("OUTBOX_RECOVERY_SECS", defaults.outbox_recovery),
            expiry_sweep: secs("EXPIRY_SWEEP_SECS", defaults.expiry_sweep),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the saga settings.
    pub fn saga(&self) -> SagaConfig {
        SagaConfig {
            node_id: self.node_id,
            preorder_ttl: to_chrono(self.preorder_ttl),
            order_ttl: to_chrono(self.order_ttl),
            payment_ttl: to_chrono(self.payment_ttl),
        }
    }

    /// Warns about lifetimes that let a ticket expire before its order can be paid.
    pub fn check(&self) {
        let window = self.preorder_ttl + self.order_ttl;
        if self.ticket_ttl < window {
            tracing::warn!(
                ticket_ttl_secs = self.ticket_ttl.as_secs(),
                window_secs = window.as_secs(),
                "Ticket TTL is shorter than the preorder and order windows"
            );
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            database_max_connections: 10,
            redis_url: None,
            node_id: 1,
            ticket_ttl: Duration::from_secs(7200),
            preorder_ttl: Duration::from_secs(900),
            order_ttl: Duration::from_secs(1800),
            payment_ttl: Duration::from_secs(600),
            delay_poll: Duration::from_millis(500),
            outbox_recovery: Duration::from_secs(5),
            expiry_sweep: Duration::from_secs(60),
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
