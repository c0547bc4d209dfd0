//! Startup errors.

use thiserror::Error;

/// Errors raised while wiring the backends.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not connect to Postgres.
    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migrations failed.
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Could not connect to the admission cache.
    #[error("Admission store unavailable: {0}")]
    Admission(#[from] inventory::InventoryError),
}
