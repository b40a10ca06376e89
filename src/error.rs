//! Unified error handling for the history store.

use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    /// The writer connection stayed busy for the whole deferral window.
    /// Raised by the retention loop; the cycle is skipped and retried on
    /// the next tick.
    #[error("writer busy: deferral window exhausted")]
    WriterBusy,
}
