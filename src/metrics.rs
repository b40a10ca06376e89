//! Store metrics.
//!
//! Emitted through the `metrics` facade; the host application installs
//! whatever recorder/exporter it wants. Names are part of the store's
//! contract:
//!
//! - `messages.store.time` - persist latency per event (histogram, seconds)
//! - `messages.lookup.time` - history query latency (histogram, seconds)
//! - `messages.retention.cleanup.runs` - cleanup cycles started (counter)
//! - `messages.retention.cleanup.errors` - failed cleanup cycles (counter)
//! - `messages.retention.cleanup.rows_deleted` - rows deleted by the last cycle (gauge)
//! - `messages.retention.cleanup.duration_ms` - duration of the last cycle (gauge)

use std::time::Duration;

use ::metrics::{counter, gauge, histogram};

pub const STORE_TIME: &str = "messages.store.time";
pub const LOOKUP_TIME: &str = "messages.lookup.time";
pub const CLEANUP_RUNS: &str = "messages.retention.cleanup.runs";
pub const CLEANUP_ERRORS: &str = "messages.retention.cleanup.errors";
pub const CLEANUP_ROWS_DELETED: &str = "messages.retention.cleanup.rows_deleted";
pub const CLEANUP_DURATION_MS: &str = "messages.retention.cleanup.duration_ms";

/// Record the persist latency of one stored event.
#[inline]
pub fn record_store(duration: Duration) {
    histogram!(STORE_TIME).record(duration.as_secs_f64());
}

/// Record the latency of one history query.
#[inline]
pub fn record_lookup(duration: Duration) {
    histogram!(LOOKUP_TIME).record(duration.as_secs_f64());
}

/// Record the start of a cleanup cycle.
#[inline]
pub fn record_cleanup_start() {
    counter!(CLEANUP_RUNS).increment(1);
}

/// Record the outcome of a completed cleanup cycle.
#[inline]
pub fn record_cleanup_complete(rows_deleted: u64, duration: Duration) {
    gauge!(CLEANUP_ROWS_DELETED).set(rows_deleted as f64);
    gauge!(CLEANUP_DURATION_MS).set(duration.as_millis() as f64);
}

/// Record a failed cleanup cycle.
#[inline]
pub fn record_cleanup_error() {
    counter!(CLEANUP_ERRORS).increment(1);
}
