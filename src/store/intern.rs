//! Content-addressed payload pool and its in-memory accelerator.
//!
//! Every distinct byte string referenced by an event (buffer name, tag
//! bundle, parameter vector, body, prefix) is interned into the `payloads`
//! table exactly once. The cache short-circuits the common case where the
//! bytes were seen recently; it is invalidated wholesale whenever the
//! orphan sweep deletes payload rows, so a cache hit always maps to a live
//! row.

use lru::LruCache;
use sqlx::{Sqlite, Transaction};

use crate::error::StoreError;

/// Summed key-byte budget for the dedup cache.
const CACHE_BUDGET_BYTES: usize = 50 * 1024 * 1024;

/// Bounded `bytes -> payload id` map with LRU eviction.
///
/// The bound is on the summed length of the cached keys, not the entry
/// count: tag bundles dominate and vary wildly in size.
pub(crate) struct PayloadCache {
    entries: LruCache<Vec<u8>, i64>,
    bytes: usize,
    budget: usize,
}

impl PayloadCache {
    pub(crate) fn new() -> Self {
        Self::with_budget(CACHE_BUDGET_BYTES)
    }

    fn with_budget(budget: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            bytes: 0,
            budget,
        }
    }

    pub(crate) fn get(&mut self, bytes: &[u8]) -> Option<i64> {
        self.entries.get(bytes).copied()
    }

    pub(crate) fn insert(&mut self, bytes: Vec<u8>, id: i64) {
        if bytes.len() > self.budget || self.entries.contains(bytes.as_slice()) {
            return;
        }
        self.bytes += bytes.len();
        self.entries.push(bytes, id);
        while self.bytes > self.budget {
            match self.entries.pop_lru() {
                Some((evicted, _)) => self.bytes -= evicted.len(),
                None => break,
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Intern `bytes` into the payload pool, returning its stable id.
///
/// Runs inside the caller's write transaction. The uniqueness rejection on
/// a duplicate insert is expected and swallowed; the id is read back either
/// way. Freshly resolved ids are staged rather than written to the cache
/// directly, so a rolled-back transaction cannot leave the cache pointing
/// at rows that were never committed.
pub(crate) async fn intern(
    tx: &mut Transaction<'_, Sqlite>,
    cache: &mut PayloadCache,
    staged: &mut Vec<(Vec<u8>, i64)>,
    bytes: &[u8],
) -> Result<i64, StoreError> {
    if let Some(id) = cache.get(bytes) {
        return Ok(id);
    }

    sqlx::query("INSERT OR IGNORE INTO payloads (bytes) VALUES (?)")
        .bind(bytes)
        .execute(&mut **tx)
        .await?;

    let (id,): (i64,) = sqlx::query_as("SELECT id FROM payloads WHERE bytes = ?")
        .bind(bytes)
        .fetch_one(&mut **tx)
        .await?;

    staged.push((bytes.to_vec(), id));
    Ok(id)
}
