//! Retention GC and orphan sweep.
//!
//! Runs once at startup, then periodically. Each cycle deletes expired
//! events in bounded batches, one write transaction per batch, and after
//! every batch sweeps the payload pool for rows the batch dereferenced.
//! The loop defers to the ingest writer rather than contending with it:
//! a batch only starts when the writer connection is free, and the task
//! yields between batches so queued messages keep landing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use sqlx::{Connection, SqliteConnection};
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::WriterState;
use crate::error::StoreError;

/// Events deleted per transaction. Each deleted row frees five payload
/// references, and the sweep binds one parameter per candidate id, so the
/// sweep's IN list stays at 750 parameters, comfortably under SQLite's
/// 999-variable limit.
const BATCH_SIZE: usize = 150;

/// Writer-lock deferral: 50 x 100 ms, then the cycle is skipped.
const BUSY_RETRIES: u32 = 50;
const BUSY_WAIT: Duration = Duration::from_millis(100);

/// Per-class retention windows, in days. 0 disables the class.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetentionPolicy {
    pub days_channel: u32,
    pub days_pm: u32,
}

/// The five payload references freed by one deleted event.
type FreedRefs = (i64, i64, i64, i64, i64);

#[derive(Clone, Copy)]
enum BufferClass {
    Channel,
    Pm,
}

/// Spawn the periodic cleanup task: one pass at startup, then one per
/// interval. Missed ticks are skipped, so passes never overlap.
pub(crate) fn spawn_cleanup_task(
    writer: Arc<Mutex<WriterState>>,
    policy: RetentionPolicy,
    interval_minutes: u64,
    active: Arc<AtomicBool>,
    shutdown: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown_rx = shutdown.subscribe();
        // Second subscription for the batch loop: the in-flight batch
        // finishes, but no new batch starts once shutdown is signalled.
        let mut stop = shutdown.subscribe();

        run_guarded(&writer, policy, &active, &mut stop).await;

        let mut interval =
            tokio::time::interval(Duration::from_secs(interval_minutes.max(1) * 60));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; the startup pass covered it.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    run_guarded(&writer, policy, &active, &mut stop).await;
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
    })
}

/// Run one cleanup cycle unless another is already in flight. Returns
/// whether this call ran the cycle.
pub(crate) async fn run_guarded(
    writer: &Mutex<WriterState>,
    policy: RetentionPolicy,
    active: &AtomicBool,
    stop: &mut broadcast::Receiver<()>,
) -> bool {
    if active
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!("Retention cleanup already running; tick dropped");
        return false;
    }

    crate::metrics::record_cleanup_start();
    let start = Instant::now();
    match run_pass(writer, policy, stop).await {
        Ok(rows) => {
            crate::metrics::record_cleanup_complete(rows, start.elapsed());
            if rows > 0 {
                info!(removed = rows, "Old messages pruned from history");
            }
        }
        Err(StoreError::WriterBusy) => {
            crate::metrics::record_cleanup_error();
            warn!("Writer stayed busy; skipping retention cycle");
        }
        Err(e) => {
            crate::metrics::record_cleanup_error();
            error!(error = %e, "Retention cleanup failed");
        }
    }

    active.store(false, Ordering::SeqCst);
    true
}

async fn run_pass(
    writer: &Mutex<WriterState>,
    policy: RetentionPolicy,
    stop: &mut broadcast::Receiver<()>,
) -> Result<u64, StoreError> {
    let mut total = 0u64;
    if policy.days_channel > 0 {
        total +=
            run_class(writer, cutoff_ms(policy.days_channel), BufferClass::Channel, stop).await?;
    }
    if policy.days_pm > 0 {
        total += run_class(writer, cutoff_ms(policy.days_pm), BufferClass::Pm, stop).await?;
    }
    Ok(total)
}

fn cutoff_ms(days: u32) -> i64 {
    Utc::now().timestamp_millis() - (days as i64) * 86_400_000
}

/// Delete expired events of one buffer class in batches until a batch
/// comes back short.
async fn run_class(
    writer: &Mutex<WriterState>,
    cutoff: i64,
    class: BufferClass,
    stop: &mut broadcast::Receiver<()>,
) -> Result<u64, StoreError> {
    let sql = delete_batch_sql(class);
    let mut total = 0u64;

    loop {
        if !matches!(stop.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
            debug!("Shutdown signalled; stopping retention after current batch");
            break;
        }

        let mut guard = acquire_writer(writer).await?;
        let WriterState { conn, cache } = &mut *guard;

        let mut tx = conn.begin().await?;
        let freed: Vec<FreedRefs> = sqlx::query_as(&sql)
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let deleted = freed.len();
        total += deleted as u64;

        if deleted > 0 {
            let mut candidates: Vec<i64> = freed
                .iter()
                .flat_map(|&(a, b, c, d, e)| [a, b, c, d, e])
                .collect();
            candidates.sort_unstable();
            candidates.dedup();

            match sweep_orphans(conn, &candidates).await {
                Ok(swept) if swept > 0 => {
                    // Any cached bytes -> id entry may now point at a deleted
                    // row; drop them all.
                    cache.clear();
                    debug!(swept, "Unreferenced payloads removed");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Orphan sweep failed; orphans retried next cycle");
                }
            }
        }

        drop(guard);
        tokio::task::yield_now().await;

        if deleted < BATCH_SIZE {
            break;
        }
    }

    Ok(total)
}

/// Batched delete of expired events of one class, returning the payload
/// references each deleted row held. Class membership is decided by the
/// leading byte of the buffer-name payload: `#`/`&` is a channel, anything
/// else a PM.
fn delete_batch_sql(class: BufferClass) -> String {
    let negate = match class {
        BufferClass::Channel => "",
        BufferClass::Pm => "NOT ",
    };
    format!(
        r#"
        DELETE FROM events
        WHERE rowid IN (
            SELECT rowid FROM events
            WHERE time < ?
              AND buffer_ref {negate}IN (
                SELECT id FROM payloads WHERE substr(bytes, 1, 1) IN (x'23', x'26')
              )
            LIMIT {BATCH_SIZE}
        )
        RETURNING buffer_ref, tags_ref, data_ref, prefix_ref, params_ref
        "#
    )
}

/// Delete candidate payloads that no event references any more, in one
/// write transaction. The reference check is a UNION ALL of one probe per
/// reference column so each probe rides its own index; EXISTS stops at the
/// first hit.
async fn sweep_orphans(
    conn: &mut SqliteConnection,
    candidates: &[i64],
) -> Result<u64, StoreError> {
    let placeholders = vec!["?"; candidates.len()].join(", ");
    let sql = format!(
        r#"
        DELETE FROM payloads
        WHERE id IN ({placeholders})
          AND NOT EXISTS (
            SELECT 1 FROM events WHERE buffer_ref = payloads.id
            UNION ALL SELECT 1 FROM events WHERE tags_ref = payloads.id
            UNION ALL SELECT 1 FROM events WHERE data_ref = payloads.id
            UNION ALL SELECT 1 FROM events WHERE prefix_ref = payloads.id
            UNION ALL SELECT 1 FROM events WHERE params_ref = payloads.id
          )
        "#
    );

    let mut tx = conn.begin().await?;
    let mut query = sqlx::query(&sql);
    for id in candidates {
        query = query.bind(*id);
    }
    let result = query.execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}

/// Take the writer lock without contending with an in-flight transaction:
/// poll, back off 100 ms, and give up after the deferral window.
async fn acquire_writer(
    writer: &Mutex<WriterState>,
) -> Result<MutexGuard<'_, WriterState>, StoreError> {
    for _ in 0..BUSY_RETRIES {
        if let Ok(guard) = writer.try_lock() {
            return Ok(guard);
        }
        tokio::time::sleep(BUSY_WAIT).await;
    }
    Err(StoreError::WriterBusy)
}
