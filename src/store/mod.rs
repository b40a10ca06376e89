//! Persistent message store.
//!
//! One SQLite file holds two tables: an append-only event log and a
//! content-addressed payload pool the log references by id. Ingest is
//! serialized through a single writer connection; queries run on a small
//! read pool (WAL readers coexist with the writer); retention and the
//! orphan sweep share the writer connection and defer to ingest.

mod ingest;
mod intern;
mod queries;
mod retention;
mod types;

pub use types::{EventKind, QueryBound, StoredEvent};

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{ConnectOptions, SqliteConnection, SqlitePool};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::HistoryConfig;
use crate::error::StoreError;
use crate::message::{Message, Source, StoreContext};
use ingest::IngestItem;
use intern::PayloadCache;
use retention::RetentionPolicy;

/// Events returned by a query when the caller gives no limit.
pub const DEFAULT_QUERY_LIMIT: u32 = 50;

/// The single writer connection and the dedup cache it feeds.
///
/// One lock guards both: holding it is exactly what "a write transaction
/// may be open" means to the retention loop's `try_lock` probe, and the
/// cache can only drift from the pool while that same lock is held.
pub(crate) struct WriterState {
    pub(crate) conn: SqliteConnection,
    pub(crate) cache: PayloadCache,
}

/// Handle to the message store. Cheap to clone; all clones share the same
/// writer, queue, and background tasks.
#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
    writer: Arc<Mutex<WriterState>>,
    ingest_tx: mpsc::UnboundedSender<IngestItem>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    cleanup_active: Arc<AtomicBool>,
    policy: RetentionPolicy,
}

impl MessageStore {
    pub const SUPPORTS_READ: bool = true;
    pub const SUPPORTS_WRITE: bool = true;

    /// Transient lock absorption on every connection.
    const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Connection acquire timeout for the read pool.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Open or create the database, apply engine settings, bootstrap the
    /// schema, and start the ingest worker and retention timer.
    pub async fn open(config: &HistoryConfig) -> Result<Self, StoreError> {
        if let Some(parent) = Path::new(&config.database).parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            warn!(path = %parent.display(), error = %e, "Failed to create database directory");
        }

        let options = connect_options(config);
        let mut conn = options.connect().await?;
        run_migrations(&mut conn).await;

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Self::ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        info!(path = %config.database, "History database ready");

        let writer = Arc::new(Mutex::new(WriterState {
            conn,
            cache: PayloadCache::new(),
        }));
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let cleanup_active = Arc::new(AtomicBool::new(false));
        let policy = RetentionPolicy {
            days_channel: config.retention_days_channel,
            days_pm: config.retention_days_pm,
        };

        let mut tasks = vec![ingest::spawn_worker(Arc::clone(&writer), ingest_rx)];
        if config.retention_enabled() {
            tasks.push(retention::spawn_cleanup_task(
                Arc::clone(&writer),
                policy,
                config.retention_cleanup_interval,
                Arc::clone(&cleanup_active),
                shutdown_tx.clone(),
            ));
        }

        Ok(Self {
            pool,
            writer,
            ingest_tx,
            shutdown_tx,
            tasks: Arc::new(Mutex::new(tasks)),
            cleanup_active,
            policy,
        })
    }

    /// Enqueue a message for storage and return immediately.
    ///
    /// Messages that do not qualify (non-chat commands, CTCP queries other
    /// than ACTION, malformed lines) are dropped silently. Storage is
    /// best-effort from the producer's viewpoint: persistence errors are
    /// logged by the worker, never surfaced here.
    pub fn store(&self, msg: &Message, ctx: &StoreContext, source: Source) {
        let Some(event) = ingest::prepare(msg, ctx, source) else {
            return;
        };
        if self.ingest_tx.send(IngestItem::Event(event)).is_err() {
            warn!("Message arrived after store shutdown; dropped");
        }
    }

    /// Wait until everything enqueued so far has been persisted.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.ingest_tx.send(IngestItem::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Events strictly newer than the event named by `msgid`, oldest
    /// first. Unknown msgids yield an empty result.
    pub async fn query_from_msgid(
        &self,
        user_id: i64,
        network_id: i64,
        buffer: &str,
        msgid: &str,
        limit: Option<u32>,
    ) -> Vec<StoredEvent> {
        let start = Instant::now();
        let result = queries::from_msgid(
            &self.pool,
            user_id,
            network_id,
            buffer,
            msgid,
            effective_limit(limit),
        )
        .await;
        crate::metrics::record_lookup(start.elapsed());
        unwrap_query(result, "from_msgid")
    }

    /// Events strictly newer than `after_ms`, oldest first.
    pub async fn query_from_time(
        &self,
        user_id: i64,
        network_id: i64,
        buffer: &str,
        after_ms: i64,
        limit: Option<u32>,
    ) -> Vec<StoredEvent> {
        let start = Instant::now();
        let result = queries::from_time(
            &self.pool,
            user_id,
            network_id,
            buffer,
            after_ms,
            effective_limit(limit),
        )
        .await;
        crate::metrics::record_lookup(start.elapsed());
        unwrap_query(result, "from_time")
    }

    /// The `limit` events up to and including the event named by `msgid`,
    /// oldest first. Unknown msgids yield an empty result.
    pub async fn query_before_msgid(
        &self,
        user_id: i64,
        network_id: i64,
        buffer: &str,
        msgid: &str,
        limit: Option<u32>,
    ) -> Vec<StoredEvent> {
        let start = Instant::now();
        let result = queries::before_msgid(
            &self.pool,
            user_id,
            network_id,
            buffer,
            msgid,
            effective_limit(limit),
        )
        .await;
        crate::metrics::record_lookup(start.elapsed());
        unwrap_query(result, "before_msgid")
    }

    /// The `limit` events at or before `before_ms`, oldest first.
    pub async fn query_before_time(
        &self,
        user_id: i64,
        network_id: i64,
        buffer: &str,
        before_ms: i64,
        limit: Option<u32>,
    ) -> Vec<StoredEvent> {
        let start = Instant::now();
        let result = queries::before_time(
            &self.pool,
            user_id,
            network_id,
            buffer,
            before_ms,
            effective_limit(limit),
        )
        .await;
        crate::metrics::record_lookup(start.elapsed());
        unwrap_query(result, "before_time")
    }

    /// Events in `[from, to)`: `from` inclusive, `to` exclusive, each
    /// endpoint a timestamp or a msgid. With both endpoints omitted this
    /// is "the most recent `limit` events in the buffer".
    pub async fn query_between(
        &self,
        user_id: i64,
        network_id: i64,
        buffer: &str,
        from: Option<QueryBound>,
        to: Option<QueryBound>,
        limit: Option<u32>,
    ) -> Vec<StoredEvent> {
        let start = Instant::now();
        let result = queries::between(
            &self.pool,
            user_id,
            network_id,
            buffer,
            from,
            to,
            effective_limit(limit),
        )
        .await;
        crate::metrics::record_lookup(start.elapsed());
        unwrap_query(result, "between")
    }

    /// Run one retention pass now. The periodic timer uses the same path;
    /// if a pass is already in flight, this call waits it out and then
    /// runs its own.
    pub async fn run_retention(&self) {
        let mut stop = self.shutdown_tx.subscribe();
        while !retention::run_guarded(&self.writer, self.policy, &self.cleanup_active, &mut stop)
            .await
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Drain the ingest queue, stop the background tasks, and close the
    /// database. An in-flight retention batch is allowed to finish.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.ingest_tx.send(IngestItem::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
        let _ = self.shutdown_tx.send(());

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Store task ended abnormally");
            }
        }

        self.writer.lock().await.cache.clear();
        self.pool.close().await;
        info!("History store closed");
    }
}

fn effective_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_QUERY_LIMIT)
}

fn unwrap_query(result: Result<Vec<StoredEvent>, StoreError>, op: &str) -> Vec<StoredEvent> {
    match result {
        Ok(events) => events,
        Err(e) => {
            error!(error = %e, query = op, "History query failed");
            Vec::new()
        }
    }
}

fn connect_options(config: &HistoryConfig) -> SqliteConnectOptions {
    let mut options = SqliteConnectOptions::new()
        .filename(&config.database)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(MessageStore::BUSY_TIMEOUT)
        .pragma("cache_size", format!("-{}", config.cache_size_kb))
        .pragma("temp_store", "MEMORY");
    if config.mmap_size_bytes > 0 {
        options = options.pragma("mmap_size", config.mmap_size_bytes.to_string());
    }
    options
}

async fn table_exists(conn: &mut SqliteConnection, table: &str) -> bool {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?)",
    )
    .bind(table)
    .fetch_one(&mut *conn)
    .await
    .unwrap_or(false)
}

/// Schema bootstrap, gated for log cleanliness; the migration itself is
/// IF NOT EXISTS throughout.
async fn run_migrations(conn: &mut SqliteConnection) {
    let mut ready = true;
    for table in ["payloads", "events"] {
        if !table_exists(conn, table).await {
            ready = false;
            break;
        }
    }
    if ready {
        info!("Database already initialized");
        return;
    }

    run_migration_file(conn, include_str!("../../migrations/001_init.sql")).await;
    info!("Database migrations applied (001_init)");
}

/// Run a single migration file, executing each statement.
async fn run_migration_file(conn: &mut SqliteConnection, migration: &str) {
    for statement in migration.split(';') {
        let sql_lines: Vec<&str> = statement
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("--"))
            .collect();
        if sql_lines.is_empty() {
            continue;
        }
        let sql = sql_lines.join("\n");

        if let Err(e) = sqlx::query(&sql).execute(&mut *conn).await {
            if !e.to_string().contains("already exists") {
                warn!(sql = %sql, error = %e, "Migration statement failed");
            }
        }
    }
}
