//! Range queries over the event log.
//!
//! All five forms return events in ascending time order (ties broken by
//! insertion order). The backward-looking forms scan descending under the
//! `(user_id, buffer_ref, time)` index and reverse the page, so "the N
//! events up to a cursor" is the N *nearest* ones. Every row is joined
//! against the payload pool to materialise the five referenced byte
//! strings.

use sqlx::SqlitePool;

use super::types::{EventRow, QueryBound, StoredEvent, rows_to_events};
use crate::error::StoreError;

/// Shared join/filter prelude. Buffer comparison is byte-exact; a buffer
/// whose name was never interned matches nothing.
const SELECT_EVENTS: &str = r#"
    SELECT e.user_id, e.network_id, b.bytes, e.time, e.kind, e.msgid,
           t.bytes, d.bytes, x.bytes, p.bytes
    FROM events e
    JOIN payloads b ON b.id = e.buffer_ref
    JOIN payloads t ON t.id = e.tags_ref
    JOIN payloads d ON d.id = e.data_ref
    JOIN payloads x ON x.id = e.prefix_ref
    JOIN payloads p ON p.id = e.params_ref
    WHERE e.user_id = ? AND e.network_id = ?
      AND e.buffer_ref = (SELECT id FROM payloads WHERE bytes = ?)
"#;

/// Events strictly after `after_ms`, oldest first.
pub(crate) async fn from_time(
    pool: &SqlitePool,
    user_id: i64,
    network_id: i64,
    buffer: &str,
    after_ms: i64,
    limit: u32,
) -> Result<Vec<StoredEvent>, StoreError> {
    let sql = format!("{SELECT_EVENTS} AND e.time > ? ORDER BY e.time ASC, e.rowid ASC LIMIT ?");
    let rows: Vec<EventRow> = sqlx::query_as(&sql)
        .bind(user_id)
        .bind(network_id)
        .bind(buffer.as_bytes())
        .bind(after_ms)
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;
    Ok(rows_to_events(rows, false))
}

/// The `limit` events nearest to (and including) `before_ms`, oldest first.
pub(crate) async fn before_time(
    pool: &SqlitePool,
    user_id: i64,
    network_id: i64,
    buffer: &str,
    before_ms: i64,
    limit: u32,
) -> Result<Vec<StoredEvent>, StoreError> {
    let sql = format!("{SELECT_EVENTS} AND e.time <= ? ORDER BY e.time DESC, e.rowid DESC LIMIT ?");
    let rows: Vec<EventRow> = sqlx::query_as(&sql)
        .bind(user_id)
        .bind(network_id)
        .bind(buffer.as_bytes())
        .bind(before_ms)
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;
    Ok(rows_to_events(rows, true))
}

/// Events strictly after the event named by `msgid`. Unknown msgid yields
/// an empty result.
pub(crate) async fn from_msgid(
    pool: &SqlitePool,
    user_id: i64,
    network_id: i64,
    buffer: &str,
    msgid: &str,
    limit: u32,
) -> Result<Vec<StoredEvent>, StoreError> {
    match lookup_msgid_time(pool, user_id, network_id, buffer, msgid).await? {
        Some(anchor) => from_time(pool, user_id, network_id, buffer, anchor, limit).await,
        None => Ok(Vec::new()),
    }
}

/// Events up to and including the event named by `msgid`. Unknown msgid
/// yields an empty result.
pub(crate) async fn before_msgid(
    pool: &SqlitePool,
    user_id: i64,
    network_id: i64,
    buffer: &str,
    msgid: &str,
    limit: u32,
) -> Result<Vec<StoredEvent>, StoreError> {
    match lookup_msgid_time(pool, user_id, network_id, buffer, msgid).await? {
        Some(anchor) => before_time(pool, user_id, network_id, buffer, anchor, limit).await,
        None => Ok(Vec::new()),
    }
}

/// Events in `[from, to)`, newest page, oldest first. Omitted endpoints
/// leave that side unbounded, so a fully open range is "the most recent
/// `limit` events".
pub(crate) async fn between(
    pool: &SqlitePool,
    user_id: i64,
    network_id: i64,
    buffer: &str,
    from: Option<QueryBound>,
    to: Option<QueryBound>,
    limit: u32,
) -> Result<Vec<StoredEvent>, StoreError> {
    let from_ms = match resolve_bound(pool, user_id, network_id, buffer, from).await? {
        Resolved::Time(t) => t,
        Resolved::UnknownMsgid => return Ok(Vec::new()),
    };
    let to_ms = match resolve_bound(pool, user_id, network_id, buffer, to).await? {
        Resolved::Time(t) => t,
        Resolved::UnknownMsgid => return Ok(Vec::new()),
    };

    let mut sql = String::from(SELECT_EVENTS);
    if from_ms.is_some() {
        sql.push_str(" AND e.time >= ?");
    }
    if to_ms.is_some() {
        sql.push_str(" AND e.time < ?");
    }
    sql.push_str(" ORDER BY e.time DESC, e.rowid DESC LIMIT ?");

    let mut query = sqlx::query_as::<_, EventRow>(&sql)
        .bind(user_id)
        .bind(network_id)
        .bind(buffer.as_bytes());
    if let Some(t) = from_ms {
        query = query.bind(t);
    }
    if let Some(t) = to_ms {
        query = query.bind(t);
    }
    let rows = query.bind(limit as i64).fetch_all(pool).await?;
    Ok(rows_to_events(rows, true))
}

enum Resolved {
    Time(Option<i64>),
    UnknownMsgid,
}

async fn resolve_bound(
    pool: &SqlitePool,
    user_id: i64,
    network_id: i64,
    buffer: &str,
    bound: Option<QueryBound>,
) -> Result<Resolved, StoreError> {
    match bound {
        None => Ok(Resolved::Time(None)),
        Some(QueryBound::Timestamp(t)) => Ok(Resolved::Time(Some(t))),
        Some(QueryBound::Msgid(msgid)) => {
            match lookup_msgid_time(pool, user_id, network_id, buffer, &msgid).await? {
                Some(t) => Ok(Resolved::Time(Some(t))),
                None => Ok(Resolved::UnknownMsgid),
            }
        }
    }
}

/// Time of the first event carrying `msgid` in this buffer. Duplicate
/// msgids are possible (client retries); the first index hit wins, which is
/// stable for a given database state.
pub(crate) async fn lookup_msgid_time(
    pool: &SqlitePool,
    user_id: i64,
    network_id: i64,
    buffer: &str,
    msgid: &str,
) -> Result<Option<i64>, StoreError> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT time FROM events
        WHERE user_id = ? AND network_id = ? AND msgid = ?
          AND buffer_ref = (SELECT id FROM payloads WHERE bytes = ?)
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .bind(network_id)
    .bind(msgid)
    .bind(buffer.as_bytes())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(t,)| t))
}
