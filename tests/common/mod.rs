//! Shared fixtures for history store integration tests.

#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, Utc};
use slirc_history::{HistoryConfig, Message, MessageStore, StoreContext, Tag};
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use tempfile::TempDir;

pub fn db_path(dir: &TempDir) -> String {
    dir.path().join("history.db").to_string_lossy().into_owned()
}

pub async fn open_store(dir: &TempDir) -> Result<MessageStore> {
    open_store_with_retention(dir, 0, 0).await
}

pub async fn open_store_with_retention(
    dir: &TempDir,
    channel_days: u32,
    pm_days: u32,
) -> Result<MessageStore> {
    let config = HistoryConfig {
        database: db_path(dir),
        retention_days_channel: channel_days,
        retention_days_pm: pm_days,
        ..HistoryConfig::default()
    };
    Ok(MessageStore::open(&config).await?)
}

pub fn ctx() -> StoreContext {
    StoreContext {
        user_id: 1,
        network_id: 1,
        nick: "me".into(),
    }
}

/// PRIVMSG from `alice` with no tags.
pub fn privmsg(target: &str, text: &str) -> Message {
    Message {
        tags: Vec::new(),
        prefix: Some("alice!u@irc.example.net".into()),
        command: "PRIVMSG".into(),
        params: vec![target.into(), text.into()],
    }
}

pub fn with_tag(mut msg: Message, key: &str, value: &str) -> Message {
    msg.tags.push(Tag::new(key, Some(value)));
    msg
}

pub fn with_msgid(msg: Message, msgid: &str) -> Message {
    with_tag(msg, "msgid", msgid)
}

pub fn with_time(msg: Message, time_ms: i64) -> Message {
    let iso = iso(time_ms);
    with_tag(msg, "time", &iso)
}

pub fn iso(time_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(time_ms)
        .unwrap()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Open a second connection to the database for table-level assertions.
pub async fn raw_pool(dir: &TempDir) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new().filename(db_path(dir));
    Ok(SqlitePool::connect_with(options).await?)
}

pub async fn count_events(pool: &SqlitePool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

pub async fn count_payloads(pool: &SqlitePool, bytes: &[u8]) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM payloads WHERE bytes = ?")
        .bind(bytes)
        .fetch_one(pool)
        .await?;
    Ok(n)
}

pub async fn payload_id(pool: &SqlitePool, bytes: &[u8]) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM payloads WHERE bytes = ?")
        .bind(bytes)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(id,)| id))
}

/// Payload rows no event references from any slot.
pub async fn count_orphan_payloads(pool: &SqlitePool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM payloads
        WHERE NOT EXISTS (
            SELECT 1 FROM events WHERE buffer_ref = payloads.id
            UNION ALL SELECT 1 FROM events WHERE tags_ref = payloads.id
            UNION ALL SELECT 1 FROM events WHERE data_ref = payloads.id
            UNION ALL SELECT 1 FROM events WHERE prefix_ref = payloads.id
            UNION ALL SELECT 1 FROM events WHERE params_ref = payloads.id
        )
        "#,
    )
    .fetch_one(pool)
    .await?;
    Ok(n)
}

/// Event rows with at least one reference that no longer resolves.
pub async fn count_dangling_refs(pool: &SqlitePool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM events e
        WHERE NOT EXISTS (SELECT 1 FROM payloads WHERE id = e.buffer_ref)
           OR NOT EXISTS (SELECT 1 FROM payloads WHERE id = e.tags_ref)
           OR NOT EXISTS (SELECT 1 FROM payloads WHERE id = e.data_ref)
           OR NOT EXISTS (SELECT 1 FROM payloads WHERE id = e.prefix_ref)
           OR NOT EXISTS (SELECT 1 FROM payloads WHERE id = e.params_ref)
        "#,
    )
    .fetch_one(pool)
    .await?;
    Ok(n)
}
