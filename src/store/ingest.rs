//! Ingest pipeline: qualification, field derivation, and the serialized
//! single-writer queue.
//!
//! `store` calls derive a [`PendingEvent`] synchronously and push it onto an
//! unbounded FIFO; one worker task drains the queue and persists one event
//! per write transaction. The upstream IRC socket is the natural rate
//! limiter, so the queue never drops.

use std::sync::Arc;
use std::time::Instant;

use sqlx::Connection;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::error;

use super::WriterState;
use super::intern::intern;
use super::types::{EventKind, PendingEvent};
use crate::error::StoreError;
use crate::message::{Message, Source, StoreContext, canonical_tags, event_time};

/// CTCP delimiter byte framing PRIVMSG/NOTICE bodies.
const CTCP_DELIM: u8 = 0x01;

/// CTCP ACTION marker; `/me` actions are the one CTCP kind kept as chat.
const CTCP_ACTION: &[u8] = b"\x01ACTION";

/// Work items for the ingest worker.
pub(crate) enum IngestItem {
    Event(PendingEvent),
    /// Acknowledged once every earlier item has been persisted.
    Flush(oneshot::Sender<()>),
    /// Like `Flush`, but also stops the worker.
    Shutdown(oneshot::Sender<()>),
}

/// Derive a pending event from a parsed inbound message.
///
/// Returns `None` for anything the store does not keep: non-chat commands,
/// malformed messages without a target or body, and CTCP queries other than
/// ACTION. Dropping is silent; it is not an error from the producer's view.
pub(crate) fn prepare(msg: &Message, ctx: &StoreContext, source: Source) -> Option<PendingEvent> {
    let kind = match msg.command.as_str() {
        "PRIVMSG" => EventKind::Privmsg,
        "NOTICE" => EventKind::Notice,
        _ => return None,
    };
    if msg.params.len() < 2 {
        return None;
    }

    let data = msg.params.last()?.as_str();
    if is_filtered_ctcp(data) {
        return None;
    }

    let target = msg.params[0].as_str();
    let buffer = derive_buffer(target, msg, source);
    let params = msg.params[..msg.params.len() - 1].join(" ");
    let msgid = msg
        .tag("draft/msgid")
        .or_else(|| msg.tag("msgid"))
        .unwrap_or("")
        .to_string();
    let tags = canonical_tags(&msg.tags).ok()?;
    let prefix = match source {
        Source::Client => ctx.nick.clone(),
        Source::Upstream => msg.prefix_nick().unwrap_or("").to_string(),
    };

    Some(PendingEvent {
        user_id: ctx.user_id,
        network_id: ctx.network_id,
        buffer,
        time: event_time(msg),
        kind,
        msgid,
        tags,
        params,
        data: data.to_string(),
        prefix,
    })
}

/// CTCP bodies are dropped unless they are ACTION.
fn is_filtered_ctcp(data: &str) -> bool {
    let bytes = data.as_bytes();
    bytes.first() == Some(&CTCP_DELIM) && !bytes.starts_with(CTCP_ACTION)
}

/// Buffer name for the event: channels keep their literal name, a PM
/// resolves to the remote nick (the target when the local client sent it,
/// the sender otherwise).
fn derive_buffer(target: &str, msg: &Message, source: Source) -> String {
    if target.starts_with('#') || target.starts_with('&') {
        return target.to_string();
    }
    match source {
        Source::Client => target.to_string(),
        Source::Upstream => msg
            .prefix_nick()
            .filter(|nick| !nick.is_empty())
            .unwrap_or(target)
            .to_string(),
    }
}

/// Spawn the single ingest worker.
///
/// The worker yields between events so queries and the retention loop make
/// progress while a burst drains.
pub(crate) fn spawn_worker(
    writer: Arc<Mutex<WriterState>>,
    mut rx: mpsc::UnboundedReceiver<IngestItem>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                IngestItem::Event(event) => {
                    if let Err(e) = write_event(&writer, &event).await {
                        error!(error = %e, buffer = %event.buffer, "Failed to store message");
                    }
                    tokio::task::yield_now().await;
                }
                IngestItem::Flush(ack) => {
                    let _ = ack.send(());
                }
                IngestItem::Shutdown(ack) => {
                    let _ = ack.send(());
                    break;
                }
            }
        }
    })
}

/// Persist one event: all five interns plus the event insert execute inside
/// a single tracked write transaction.
async fn write_event(writer: &Mutex<WriterState>, event: &PendingEvent) -> Result<(), StoreError> {
    let mut guard = writer.lock().await;
    let WriterState { conn, cache } = &mut *guard;

    let start = Instant::now();
    let mut staged = Vec::with_capacity(5);
    let mut tx = conn.begin().await?;

    let buffer_ref = intern(&mut tx, cache, &mut staged, event.buffer.as_bytes()).await?;
    let tags_ref = intern(&mut tx, cache, &mut staged, event.tags.as_bytes()).await?;
    let data_ref = intern(&mut tx, cache, &mut staged, event.data.as_bytes()).await?;
    let prefix_ref = intern(&mut tx, cache, &mut staged, event.prefix.as_bytes()).await?;
    let params_ref = intern(&mut tx, cache, &mut staged, event.params.as_bytes()).await?;

    sqlx::query(
        r#"
        INSERT INTO events (user_id, network_id, buffer_ref, time, kind, msgid,
                            tags_ref, data_ref, prefix_ref, params_ref)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event.user_id)
    .bind(event.network_id)
    .bind(buffer_ref)
    .bind(event.time)
    .bind(event.kind as i64)
    .bind(&event.msgid)
    .bind(tags_ref)
    .bind(data_ref)
    .bind(prefix_ref)
    .bind(params_ref)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    // Only committed ids reach the cache.
    for (bytes, id) in staged {
        cache.insert(bytes, id);
    }

    crate::metrics::record_store(start.elapsed());
    Ok(())
}
