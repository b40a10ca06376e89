//! Type definitions for the message store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Kind of a stored chat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Privmsg = 1,
    Notice = 2,
}

impl EventKind {
    pub(crate) fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Privmsg),
            2 => Some(Self::Notice),
            _ => None,
        }
    }

    /// The IRC command name for this kind.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Privmsg => "PRIVMSG",
            Self::Notice => "NOTICE",
        }
    }
}

/// One endpoint of a [`query_between`](crate::MessageStore::query_between)
/// range: either a millisecond timestamp or a message id to anchor on.
#[derive(Debug, Clone)]
pub enum QueryBound {
    Timestamp(i64),
    Msgid(String),
}

/// A derived event waiting in the ingest queue.
#[derive(Debug)]
pub(crate) struct PendingEvent {
    pub user_id: i64,
    pub network_id: i64,
    pub buffer: String,
    pub time: i64,
    pub kind: EventKind,
    pub msgid: String,
    /// Canonical JSON of the tag map.
    pub tags: String,
    /// Leading parameters, space-joined.
    pub params: String,
    /// Trailing parameter (message body).
    pub data: String,
    /// Sender nick.
    pub prefix: String,
}

/// Row type from the event/payload join:
/// (user_id, network_id, buffer, time, kind, msgid, tags, data, prefix, params)
pub(crate) type EventRow = (
    i64,
    i64,
    Vec<u8>,
    i64,
    i64,
    String,
    Vec<u8>,
    Vec<u8>,
    Vec<u8>,
    Vec<u8>,
);

/// A materialised event returned by the query engine, with all payload
/// references resolved to their bytes.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub user_id: i64,
    pub network_id: i64,
    pub buffer: String,
    /// ms since epoch.
    pub time: i64,
    pub kind: EventKind,
    pub msgid: String,
    /// Canonical JSON of the tag map as stored.
    pub tags: String,
    pub params: String,
    pub data: String,
    pub prefix: String,
}

impl StoredEvent {
    /// Event time as an ISO-8601 timestamp for the `server-time` tag.
    pub fn timestamp_iso(&self) -> String {
        DateTime::<Utc>::from_timestamp_millis(self.time)
            .unwrap_or_default()
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    /// Parse the stored tag JSON back into a map.
    pub fn tag_map(&self) -> BTreeMap<String, Option<String>> {
        serde_json::from_str(&self.tags).unwrap_or_default()
    }

    fn from_row(row: EventRow) -> Option<Self> {
        let (user_id, network_id, buffer, time, kind, msgid, tags, data, prefix, params) = row;
        Some(Self {
            user_id,
            network_id,
            buffer: String::from_utf8_lossy(&buffer).into_owned(),
            time,
            kind: EventKind::from_i64(kind)?,
            msgid,
            tags: String::from_utf8_lossy(&tags).into_owned(),
            params: String::from_utf8_lossy(&params).into_owned(),
            data: String::from_utf8_lossy(&data).into_owned(),
            prefix: String::from_utf8_lossy(&prefix).into_owned(),
        })
    }
}

/// Convert join rows to events, reversing descending scans back into
/// chronological order.
pub(crate) fn rows_to_events(rows: Vec<EventRow>, reverse: bool) -> Vec<StoredEvent> {
    let mut events: Vec<StoredEvent> = rows.into_iter().filter_map(StoredEvent::from_row).collect();
    if reverse {
        events.reverse();
    }
    events
}
