//! Inbound message records and store context.
//!
//! IRC line parsing is the bouncer's concern; the store consumes messages
//! that have already been split into tags, prefix, command, and parameters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// A single IRCv3 message tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    /// Tag value; `None` for valueless tags.
    pub value: Option<String>,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        Self {
            key: key.into(),
            value: value.map(Into::into),
        }
    }
}

/// A parsed inbound IRC message.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// IRCv3 message tags, in wire order.
    pub tags: Vec<Tag>,
    /// Full sender prefix (`nick` or `nick!user@host`), if present.
    pub prefix: Option<String>,
    /// Command name, e.g. `PRIVMSG`.
    pub command: String,
    /// Command parameters; the trailing parameter is the last entry.
    pub params: Vec<String>,
}

impl Message {
    /// Look up a tag value by key. Valueless tags yield an empty string.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_deref().unwrap_or(""))
    }

    /// Nick portion of the prefix, if any.
    pub fn prefix_nick(&self) -> Option<&str> {
        self.prefix.as_deref().map(nick_of)
    }
}

/// Identifies the (user, network) pair a message belongs to, plus the
/// user's current nick on that network.
#[derive(Debug, Clone)]
pub struct StoreContext {
    pub user_id: i64,
    pub network_id: i64,
    /// The user's nick on the network at the time of the message.
    pub nick: String,
}

/// Where a message entered the bouncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Received from the IRC server.
    Upstream,
    /// Sent upstream by a locally attached client.
    Client,
}

/// Extract the nick from a `nick!user@host` prefix.
pub(crate) fn nick_of(prefix: &str) -> &str {
    let end = prefix
        .find('!')
        .or_else(|| prefix.find('@'))
        .unwrap_or(prefix.len());
    &prefix[..end]
}

/// Serialize a tag list to its canonical byte form: a JSON object with
/// sorted keys. Equal tag maps always produce equal bytes, which is what
/// makes the tag payload dedupable.
pub(crate) fn canonical_tags(tags: &[Tag]) -> Result<String, serde_json::Error> {
    let map: BTreeMap<&str, Option<&str>> = tags
        .iter()
        .map(|t| (t.key.as_str(), t.value.as_deref()))
        .collect();
    serde_json::to_string(&map)
}

/// Event timestamp in ms since epoch: the `time` tag when present and
/// parseable as ISO-8601, otherwise the current wall clock.
pub(crate) fn event_time(msg: &Message) -> i64 {
    if let Some(value) = msg.tag("time")
        && let Ok(dt) = DateTime::parse_from_rfc3339(value)
    {
        return dt.timestamp_millis();
    }
    Utc::now().timestamp_millis()
}
