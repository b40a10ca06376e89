//! # slirc-history
//!
//! Persistent chat history store for the slirc bouncer.
//!
//! The bouncer's socket and protocol layers hand this crate parsed
//! PRIVMSG/NOTICE records for each (user, network) pair; the store
//! persists them durably and serves the bounded, time-ordered range
//! queries that back `draft/chathistory` replay.
//!
//! # Architecture
//!
//! - One embedded SQLite file per bouncer instance (WAL journal): an
//!   append-only `events` log referencing a content-addressed `payloads`
//!   pool, so repeated buffer names, tag bundles, and prefixes are stored
//!   once.
//! - Ingest is serialized: `store` enqueues, a single worker persists one
//!   event per tracked write transaction. Queries run on a read pool
//!   concurrently with the writer.
//! - A retention task prunes expired events in bounded batches (channels
//!   and PMs age out independently) and sweeps the payload pool for rows
//!   the batch orphaned.
//!
//! # Quick start
//!
//! ```no_run
//! use slirc_history::{HistoryConfig, Message, MessageStore, Source, StoreContext};
//!
//! # async fn run() -> Result<(), slirc_history::StoreError> {
//! let config = HistoryConfig::default();
//! let store = MessageStore::open(&config).await?;
//!
//! let msg = Message {
//!     tags: Vec::new(),
//!     prefix: Some("alice!a@example.net".into()),
//!     command: "PRIVMSG".into(),
//!     params: vec!["#rust".into(), "hello".into()],
//! };
//! let ctx = StoreContext { user_id: 1, network_id: 1, nick: "me".into() };
//! store.store(&msg, &ctx, Source::Upstream);
//!
//! let history = store.query_before_time(1, 1, "#rust", i64::MAX, None).await;
//! # let _ = history;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
mod store;

pub use config::HistoryConfig;
pub use error::StoreError;
pub use message::{Message, Source, StoreContext, Tag};
pub use store::{DEFAULT_QUERY_LIMIT, EventKind, MessageStore, QueryBound, StoredEvent};
