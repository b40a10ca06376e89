//! End-to-end ingest and query behavior.

mod common;

use anyhow::Result;
use common::*;
use slirc_history::{EventKind, QueryBound, Source};
use tempfile::tempdir;

const T: i64 = 1_700_000_000_000;

#[tokio::test]
async fn test_from_msgid_returns_following_messages() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(&dir).await?;
    let ctx = ctx();

    store.store(
        &with_time(with_msgid(privmsg("#ops", "hello"), "m1"), T),
        &ctx,
        Source::Upstream,
    );
    store.store(
        &with_time(with_msgid(privmsg("#ops", "world"), "m2"), T + 1),
        &ctx,
        Source::Upstream,
    );
    store.flush().await;

    let events = store.query_from_msgid(1, 1, "#ops", "m1", Some(10)).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data, "world");
    assert_eq!(events[0].msgid, "m2");

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn test_pm_buffer_resolves_to_remote_nick() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(&dir).await?;
    let ctx = ctx();

    // Incoming PM: the IRC target is our own nick; history files it under
    // the sender's buffer.
    store.store(
        &with_time(with_msgid(privmsg("me", "hi"), "p1"), T),
        &ctx,
        Source::Upstream,
    );
    store.flush().await;

    let events = store.query_before_time(1, 1, "alice", T + 10, Some(10)).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].buffer, "alice");
    assert_eq!(events[0].prefix, "alice");
    assert_eq!(events[0].data, "hi");

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn test_roundtrip_fields_exact() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(&dir).await?;
    let ctx = ctx();

    let msg = with_tag(
        with_time(with_msgid(privmsg("#rust", "borrow checker!"), "r1"), T),
        "account",
        "alice",
    );
    store.store(&msg, &ctx, Source::Upstream);
    store.flush().await;

    let events = store.query_between(1, 1, "#rust", None, None, None).await;
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.kind, EventKind::Privmsg);
    assert_eq!(event.kind.command(), "PRIVMSG");
    assert_eq!(event.prefix, "alice");
    assert_eq!(event.params, "#rust");
    assert_eq!(event.data, "borrow checker!");
    assert_eq!(event.msgid, "r1");
    assert_eq!(event.time, T);
    assert_eq!(event.timestamp_iso(), iso(T));
    assert_eq!(event.tag_map().get("time"), Some(&Some(iso(T))));
    assert_eq!(event.tag_map().get("account"), Some(&Some("alice".into())));

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn test_repeated_store_dedups_payloads_not_events() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(&dir).await?;
    let ctx = ctx();

    let msg = with_time(privmsg("#ops", "same message"), T);
    store.store(&msg, &ctx, Source::Upstream);
    store.store(&msg, &ctx, Source::Upstream);
    store.flush().await;

    let pool = raw_pool(&dir).await?;
    assert_eq!(count_events(&pool).await?, 2);
    assert_eq!(count_payloads(&pool, b"same message").await?, 1);
    assert_eq!(count_payloads(&pool, b"#ops").await?, 1);

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn test_identical_tag_bundles_share_one_payload() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(&dir).await?;
    let ctx = ctx();

    let first = with_tag(privmsg("#ops", "first"), "account", "alice");
    let second = with_tag(privmsg("#ops", "second"), "account", "alice");
    store.store(&first, &ctx, Source::Upstream);
    store.store(&second, &ctx, Source::Upstream);
    store.flush().await;

    let pool = raw_pool(&dir).await?;
    assert_eq!(count_events(&pool).await?, 2);
    assert_eq!(count_payloads(&pool, br#"{"account":"alice"}"#).await?, 1);

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn test_ctcp_filtering() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(&dir).await?;
    let ctx = ctx();

    store.store(
        &with_time(privmsg("#c", "\x01ACTION waves\x01"), T),
        &ctx,
        Source::Upstream,
    );
    store.store(
        &with_time(privmsg("#c", "\x01VERSION\x01"), T + 1),
        &ctx,
        Source::Upstream,
    );
    store.store(
        &with_time(privmsg("#c", "\x01PING abc\x01"), T + 2),
        &ctx,
        Source::Upstream,
    );
    store.flush().await;

    let events = store.query_between(1, 1, "#c", None, None, None).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data, "\x01ACTION waves\x01");

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn test_notice_kind() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(&dir).await?;
    let ctx = ctx();

    let mut msg = with_time(privmsg("#ops", "server says"), T);
    msg.command = "NOTICE".into();
    store.store(&msg, &ctx, Source::Upstream);
    store.flush().await;

    let events = store.query_between(1, 1, "#ops", None, None, None).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Notice);
    assert_eq!(events[0].kind.command(), "NOTICE");

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn test_between_endpoint_semantics() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(&dir).await?;
    let ctx = ctx();

    for i in 0..5 {
        store.store(
            &with_time(
                with_msgid(privmsg("#ops", &format!("msg{i}")), &format!("m{i}")),
                T + i,
            ),
            &ctx,
            Source::Upstream,
        );
    }
    store.flush().await;

    // Full range: the most recent page, ascending.
    let events = store
        .query_between(
            1,
            1,
            "#ops",
            Some(QueryBound::Timestamp(0)),
            Some(QueryBound::Timestamp(i64::MAX)),
            Some(3),
        )
        .await;
    let bodies: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
    assert_eq!(bodies, ["msg2", "msg3", "msg4"]);

    // from is inclusive, to is exclusive.
    let events = store
        .query_between(
            1,
            1,
            "#ops",
            Some(QueryBound::Timestamp(T + 1)),
            Some(QueryBound::Timestamp(T + 3)),
            Some(10),
        )
        .await;
    let bodies: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
    assert_eq!(bodies, ["msg1", "msg2"]);

    // Msgid endpoints resolve to the anchor's time.
    let events = store
        .query_between(
            1,
            1,
            "#ops",
            Some(QueryBound::Msgid("m1".into())),
            Some(QueryBound::Msgid("m4".into())),
            Some(10),
        )
        .await;
    let bodies: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
    assert_eq!(bodies, ["msg1", "msg2", "msg3"]);

    // Unknown msgid endpoint matches nothing.
    let events = store
        .query_between(
            1,
            1,
            "#ops",
            Some(QueryBound::Msgid("nope".into())),
            None,
            Some(10),
        )
        .await;
    assert!(events.is_empty());

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_msgid_returns_empty() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(&dir).await?;
    let ctx = ctx();

    store.store(&with_time(privmsg("#ops", "hi"), T), &ctx, Source::Upstream);
    store.flush().await;

    assert!(store.query_from_msgid(1, 1, "#ops", "missing", None).await.is_empty());
    assert!(store.query_before_msgid(1, 1, "#ops", "missing", None).await.is_empty());

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn test_before_msgid_includes_anchor() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(&dir).await?;
    let ctx = ctx();

    for i in 0..3 {
        store.store(
            &with_time(
                with_msgid(privmsg("#ops", &format!("msg{i}")), &format!("m{i}")),
                T + i,
            ),
            &ctx,
            Source::Upstream,
        );
    }
    store.flush().await;

    let events = store.query_before_msgid(1, 1, "#ops", "m1", Some(10)).await;
    let bodies: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
    assert_eq!(bodies, ["msg0", "msg1"]);

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn test_time_cursor_strictness_and_tie_order() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(&dir).await?;
    let ctx = ctx();

    // Three events share one timestamp; insertion order must hold.
    for name in ["a", "b", "c"] {
        store.store(&with_time(privmsg("#ops", name), T), &ctx, Source::Upstream);
    }
    store.flush().await;

    // Strictly-greater cursor excludes the shared timestamp entirely.
    assert!(store.query_from_time(1, 1, "#ops", T, None).await.is_empty());

    let events = store.query_from_time(1, 1, "#ops", T - 1, None).await;
    let bodies: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
    assert_eq!(bodies, ["a", "b", "c"]);

    let events = store.query_before_time(1, 1, "#ops", T, Some(2)).await;
    let bodies: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
    assert_eq!(bodies, ["b", "c"]);

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn test_default_query_limit() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(&dir).await?;
    let ctx = ctx();

    for i in 0..60 {
        store.store(
            &with_time(privmsg("#busy", &format!("msg{i}")), T + i),
            &ctx,
            Source::Upstream,
        );
    }
    store.flush().await;

    let events = store.query_between(1, 1, "#busy", None, None, None).await;
    assert_eq!(events.len(), 50);
    // The page holds the most recent 50, oldest first.
    assert_eq!(events[0].data, "msg10");
    assert_eq!(events[49].data, "msg59");
    assert!(events.windows(2).all(|w| w[0].time <= w[1].time));

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn test_buffers_are_isolated_per_user_and_network() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(&dir).await?;

    let alice_ctx = ctx();
    let bob_ctx = slirc_history::StoreContext {
        user_id: 2,
        network_id: 1,
        nick: "bob".into(),
    };
    let other_net = slirc_history::StoreContext {
        user_id: 1,
        network_id: 9,
        nick: "me".into(),
    };

    store.store(&with_time(privmsg("#ops", "mine"), T), &alice_ctx, Source::Upstream);
    store.store(&with_time(privmsg("#ops", "bobs"), T), &bob_ctx, Source::Upstream);
    store.store(&with_time(privmsg("#ops", "elsewhere"), T), &other_net, Source::Upstream);
    store.flush().await;

    let events = store.query_between(1, 1, "#ops", None, None, None).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data, "mine");

    // Buffer comparison is byte-exact: case differences are distinct buffers.
    assert!(store.query_between(1, 1, "#OPS", None, None, None).await.is_empty());

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn test_client_sent_pm_files_under_target() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(&dir).await?;
    let ctx = ctx();

    // Our own client messaged bob; prefix is our nick, buffer is bob.
    let mut msg = with_time(privmsg("bob", "hey bob"), T);
    msg.prefix = None;
    store.store(&msg, &ctx, Source::Client);
    store.flush().await;

    let events = store.query_between(1, 1, "bob", None, None, None).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].prefix, "me");
    assert_eq!(events[0].buffer, "bob");

    store.close().await;
    Ok(())
}
