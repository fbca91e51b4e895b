//! Stream Client Integration Tests
//!
//! Drives a `StreamClient` against the in-memory fake server: handshake,
//! subscription commands, waits, callbacks, reconnect replay and shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::time::{Instant, timeout};

use quote_stream::domain::market::fields::QUOTE_FIELDS;
use quote_stream::{
    ConnectionState, DispatchMode, ReconnectConfig, StreamClient, StreamError, StudyParams,
    SubscriptionError,
};

use support::{STEP, session_of, test_config};

async fn wait_until_connected(client: &StreamClient) {
    let mut status = client.watch_status();
    timeout(
        STEP,
        status.wait_for(|status| status.state == ConnectionState::Connected),
    )
    .await
    .expect("client did not reconnect")
    .unwrap();
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn handshake_authenticates_then_replays_offline_subscriptions() {
    let (client, _connector, mut server) = support::client(test_config());
    client.subscribe("abc").unwrap();
    assert!(!client.is_connected());

    let mut conn = support::connect(&client, &mut server).await;
    assert!(client.is_connected());

    let setup = conn.until("quote_add_symbols").await;
    let methods: Vec<&str> = setup.iter().map(|m| m.method.as_str()).collect();
    assert_eq!(
        methods,
        ["quote_create_session", "quote_set_fields", "quote_add_symbols"]
    );

    let session = session_of(&setup[0]);
    assert!(session.starts_with("qs_"));
    assert_eq!(setup[1].params.len(), QUOTE_FIELDS.len() + 1);
    assert_eq!(setup[2].params, vec![json!(session), json!("BIST:ABC")]);

    client.disconnect().await;
}

#[tokio::test]
async fn heartbeats_are_echoed_verbatim() {
    let (client, _connector, mut server) = support::client(test_config());
    let mut conn = support::connect(&client, &mut server).await;

    conn.raw("~m~4~m~~h~7");
    assert_eq!(conn.next_chunk().await, "~m~4~m~~h~7");

    client.disconnect().await;
}

#[tokio::test]
async fn ping_measures_until_the_service_answers() {
    let (client, _connector, mut server) = support::client(test_config());
    let mut conn = support::connect(&client, &mut server).await;

    let pinging = {
        let client = client.clone();
        tokio::spawn(async move { client.ping(Duration::from_secs(2)).await })
    };
    let sent = conn.next_chunk().await;
    assert!(sent.starts_with("~m~") && sent.contains("~h~"), "{sent}");

    tokio::time::sleep(Duration::from_millis(20)).await;
    conn.raw("~m~4~m~~h~9");
    let latency = pinging.await.unwrap().unwrap();
    assert!(latency >= Duration::from_millis(20));
    assert_eq!(conn.next_chunk().await, "~m~4~m~~h~9");

    client.disconnect().await;
}

#[tokio::test]
async fn critical_error_before_hello_fails_connect() {
    let config = quote_stream::StreamConfig {
        reconnect: ReconnectConfig {
            max_attempts: 1,
            initial_delay: Duration::from_millis(10),
            ..ReconnectConfig::default()
        },
        ..test_config()
    };
    let (client, _connector, mut server) = support::client(config);

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    for _ in 0..2 {
        let conn = server.accept().await;
        conn.send("critical_error", json!(["invalid session"]));
    }

    let error = connecting.await.unwrap().unwrap_err();
    assert_eq!(error, StreamError::Connection("invalid session".to_string()));
    assert_eq!(client.status().state, ConnectionState::Disconnected);
    client.disconnect().await;
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test]
async fn repeated_subscribe_sends_one_command() {
    let (client, _connector, mut server) = support::client(test_config());
    let mut conn = support::connect(&client, &mut server).await;

    client.subscribe("ABC").unwrap();
    client.subscribe("abc").unwrap();
    client.subscribe(" ABC ").unwrap();

    let setup = conn.until("quote_add_symbols").await;
    assert_eq!(setup.len(), 3);
    assert!(conn.drain_methods(Duration::from_millis(200)).await.is_empty());
    assert_eq!(client.subscribed_symbols(), vec!["ABC".to_string()]);

    client.disconnect().await;
}

#[tokio::test]
async fn unsubscribe_removes_symbol_and_cache() {
    let (client, _connector, mut server) = support::client(test_config());
    let mut conn = support::connect(&client, &mut server).await;

    client.subscribe("ABC").unwrap();
    let session = session_of(&conn.until("quote_add_symbols").await[0]);
    conn.quote(&session, "BIST:ABC", json!({"lp": 12.0}));
    client
        .wait_for_quote("ABC", Duration::from_secs(2))
        .await
        .unwrap();

    client.unsubscribe("ABC").unwrap();
    let removed = conn.next_message().await;
    assert_eq!(removed.method, "quote_remove_symbols");
    assert_eq!(removed.params, vec![json!(session), json!("BIST:ABC")]);
    assert!(client.get_quote("ABC").is_none());
    assert!(client.subscribed_symbols().is_empty());

    client.disconnect().await;
}

#[tokio::test]
async fn qualified_and_short_symbols_share_one_feed() {
    let (client, _connector, mut server) = support::client(test_config());
    let mut conn = support::connect(&client, &mut server).await;

    client.subscribe("ABC").unwrap();
    let session = session_of(&conn.until("quote_add_symbols").await[0]);
    client.subscribe("BIST:ABC").unwrap();
    assert!(conn.drain_methods(Duration::from_millis(200)).await.is_empty());
    assert_eq!(
        client.subscribed_symbols(),
        vec!["ABC".to_string(), "BIST:ABC".to_string()]
    );

    conn.quote(&session, "BIST:ABC", json!({"lp": 3.5}));
    let short = client
        .wait_for_quote("ABC", Duration::from_secs(2))
        .await
        .unwrap();
    let qualified = client
        .wait_for_quote("BIST:ABC", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(short.last(), Some(3.5));
    assert_eq!(qualified.last(), Some(3.5));

    client.unsubscribe("BIST:ABC").unwrap();
    assert!(conn.drain_methods(Duration::from_millis(200)).await.is_empty());
    assert!(client.get_quote("ABC").is_some());

    client.unsubscribe("ABC").unwrap();
    let removed = conn.next_message().await;
    assert_eq!(removed.method, "quote_remove_symbols");
    assert_eq!(removed.params, vec![json!(session), json!("BIST:ABC")]);

    client.disconnect().await;
}

#[tokio::test]
async fn study_requires_an_active_chart() {
    let (client, _connector, mut server) = support::client(test_config());
    let mut conn = support::connect(&client, &mut server).await;

    client.subscribe_chart("ABC", "1h").unwrap();
    let chart = conn.until("create_series").await;
    let methods: Vec<&str> = chart.iter().map(|m| m.method.as_str()).collect();
    assert_eq!(
        methods,
        ["chart_create_session", "resolve_symbol", "create_series"]
    );
    let session = session_of(&chart[0]);
    assert_eq!(chart[2].param_str(4), Some("60"));

    let error = client
        .add_study("ABC", "1h", "rsi", StudyParams::new().with("length", 14))
        .unwrap_err();
    assert!(matches!(
        error,
        StreamError::Subscription(SubscriptionError::ChartNotActive(_))
    ));

    conn.bars(&session, &[[1_700_000_000.0, 10.0, 11.0, 9.5, 10.5, 1000.0]]);
    let candle = client
        .wait_for_candle("ABC", "1h", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(candle.close, 10.5);

    let key = client
        .add_study("ABC", "1h", "rsi", StudyParams::new().with("length", 14))
        .unwrap();
    assert_eq!(key.name, "RSI");

    let create = conn.next_message().await;
    assert_eq!(create.method, "create_study");
    assert_eq!(create.param_str(0), Some(session.as_str()));
    let study_id = create.param_str(1).unwrap().to_string();
    assert_eq!(create.params[5]["pineId"], "STD;RSI");

    conn.study_row(&session, &study_id, json!([1_700_000_000.0, 55.5]));
    let values = client
        .wait_for_study("ABC", "1h", "RSI", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(values.get("value"), Some(55.5));
    assert_eq!(client.get_studies("ABC", "1h").len(), 1);

    client.remove_study("ABC", "1h", "rsi").unwrap();
    let removed = conn.next_message().await;
    assert_eq!(removed.method, "remove_study");
    assert_eq!(removed.param_str(1), Some(study_id.as_str()));
    assert!(client.get_study("ABC", "1h", "rsi").is_none());

    client.disconnect().await;
}

// =============================================================================
// Waits
// =============================================================================

#[tokio::test]
async fn wait_returns_when_the_update_arrives() {
    let (client, _connector, mut server) = support::client(test_config());
    let mut conn = support::connect(&client, &mut server).await;
    client.subscribe("ABC").unwrap();
    let session = session_of(&conn.until("quote_add_symbols").await[0]);

    let started = Instant::now();
    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.wait_for_quote("ABC", Duration::from_secs(2)).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    conn.quote(&session, "BIST:ABC", json!({"lp": 42.5, "ch": 1.5}));

    let quote = waiter.await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(quote.last(), Some(42.5));
    assert_eq!(quote.change(), Some(1.5));

    // Cached now: the next wait returns at once.
    let cached = client
        .wait_for_quote("abc", Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(cached, quote);

    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn wait_times_out_while_other_symbols_update() {
    let (client, _connector, mut server) = support::client(test_config());
    client.subscribe("ABC").unwrap();
    client.subscribe("DEF").unwrap();
    let mut conn = support::connect(&client, &mut server).await;
    let session = session_of(&conn.until("quote_add_symbols").await[0]);

    let def_updates = Arc::new(AtomicUsize::new(0));
    {
        let def_updates = Arc::clone(&def_updates);
        client
            .on_quote("DEF", move |_| {
                def_updates.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    let feeder = tokio::spawn(async move {
        for i in 0..30_u32 {
            conn.quote(&session, "BIST:DEF", json!({"lp": f64::from(i)}));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        conn
    });

    let started = Instant::now();
    let error = client
        .wait_for_quote("ABC", Duration::from_secs(2))
        .await
        .unwrap_err();

    assert_eq!(
        error,
        StreamError::Timeout {
            after: Duration::from_secs(2),
            key: "ABC".to_string(),
        }
    );
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(def_updates.load(Ordering::SeqCst) >= 10);
    assert!(client.get_quote("ABC").is_none());

    let _conn = feeder.await.unwrap();
    client.disconnect().await;
}

// =============================================================================
// Callbacks and Decoding
// =============================================================================

#[tokio::test]
async fn callbacks_run_exact_then_wildcard_and_survive_panics() {
    let (client, _connector, mut server) = support::client(test_config());
    let mut conn = support::connect(&client, &mut server).await;
    client.subscribe("ABC").unwrap();
    let session = session_of(&conn.until("quote_add_symbols").await[0]);

    let calls = Arc::new(Mutex::new(Vec::new()));
    {
        let calls = Arc::clone(&calls);
        client.on_any_quote(move |quote| {
            calls.lock().unwrap().push(format!("any:{:?}", quote.last()));
        });
    }
    client
        .on_quote("ABC", |_| panic!("handler failure"))
        .unwrap();
    {
        let calls = Arc::clone(&calls);
        client
            .on_quote("ABC", move |quote| {
                calls.lock().unwrap().push(format!("abc:{:?}", quote.last()));
            })
            .unwrap();
    }

    conn.quote(&session, "BIST:ABC", json!({"lp": 1.0}));
    conn.quote(&session, "BIST:ABC", json!({"lp": 2.0}));

    timeout(STEP, async {
        while calls.lock().unwrap().len() < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(
        *calls.lock().unwrap(),
        ["abc:Some(1.0)", "any:Some(1.0)", "abc:Some(2.0)", "any:Some(2.0)"]
    );
    assert!(client.is_connected());

    client.disconnect().await;
}

#[tokio::test]
async fn worker_dispatch_preserves_order() {
    let config = quote_stream::StreamConfig {
        dispatch: DispatchMode::Worker(4),
        ..test_config()
    };
    let (client, _connector, mut server) = support::client(config);
    let mut conn = support::connect(&client, &mut server).await;
    client.subscribe("ABC").unwrap();
    let session = session_of(&conn.until("quote_add_symbols").await[0]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        client
            .on_quote("ABC", move |quote| {
                seen.lock().unwrap().push(quote.last().unwrap_or_default());
            })
            .unwrap();
    }

    for i in 0..50_u32 {
        conn.quote(&session, "BIST:ABC", json!({"lp": f64::from(i)}));
    }

    timeout(STEP, async {
        while seen.lock().unwrap().len() < 50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let expected: Vec<f64> = (0..50_u32).map(f64::from).collect();
    assert_eq!(*seen.lock().unwrap(), expected);

    client.disconnect().await;
}

#[tokio::test]
async fn split_and_malformed_frames_are_tolerated() {
    let (client, _connector, mut server) = support::client(test_config());
    let mut conn = support::connect(&client, &mut server).await;
    client.subscribe("ABC").unwrap();
    let session = session_of(&conn.until("quote_add_symbols").await[0]);

    // Garbage payload first, then a valid frame split across two chunks.
    conn.raw("~m~9~m~{not json");
    let payload = json!({"m": "qsd", "p": [session, {"n": "BIST:ABC", "s": "ok", "v": {"lp": 3.25}}]})
        .to_string();
    let framed = format!("~m~{}~m~{payload}", payload.chars().count());
    let (head, tail) = framed.split_at(framed.len() / 2);
    conn.raw(head);
    conn.raw(tail);

    let quote = client
        .wait_for_quote("ABC", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(quote.last(), Some(3.25));
    assert!(client.is_connected());

    client.disconnect().await;
}

// =============================================================================
// Reconnect
// =============================================================================

#[tokio::test]
async fn reconnect_replays_every_subscription() {
    let (client, _connector, mut server) = support::client(test_config());
    client.subscribe("ABC").unwrap();
    client.subscribe("DEF").unwrap();
    client.subscribe_chart("ABC", "1d").unwrap();

    let mut conn = support::connect(&client, &mut server).await;
    let first = conn.until("create_series").await;
    let old_quote_session = session_of(&first[0]);
    let chart_session = session_of(
        first
            .iter()
            .find(|m| m.method == "chart_create_session")
            .unwrap(),
    );

    conn.bars(&chart_session, &[[1_700_000_000.0, 1.0, 2.0, 0.5, 1.5, 10.0]]);
    client
        .wait_for_candle("ABC", "1d", Duration::from_secs(2))
        .await
        .unwrap();
    client
        .add_study("ABC", "1d", "MACD", StudyParams::new())
        .unwrap();
    assert_eq!(conn.next_message().await.method, "create_study");

    // Drop the transport.
    conn.fail();
    drop(conn);

    let mut conn = server.accept_ready().await;
    let replay = conn.until("create_series").await;
    let methods: Vec<&str> = replay.iter().map(|m| m.method.as_str()).collect();
    assert_eq!(
        methods,
        [
            "quote_create_session",
            "quote_set_fields",
            "quote_add_symbols",
            "chart_create_session",
            "resolve_symbol",
            "create_series",
        ]
    );

    let new_quote_session = session_of(&replay[0]);
    assert_ne!(new_quote_session, old_quote_session);
    assert_eq!(
        replay[2].params,
        vec![json!(new_quote_session), json!("BIST:ABC"), json!("BIST:DEF")]
    );

    // The study waits for the chart to be acknowledged.
    let new_chart_session = session_of(&replay[3]);
    conn.send("symbol_resolved", json!([new_chart_session, "BIST:ABC", {}]));
    let study = conn.next_message().await;
    assert_eq!(study.method, "create_study");
    assert_eq!(study.param_str(0), Some(new_chart_session.as_str()));

    wait_until_connected(&client).await;
    assert_eq!(client.reconnect_count(), 1);
    assert_eq!(client.status().attempt, 0);
    assert!(client.status().last_error.is_none());

    // Cached values survived; new updates land on the new session.
    assert!(client.get_candle("ABC", "1d").is_some());
    conn.quote(&new_quote_session, "BIST:DEF", json!({"lp": 7.0}));
    let quote = client
        .wait_for_quote("DEF", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(quote.last(), Some(7.0));

    client.disconnect().await;
}

#[tokio::test]
async fn commands_issued_while_offline_are_replayed_not_queued() {
    let (client, _connector, mut server) = support::client(test_config());
    let conn = support::connect(&client, &mut server).await;

    conn.fail();
    drop(conn);
    // Between connections nothing is routed to a transport.
    client.subscribe("XYZ").unwrap();

    let mut conn = server.accept_ready().await;
    let replay = conn.until("quote_add_symbols").await;
    let session = session_of(&replay[0]);
    assert_eq!(replay[2].params, vec![json!(session), json!("BIST:XYZ")]);
    assert!(conn.drain_methods(Duration::from_millis(200)).await.is_empty());

    client.disconnect().await;
}

#[tokio::test]
async fn connect_after_giving_up_starts_over() {
    let config = quote_stream::StreamConfig {
        reconnect: ReconnectConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            jitter_factor: 0.0,
            ..ReconnectConfig::default()
        },
        ..test_config()
    };
    let (client, connector, mut server) = support::client(config);

    connector.refuse_next(100);
    let error = client.connect().await.unwrap_err();
    assert!(matches!(error, StreamError::Connection(ref m) if m.contains("refused")));
    assert_eq!(connector.dials(), 3);
    assert_eq!(client.status().state, ConnectionState::Disconnected);

    connector.refuse_next(0);
    let _conn = support::connect(&client, &mut server).await;
    assert!(client.is_connected());

    client.disconnect().await;
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn disconnect_releases_transport_and_waiters() {
    let (client, connector, mut server) = support::client(test_config());
    let mut conn = support::connect(&client, &mut server).await;
    client.subscribe("ABC").unwrap();
    let session = session_of(&conn.until("quote_add_symbols").await[0]);
    conn.quote(&session, "BIST:ABC", json!({"lp": 5.0}));
    client
        .wait_for_quote("ABC", Duration::from_secs(2))
        .await
        .unwrap();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.wait_for_quote("DEF", Duration::from_secs(30)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.disconnect().await;

    assert_eq!(waiter.await.unwrap().unwrap_err(), StreamError::Closed);
    assert!(conn.closed_by_client().await);
    assert_eq!(client.status().state, ConnectionState::Closed);

    // No reconnect attempts after close.
    let dials = connector.dials();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(connector.dials(), dials);

    // Cache stays readable; new intent is refused.
    assert_eq!(client.get_quote("ABC").unwrap().last(), Some(5.0));
    assert_eq!(client.subscribe("DEF"), Err(StreamError::Closed));
    client.disconnect().await;
}

#[tokio::test]
async fn dropping_the_last_handle_closes_the_transport() {
    let (client, _connector, mut server) = support::client(test_config());
    let mut conn = support::connect(&client, &mut server).await;

    drop(client);
    assert!(conn.closed_by_client().await);
}
